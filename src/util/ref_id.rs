use stable_deref_trait::StableDeref;
use std::hash::{Hash, Hasher};
use std::ops::Deref;

/// Wrapper whose identity for equality and hashing is the reference itself (ie. the pointer), not
/// the data behind it.
///
/// Metadata entries live in arenas for the lifetime of the graph, so two ids are the same entity
/// exactly when they point at the same arena slot. This is what lets entity ids be `Copy` keys in
/// hash maps without ever cloning the underlying data.
#[derive(Debug)]
pub struct RefId<'a, T: ?Sized>(pub &'a T);

impl<'a, T> Clone for RefId<'a, T> {
    fn clone(&self) -> Self {
        RefId(self.0)
    }
}

impl<'a, T> Copy for RefId<'a, T> {}

impl<'a, T> Hash for RefId<'a, T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(self.0, state)
    }
}

impl<'a, 'b, T> PartialEq<RefId<'b, T>> for RefId<'a, T> {
    fn eq(&self, other: &RefId<'b, T>) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}

impl<'a, T> Eq for RefId<'a, T> {}

impl<'a, T: ?Sized> Deref for RefId<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.0
    }
}

// Needed so ids can be stored in `elsa::FrozenVec`
unsafe impl<'a, T: ?Sized> StableDeref for RefId<'a, T> {}
