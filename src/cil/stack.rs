//! Persistent model of the evaluation stack
//!
//! Branch verification needs to remember "what did the stack look like when we jumped here?" long
//! after the live stack has moved on. Rather than cloning a vector at every branch site, the stack
//! is a persistent singly-linked list: pushing allocates one node, popping returns the shared
//! tail, and every snapshot taken along the way stays valid for free.

use crate::cil::types::StackType;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Stable hash of a stack shape, used as a map key for branch bookkeeping
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct StackIdentity(u64);

struct Node<'g> {
    ty: StackType<'g>,
    below: Option<Rc<Node<'g>>>,
}

/// Immutable evaluation-stack shape at one program point
///
/// All operations return a new stack; the receiver is never mutated. Structural sharing makes
/// `push`/`pop_n` cheap and snapshots (plain `clone`) O(1).
#[derive(Clone, Default)]
pub struct AbstractStack<'g> {
    top: Option<Rc<Node<'g>>>,
    depth: usize,
}

impl<'g> AbstractStack<'g> {
    /// Fresh empty stack, as at method entry or after a scope transition
    pub fn root() -> AbstractStack<'g> {
        AbstractStack {
            top: None,
            depth: 0,
        }
    }

    /// Number of slots
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Is this the empty stack (no pushes since the last reset)?
    pub fn is_root(&self) -> bool {
        self.depth == 0
    }

    /// Stack with `ty` on top
    pub fn push(&self, ty: StackType<'g>) -> AbstractStack<'g> {
        AbstractStack {
            top: Some(Rc::new(Node {
                ty,
                below: self.top.clone(),
            })),
            depth: self.depth + 1,
        }
    }

    /// Stack with each type pushed in order (last element of `types` ends up on top)
    pub fn push_all(&self, types: &[StackType<'g>]) -> AbstractStack<'g> {
        types.iter().fold(self.clone(), |s, t| s.push(t.clone()))
    }

    /// The top `n` types (top of stack first), or `None` on underflow
    pub fn top_n(&self, n: usize) -> Option<Vec<StackType<'g>>> {
        if n > self.depth {
            return None;
        }
        let mut out = Vec::with_capacity(n);
        let mut cursor = &self.top;
        for _ in 0..n {
            let node = cursor.as_ref()?;
            out.push(node.ty.clone());
            cursor = &node.below;
        }
        Some(out)
    }

    /// Remove the top `n` slots, returning the remaining stack and the removed types (top first)
    pub fn pop_n(&self, n: usize) -> Option<(AbstractStack<'g>, Vec<StackType<'g>>)> {
        if n > self.depth {
            return None;
        }
        let mut popped = Vec::with_capacity(n);
        let mut cursor = self.top.clone();
        for _ in 0..n {
            let node = cursor?;
            popped.push(node.ty.clone());
            cursor = node.below.clone();
        }
        Some((
            AbstractStack {
                top: cursor,
                depth: self.depth - n,
            },
            popped,
        ))
    }

    /// Iterate the stack from top to bottom
    pub fn iter(&self) -> StackIter<'_, 'g> {
        StackIter {
            cursor: self.top.as_deref(),
        }
    }

    /// Stable hash of the shape, usable as a map key across later pushes and pops
    pub fn unique(&self) -> StackIdentity {
        let mut hasher = DefaultHasher::new();
        self.depth.hash(&mut hasher);
        for ty in self.iter() {
            ty.hash(&mut hasher);
        }
        StackIdentity(hasher.finish())
    }

    /// Render the shape for diagnostics, bottom of the stack first
    pub fn render(&self) -> Vec<String> {
        let mut shapes: Vec<String> = self.iter().map(|t| t.to_string()).collect();
        shapes.reverse();
        shapes
    }
}

pub struct StackIter<'a, 'g> {
    cursor: Option<&'a Node<'g>>,
}

impl<'a, 'g> Iterator for StackIter<'a, 'g> {
    type Item = &'a StackType<'g>;

    fn next(&mut self) -> Option<&'a StackType<'g>> {
        let node = self.cursor?;
        self.cursor = node.below.as_deref();
        Some(&node.ty)
    }
}

/// Structural equality: same depth, same type in every slot
impl<'g> PartialEq for AbstractStack<'g> {
    fn eq(&self, other: &Self) -> bool {
        self.depth == other.depth && self.iter().eq(other.iter())
    }
}

impl<'g> Eq for AbstractStack<'g> {}

impl<'g> fmt::Debug for AbstractStack<'g> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "[{}]", self.render().join(", "))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cil::types::StackType::*;

    #[test]
    fn push_and_pop() {
        let stack = AbstractStack::root().push(Int32).push(Int64);
        assert_eq!(stack.depth(), 2);
        assert!(!stack.is_root());

        let (rest, popped) = stack.pop_n(1).unwrap();
        assert_eq!(popped, vec![Int64]);
        assert_eq!(rest.depth(), 1);

        let (rest, popped) = rest.pop_n(1).unwrap();
        assert_eq!(popped, vec![Int32]);
        assert!(rest.is_root());
    }

    #[test]
    fn underflow() {
        let stack = AbstractStack::root().push(Int32);
        assert!(stack.pop_n(2).is_none());
        assert!(stack.top_n(2).is_none());
        assert_eq!(stack.top_n(1), Some(vec![Int32]));
    }

    #[test]
    fn snapshots_survive_later_mutation() {
        let snapshot = AbstractStack::root().push(Int32);
        let later = snapshot.push(Float64).pop_n(2).unwrap().0;

        // The snapshot still describes its own program point
        assert_eq!(snapshot.top_n(1), Some(vec![Int32]));
        assert!(later.is_root());
    }

    #[test]
    fn structural_equality_and_identity() {
        let a = AbstractStack::root().push(Int32).push(Float64);
        let b = AbstractStack::root().push(Int32).push(Float64);
        let c = AbstractStack::root().push(Float64).push(Int32);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.unique(), b.unique());
        assert_ne!(a.unique(), c.unique());
    }

    #[test]
    fn render_is_bottom_first() {
        let stack = AbstractStack::root().push(Int32).push(Float64);
        assert_eq!(stack.render(), vec!["int32", "float64"]);
    }
}
