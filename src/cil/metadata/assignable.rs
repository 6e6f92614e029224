use crate::cil::metadata::{TypeFlavor, TypeId};
use crate::cil::names::TypeName;
use crate::cil::types::{CilType, StackType};
use std::collections::HashSet;

/// Subtyping relationship between types
pub trait Assignable {
    /// Is the first type assignable to the second?
    fn is_assignable(&self, super_type: &Self) -> bool;
}

/// This does a traversal of super types in the metadata graph to determine assignability
impl<'g> Assignable for TypeId<'g> {
    fn is_assignable(&self, super_type: &TypeId<'g>) -> bool {
        if self == super_type {
            return true;
        }

        // Arrays have a small, closed set of super types plus unsound element covariance
        if let TypeFlavor::Array { element } = &self.0.flavor {
            return match &super_type.0.flavor {
                TypeFlavor::Array {
                    element: super_element,
                } => array_element_assignable(element, super_element),
                _ => super_type.name == TypeName::OBJECT || super_type.name == TypeName::ARRAY,
            };
        }

        let mut supertypes_to_visit: Vec<TypeId<'g>> = vec![*self];
        let mut dont_revisit: HashSet<TypeId<'g>> = HashSet::new();
        dont_revisit.insert(*self);

        // Optimization: if the super type is not an interface, skip visiting interface edges
        let super_is_class: bool = !super_type.is_interface();

        while let Some(type_data) = supertypes_to_visit.pop() {
            if type_data == *super_type {
                return true;
            }
            let type_data = type_data.0;

            if let Some(base) = type_data.base {
                if dont_revisit.insert(base) {
                    supertypes_to_visit.push(base);
                }
            }
            if !super_is_class {
                for interface in &type_data.interfaces {
                    if dont_revisit.insert(*interface) {
                        supertypes_to_visit.push(*interface);
                    }
                }
            }
        }

        false
    }
}

/// Element-wise array covariance: reference elements vary, everything else must match exactly
fn array_element_assignable<'g>(element: &CilType<'g>, super_element: &CilType<'g>) -> bool {
    if element == super_element {
        return true;
    }
    match (element, super_element) {
        (CilType::Ref(sub), CilType::Ref(sup)) => {
            !sub.is_value_type() && !sup.is_value_type() && sub.is_assignable(sup)
        }
        _ => false,
    }
}

/// The verification-type relation the whole verifier funnels through
///
/// This is the only place subtyping between stack types is defined. Note what is deliberately
/// absent: integer narrowing, `float32`/`float64` interchange, and value-type substitution all
/// require explicit conversions, so they are not assignable here.
impl<'g> Assignable for StackType<'g> {
    fn is_assignable(&self, super_type: &StackType<'g>) -> bool {
        use StackType::*;
        match (self, super_type) {
            (Int32, Int32) => true,
            (Int64, Int64) => true,
            (NativeInt, NativeInt) => true,
            // `int32` widens to the native size, never the other way around
            (Int32, NativeInt) => true,
            (Float32, Float32) => true,
            (Float64, Float64) => true,
            (NullLiteral, NullLiteral) => true,
            (NullLiteral, Reference(_)) => true,
            (Reference(t1), Reference(t2)) => t1.is_assignable(t2),
            (Value(t1), Value(t2)) => t1 == t2,
            (ManagedPointer(p1), ManagedPointer(p2)) => p1 == p2,
            _ => false,
        }
    }
}
