//! Reflection view of the types and members the emitter can reference
//!
//! While you can always add new types and members to the graph, you cannot remove them. The
//! intuition there is that the graph contains the subgraph of metadata the generated code intends
//! to interact with. As that surface grows, more entries can be declared. Since the graph is
//! append-only, the append operations do _not_ require a mutable reference.
//!
//! ### `*Id<'g>` types
//!
//! Metadata entities are represented with types whose identity, equality, etc. are just wrapping
//! equality of the reference to something in the graph:
//!
//!   - __Type__ is identified by a [`TypeId`] (pointing to a [`TypeData`])
//!   - __Method__ is identified by a [`MethodId`] (pointing to a [`MethodData`])
//!   - __Constructor__ is identified by a [`CtorId`] (pointing to a [`CtorData`])
//!   - __Field__ is identified by a [`FieldId`] (pointing to a [`FieldData`])
//!
//! Since these just wrap references, you can dereference them and crawl the graph to collect
//! related information. The verifier consults the graph read-only: assignability questions bottom
//! out in walks over base-class and interface edges.

use crate::cil::names::{MemberName, Name, TypeName};
use crate::cil::types::CilType;
use crate::util::RefId;
use elsa::map::FrozenMap;
use elsa::FrozenVec;
use std::cell::Cell;
use std::fmt;
use typed_arena::Arena;

mod assignable;
mod system_lib;

pub use assignable::Assignable;
pub use system_lib::SystemLibrary;

pub struct TypeGraphArenas<'g> {
    type_arena: Arena<TypeData<'g>>,
    method_arena: Arena<MethodData<'g>>,
    ctor_arena: Arena<CtorData<'g>>,
    field_arena: Arena<FieldData<'g>>,
}

impl<'g> TypeGraphArenas<'g> {
    pub fn new() -> Self {
        TypeGraphArenas {
            type_arena: Arena::new(),
            method_arena: Arena::new(),
            ctor_arena: Arena::new(),
            field_arena: Arena::new(),
        }
    }
}

impl<'g> Default for TypeGraphArenas<'g> {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the relationships between types and the members on those types
///
/// Whenever you intend to reference a certain set of types/members from emitted code, the
/// recommended approach is to register those onto the graph as early as possible. This makes it
/// possible to use the same ids throughout emission, giving a single consistent view of what
/// exists.
pub struct TypeGraph<'g> {
    arenas: &'g TypeGraphArenas<'g>,
    types: FrozenMap<&'g TypeName, TypeId<'g>>,

    /// Source of distinct owner ids for emitters sharing this graph
    emitter_ids: Cell<u64>,
}

impl<'g> TypeGraph<'g> {
    /// New empty graph
    pub fn new(arenas: &'g TypeGraphArenas<'g>) -> Self {
        TypeGraph {
            arenas,
            types: FrozenMap::new(),
            emitter_ids: Cell::new(0),
        }
    }

    /// Lookup a type by its qualified name
    pub fn lookup_type(&'g self, name: &TypeName) -> Option<TypeId<'g>> {
        self.types.get(name).map(RefId)
    }

    /// Add a new type to the graph
    pub fn add_type(&self, data: TypeData<'g>) -> TypeId<'g> {
        let data: &'g TypeData<'g> = self.arenas.type_arena.alloc(data);
        let type_id: TypeId<'g> = RefId(data);
        self.types.insert(&data.name, type_id);
        type_id
    }

    /// Add a method to the graph and to its declaring type
    ///
    /// Registering the same name and signature twice returns the original entry.
    pub fn add_method(&self, method: MethodData<'g>) -> MethodId<'g> {
        if let Some(m) = method.class.0.methods.iter().find(|m| {
            m.name == method.name
                && m.signature == method.signature
                && m.is_static() == method.is_static()
        }) {
            RefId(m)
        } else {
            let data = RefId(&*self.arenas.method_arena.alloc(method));
            data.class.methods.push(data);
            data
        }
    }

    /// Add a constructor to the graph and to its declaring type
    pub fn add_constructor(&self, ctor: CtorData<'g>) -> CtorId<'g> {
        if let Some(c) = ctor
            .class
            .0
            .constructors
            .iter()
            .find(|c| c.parameters == ctor.parameters)
        {
            RefId(c)
        } else {
            let data = RefId(&*self.arenas.ctor_arena.alloc(ctor));
            data.class.constructors.push(data);
            data
        }
    }

    /// Add a field to the graph and to its declaring type
    pub fn add_field(&self, field: FieldData<'g>) -> FieldId<'g> {
        let data = RefId(&*self.arenas.field_arena.alloc(field));
        data.class.fields.push(data);
        data
    }

    /// The array type whose elements are `element`, interning it on first use
    ///
    /// Array types are regular graph entries, so `int32[]` and `System.String[]` can flow through
    /// the same [`TypeId`] plumbing as any class.
    pub fn array_of(&'g self, element: CilType<'g>) -> TypeId<'g> {
        let name = TypeName::from_string(format!("{}[]", element))
            .expect("rendered type names are always valid");
        if let Some(existing) = self.lookup_type(&name) {
            return existing;
        }
        let base = self
            .lookup_type(&TypeName::ARRAY)
            .or_else(|| self.lookup_type(&TypeName::OBJECT));
        self.add_type(TypeData {
            name,
            base,
            interfaces: vec![],
            flavor: TypeFlavor::Array { element },
            attributes: TypeAttributes::PUBLIC | TypeAttributes::SEALED,
            methods: FrozenVec::new(),
            constructors: FrozenVec::new(),
            fields: FrozenVec::new(),
        })
    }

    /// Register the well-known `System.*` types the verifier reasons about
    pub fn insert_system_library_types(&'g self) -> SystemLibrary<'g> {
        SystemLibrary::add_to_graph(self)
    }

    /// Hand out an owner id for a new emitter
    pub(crate) fn next_emitter_id(&self) -> u64 {
        let id = self.emitter_ids.get();
        self.emitter_ids.set(id + 1);
        id
    }
}

/// Reference to a type in the graph
pub type TypeId<'g> = RefId<'g, TypeData<'g>>;

/// Reference to a method in the graph
pub type MethodId<'g> = RefId<'g, MethodData<'g>>;

/// Reference to a constructor in the graph
pub type CtorId<'g> = RefId<'g, CtorData<'g>>;

/// Reference to a field in the graph
pub type FieldId<'g> = RefId<'g, FieldData<'g>>;

/// What sort of type an entry is
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TypeFlavor<'g> {
    Class,
    Interface,
    ValueType,
    Array { element: CilType<'g> },
}

bitflags::bitflags! {
    pub struct TypeAttributes: u32 {
        const PUBLIC = 0x0001;
        const SEALED = 0x0100;
        const ABSTRACT = 0x0080;
    }
}

bitflags::bitflags! {
    pub struct MethodAttributes: u32 {
        const PUBLIC = 0x0006;
        const STATIC = 0x0010;
        const VIRTUAL = 0x0040;
    }
}

bitflags::bitflags! {
    pub struct FieldAttributes: u32 {
        const PUBLIC = 0x0006;
        const STATIC = 0x0010;
    }
}

/// A type known to the graph
pub struct TypeData<'g> {
    pub name: TypeName,

    /// Base class (`None` only for `System.Object` and interfaces)
    pub base: Option<TypeId<'g>>,

    /// Interfaces implemented directly by this type
    pub interfaces: Vec<TypeId<'g>>,

    pub flavor: TypeFlavor<'g>,
    pub attributes: TypeAttributes,

    /// Members, appended as they are registered
    pub methods: FrozenVec<MethodId<'g>>,
    pub constructors: FrozenVec<CtorId<'g>>,
    pub fields: FrozenVec<FieldId<'g>>,
}

impl<'g> TypeData<'g> {
    /// Fresh class entry with no members registered yet
    pub fn new(
        name: TypeName,
        base: Option<TypeId<'g>>,
        flavor: TypeFlavor<'g>,
        attributes: TypeAttributes,
    ) -> TypeData<'g> {
        TypeData {
            name,
            base,
            interfaces: vec![],
            flavor,
            attributes,
            methods: FrozenVec::new(),
            constructors: FrozenVec::new(),
            fields: FrozenVec::new(),
        }
    }
}

impl<'g> TypeId<'g> {
    pub fn is_value_type(&self) -> bool {
        matches!(self.flavor, TypeFlavor::ValueType)
    }

    pub fn is_interface(&self) -> bool {
        matches!(self.flavor, TypeFlavor::Interface)
    }

    pub fn is_array(&self) -> bool {
        matches!(self.flavor, TypeFlavor::Array { .. })
    }

    /// Element type, when this is an array type
    pub fn element_type(&self) -> Option<&'g CilType<'g>> {
        match &self.0.flavor {
            TypeFlavor::Array { element } => Some(element),
            _ => None,
        }
    }

    /// Does the base-class chain pass through `System.Exception`?
    pub fn is_exception_type(&self) -> bool {
        let mut current = Some(*self);
        while let Some(ty) = current {
            if ty.name == TypeName::EXCEPTION {
                return true;
            }
            current = ty.base;
        }
        false
    }

    /// Lookup a constructor by its exact formal parameter types
    pub fn constructor(&self, parameters: &[CilType<'g>]) -> Option<CtorId<'g>> {
        self.0
            .constructors
            .iter()
            .find(|c| c.parameters == parameters)
            .map(RefId)
    }

    /// Lookup a method by name and exact formal parameter types
    pub fn method(&self, name: &MemberName, parameters: &[CilType<'g>]) -> Option<MethodId<'g>> {
        self.0
            .methods
            .iter()
            .find(|m| &m.name == name && m.signature.parameters == parameters)
            .map(RefId)
    }

    /// Lookup a field by name
    pub fn field(&self, name: &MemberName) -> Option<FieldId<'g>> {
        self.0.fields.iter().find(|f| &f.name == name).map(RefId)
    }
}

/// Parameter and return types of a method or indirect-call signature
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct MethodSig<'g> {
    pub parameters: Vec<CilType<'g>>,

    /// `None` means the method returns `void`
    pub return_type: Option<CilType<'g>>,
}

impl<'g> MethodSig<'g> {
    pub fn new(parameters: Vec<CilType<'g>>, return_type: Option<CilType<'g>>) -> MethodSig<'g> {
        MethodSig {
            parameters,
            return_type,
        }
    }
}

/// A method known to the graph
pub struct MethodData<'g> {
    pub class: TypeId<'g>,
    pub name: MemberName,
    pub signature: MethodSig<'g>,
    pub attributes: MethodAttributes,
}

impl<'g> MethodData<'g> {
    pub fn is_static(&self) -> bool {
        self.attributes.contains(MethodAttributes::STATIC)
    }
}

/// A constructor known to the graph
pub struct CtorData<'g> {
    pub class: TypeId<'g>,
    pub parameters: Vec<CilType<'g>>,
}

/// A field known to the graph
pub struct FieldData<'g> {
    pub class: TypeId<'g>,
    pub name: MemberName,
    pub field_type: CilType<'g>,
    pub attributes: FieldAttributes,
}

impl<'g> FieldData<'g> {
    pub fn is_static(&self) -> bool {
        self.attributes.contains(FieldAttributes::STATIC)
    }
}

impl<'g> fmt::Debug for TypeData<'g> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TypeData")
            .field("name", &self.name)
            .field("flavor", &self.flavor)
            .finish_non_exhaustive()
    }
}

impl<'g> fmt::Debug for MethodData<'g> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}::{:?}", self.class.name.as_str(), self.name)
    }
}

impl<'g> fmt::Debug for CtorData<'g> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}::.ctor", self.class.name.as_str())
    }
}

impl<'g> fmt::Debug for FieldData<'g> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}::{:?}", self.class.name.as_str(), self.name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn constructor_lookup_is_exact() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.insert_system_library_types();

        let widget = graph.add_type(TypeData::new(
            TypeName::from_string(String::from("Acme.Widget")).unwrap(),
            Some(system.object),
            TypeFlavor::Class,
            TypeAttributes::PUBLIC,
        ));
        let ctor = graph.add_constructor(CtorData {
            class: widget,
            parameters: vec![CilType::int32()],
        });

        assert_eq!(widget.constructor(&[CilType::int32()]), Some(ctor));
        assert_eq!(widget.constructor(&[CilType::int64()]), None);
        assert_eq!(widget.constructor(&[]), None);
    }

    #[test]
    fn array_types_are_interned() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let _system = graph.insert_system_library_types();

        let a1 = graph.array_of(CilType::int32());
        let a2 = graph.array_of(CilType::int32());
        assert_eq!(a1, a2);
        assert_eq!(a1.name.as_str(), "int32[]");
        assert!(a1.is_array());
        assert_eq!(a1.element_type(), Some(&CilType::int32()));
    }

    #[test]
    fn exception_chain() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.insert_system_library_types();

        let custom = graph.add_type(TypeData::new(
            TypeName::from_string(String::from("Acme.BadWidget")).unwrap(),
            Some(system.exception),
            TypeFlavor::Class,
            TypeAttributes::PUBLIC,
        ));

        assert!(custom.is_exception_type());
        assert!(system.exception.is_exception_type());
        assert!(!system.object.is_exception_type());
        assert!(!system.string.is_exception_type());
    }
}
