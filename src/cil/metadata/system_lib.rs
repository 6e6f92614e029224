//! Well-known `System.*` types, registered once per graph
//!
//! The verifier needs to reason about a handful of core types: everything derives from
//! `System.Object`, arrays share `System.Array`, catch handlers require `System.Exception`
//! descendants, and boxing needs a graph entry for each primitive. Registering them in one place
//! keeps every emitter sharing a graph agreed on their identities.

use crate::cil::metadata::{
    CtorData, CtorId, TypeAttributes, TypeData, TypeFlavor, TypeGraph, TypeId,
};
use crate::cil::names::TypeName;
use crate::cil::types::{BaseType, CilType};

/// Ids of the well-known types every [`TypeGraph`] starts from
pub struct SystemLibrary<'g> {
    pub object: TypeId<'g>,
    pub value_type: TypeId<'g>,
    pub string: TypeId<'g>,
    pub array: TypeId<'g>,
    pub exception: TypeId<'g>,

    pub boolean: TypeId<'g>,
    pub char: TypeId<'g>,
    pub sbyte: TypeId<'g>,
    pub byte: TypeId<'g>,
    pub int16: TypeId<'g>,
    pub uint16: TypeId<'g>,
    pub int32: TypeId<'g>,
    pub uint32: TypeId<'g>,
    pub int64: TypeId<'g>,
    pub uint64: TypeId<'g>,
    pub intptr: TypeId<'g>,
    pub uintptr: TypeId<'g>,
    pub single: TypeId<'g>,
    pub double: TypeId<'g>,

    /// `System.Object::.ctor()`
    pub object_ctor: CtorId<'g>,

    /// `System.Exception::.ctor()`
    pub exception_ctor: CtorId<'g>,

    /// `System.Exception::.ctor(System.String)`
    pub exception_ctor_message: CtorId<'g>,
}

impl<'g> SystemLibrary<'g> {
    pub fn add_to_graph(graph: &'g TypeGraph<'g>) -> SystemLibrary<'g> {
        let class = |name: TypeName, base: Option<TypeId<'g>>| {
            graph.add_type(TypeData::new(
                name,
                base,
                TypeFlavor::Class,
                TypeAttributes::PUBLIC,
            ))
        };

        let object = class(TypeName::OBJECT, None);
        let value_type = class(TypeName::VALUE_TYPE, Some(object));
        let string = graph.add_type(TypeData::new(
            TypeName::STRING,
            Some(object),
            TypeFlavor::Class,
            TypeAttributes::PUBLIC | TypeAttributes::SEALED,
        ));
        let array = graph.add_type(TypeData::new(
            TypeName::ARRAY,
            Some(object),
            TypeFlavor::Class,
            TypeAttributes::PUBLIC | TypeAttributes::ABSTRACT,
        ));
        let exception = class(TypeName::EXCEPTION, Some(object));

        let primitive = |name: TypeName| {
            graph.add_type(TypeData::new(
                name,
                Some(value_type),
                TypeFlavor::ValueType,
                TypeAttributes::PUBLIC | TypeAttributes::SEALED,
            ))
        };

        let boolean = primitive(TypeName::BOOLEAN);
        let char = primitive(TypeName::CHAR);
        let sbyte = primitive(TypeName::SBYTE);
        let byte = primitive(TypeName::BYTE);
        let int16 = primitive(TypeName::INT16);
        let uint16 = primitive(TypeName::UINT16);
        let int32 = primitive(TypeName::INT32);
        let uint32 = primitive(TypeName::UINT32);
        let int64 = primitive(TypeName::INT64);
        let uint64 = primitive(TypeName::UINT64);
        let intptr = primitive(TypeName::INT_PTR);
        let uintptr = primitive(TypeName::UINT_PTR);
        let single = primitive(TypeName::SINGLE);
        let double = primitive(TypeName::DOUBLE);

        let object_ctor = graph.add_constructor(CtorData {
            class: object,
            parameters: vec![],
        });
        let exception_ctor = graph.add_constructor(CtorData {
            class: exception,
            parameters: vec![],
        });
        let exception_ctor_message = graph.add_constructor(CtorData {
            class: exception,
            parameters: vec![CilType::Ref(string)],
        });

        SystemLibrary {
            object,
            value_type,
            string,
            array,
            exception,
            boolean,
            char,
            sbyte,
            byte,
            int16,
            uint16,
            int32,
            uint32,
            int64,
            uint64,
            intptr,
            uintptr,
            single,
            double,
            object_ctor,
            exception_ctor,
            exception_ctor_message,
        }
    }

    /// The graph entry a boxed primitive becomes a reference to
    pub fn boxed_base(&self, base: BaseType) -> TypeId<'g> {
        match base {
            BaseType::Boolean => self.boolean,
            BaseType::Char => self.char,
            BaseType::Int8 => self.sbyte,
            BaseType::UInt8 => self.byte,
            BaseType::Int16 => self.int16,
            BaseType::UInt16 => self.uint16,
            BaseType::Int32 => self.int32,
            BaseType::UInt32 => self.uint32,
            BaseType::Int64 => self.int64,
            BaseType::UInt64 => self.uint64,
            BaseType::NativeInt => self.intptr,
            BaseType::NativeUInt => self.uintptr,
            BaseType::Float32 => self.single,
            BaseType::Float64 => self.double,
        }
    }
}
