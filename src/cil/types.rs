use crate::cil::metadata::TypeId;
use crate::cil::names::Name;
use std::fmt;

/// Built-in primitive types, as they appear in signatures
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum BaseType {
    Boolean,
    Char,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    NativeInt,
    NativeUInt,
    Float32,
    Float64,
}

/// The type of a signature slot: a parameter, local, field, or return value
///
/// This is the reflection-level view of a type. The evaluation stack works with the coarser
/// [`StackType`]; the mapping between the two is [`CilType::stack_type`].
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum CilType<'g> {
    /// A primitive
    Base(BaseType),

    /// A type from the metadata graph: class, interface, array, or value type
    Ref(TypeId<'g>),

    /// Managed pointer to a slot of the inner type (eg. `int32&`)
    ByRef(Box<CilType<'g>>),
}

impl<'g> CilType<'g> {
    pub fn boolean() -> CilType<'g> {
        CilType::Base(BaseType::Boolean)
    }

    pub fn char() -> CilType<'g> {
        CilType::Base(BaseType::Char)
    }

    pub fn int32() -> CilType<'g> {
        CilType::Base(BaseType::Int32)
    }

    pub fn int64() -> CilType<'g> {
        CilType::Base(BaseType::Int64)
    }

    pub fn native_int() -> CilType<'g> {
        CilType::Base(BaseType::NativeInt)
    }

    pub fn float32() -> CilType<'g> {
        CilType::Base(BaseType::Float32)
    }

    pub fn float64() -> CilType<'g> {
        CilType::Base(BaseType::Float64)
    }

    /// Managed pointer to this type
    pub fn by_ref(self) -> CilType<'g> {
        CilType::ByRef(Box::new(self))
    }

    /// The verification type a value of this type has on the evaluation stack
    pub fn stack_type(&self) -> StackType<'g> {
        match self {
            CilType::Base(base) => match base {
                BaseType::Boolean
                | BaseType::Char
                | BaseType::Int8
                | BaseType::UInt8
                | BaseType::Int16
                | BaseType::UInt16
                | BaseType::Int32
                | BaseType::UInt32 => StackType::Int32,
                BaseType::Int64 | BaseType::UInt64 => StackType::Int64,
                BaseType::NativeInt | BaseType::NativeUInt => StackType::NativeInt,
                BaseType::Float32 => StackType::Float32,
                BaseType::Float64 => StackType::Float64,
            },
            CilType::Ref(id) => {
                if id.is_value_type() {
                    StackType::Value(*id)
                } else {
                    StackType::Reference(*id)
                }
            }
            CilType::ByRef(inner) => StackType::ManagedPointer(inner.clone()),
        }
    }
}

/// The verification type of one slot on the evaluation stack
///
/// These are the types from partition III.1.5 of the CLI specification, which collapses the small
/// integer types into `int32` and distinguishes object references from value types and managed
/// pointers. Two stack types are equal by structural type identity; the subtyping between them
/// lives in [`crate::cil::metadata::Assignable`] and nowhere else.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum StackType<'g> {
    Int32,
    Int64,
    NativeInt,
    Float32,
    Float64,

    /// Reference to an object of a concrete reference type (class, interface, or array)
    Reference(TypeId<'g>),

    /// Managed pointer to a slot of the given type
    ManagedPointer(Box<CilType<'g>>),

    /// A value type, held by value
    Value(TypeId<'g>),

    /// The result of `ldnull`: assignable to every object reference
    NullLiteral,
}

impl<'g> StackType<'g> {
    /// Can the value participate in arithmetic?
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            StackType::Int32
                | StackType::Int64
                | StackType::NativeInt
                | StackType::Float32
                | StackType::Float64
        )
    }

    /// Integer types, the ones bitwise and shift operations accept
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            StackType::Int32 | StackType::Int64 | StackType::NativeInt
        )
    }

    /// Is this an object reference (including the null literal)?
    pub fn is_reference(&self) -> bool {
        matches!(self, StackType::Reference(_) | StackType::NullLiteral)
    }

    /// Types `brtrue`/`brfalse` can test: integers, references, and managed pointers
    pub fn is_truthy(&self) -> bool {
        self.is_integer() || self.is_reference() || matches!(self, StackType::ManagedPointer(_))
    }

    /// Would `ceq`/`beq` accept these two operands?
    pub fn comparable_with(&self, other: &StackType<'g>) -> bool {
        use StackType::*;
        match (self, other) {
            (Int32, Int32) | (Int64, Int64) | (NativeInt, NativeInt) => true,
            (Int32, NativeInt) | (NativeInt, Int32) => true,
            (Float32, Float32) | (Float64, Float64) | (Float32, Float64) | (Float64, Float32) => {
                true
            }
            (ManagedPointer(p1), ManagedPointer(p2)) => p1 == p2,
            (a, b) => a.is_reference() && b.is_reference(),
        }
    }
}

impl fmt::Display for BaseType {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keyword = match self {
            BaseType::Boolean => "bool",
            BaseType::Char => "char",
            BaseType::Int8 => "int8",
            BaseType::UInt8 => "uint8",
            BaseType::Int16 => "int16",
            BaseType::UInt16 => "uint16",
            BaseType::Int32 => "int32",
            BaseType::UInt32 => "uint32",
            BaseType::Int64 => "int64",
            BaseType::UInt64 => "uint64",
            BaseType::NativeInt => "native int",
            BaseType::NativeUInt => "native uint",
            BaseType::Float32 => "float32",
            BaseType::Float64 => "float64",
        };
        formatter.write_str(keyword)
    }
}

impl<'g> fmt::Display for CilType<'g> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CilType::Base(base) => base.fmt(formatter),
            CilType::Ref(id) => formatter.write_str(id.name.as_str()),
            CilType::ByRef(inner) => write!(formatter, "{}&", inner),
        }
    }
}

impl<'g> fmt::Display for StackType<'g> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackType::Int32 => formatter.write_str("int32"),
            StackType::Int64 => formatter.write_str("int64"),
            StackType::NativeInt => formatter.write_str("native int"),
            StackType::Float32 => formatter.write_str("float32"),
            StackType::Float64 => formatter.write_str("float64"),
            StackType::Reference(id) => formatter.write_str(id.name.as_str()),
            StackType::ManagedPointer(inner) => write!(formatter, "{}&", inner),
            StackType::Value(id) => write!(formatter, "valuetype {}", id.name.as_str()),
            StackType::NullLiteral => formatter.write_str("null"),
        }
    }
}
