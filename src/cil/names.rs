use std::borrow::Cow;
use std::fmt::{Debug, Error as FmtError, Formatter};

/// Names of types, in their namespace-qualified form (eg. `System.Collections.ArrayList`)
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct TypeName(Cow<'static, str>);

/// Names of methods, fields, parameters, and locals
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct MemberName(Cow<'static, str>);

pub trait Name: Sized {
    /// Check if a string would be a valid name
    fn check_valid(name: impl AsRef<str>) -> Result<(), String>;

    /// Extract the raw underlying string data
    fn as_cow(&self) -> &Cow<'static, str>;

    /// Extract the raw underlying string name
    fn as_str(&self) -> &str {
        self.as_cow().as_ref()
    }

    /// Try to construct a name from a string
    fn from_string(name: String) -> Result<Self, String>;
}

impl Name for TypeName {
    fn check_valid(name: impl AsRef<str>) -> Result<(), String> {
        let name = name.as_ref();
        if name.is_empty() {
            Err(String::from("Type name is empty"))
        } else if name.split('.').any(str::is_empty) {
            Err(format!("Type name '{}' has an empty namespace segment", name))
        } else if name.contains(&[';', '/', '\0'][..]) {
            Err(format!("Type name '{}' contains an illegal character", name))
        } else {
            Ok(())
        }
    }

    fn as_cow(&self) -> &Cow<'static, str> {
        &self.0
    }

    fn from_string(name: String) -> Result<Self, String> {
        Self::check_valid(&name)?;
        Ok(TypeName(Cow::Owned(name)))
    }
}

impl Name for MemberName {
    fn check_valid(name: impl AsRef<str>) -> Result<(), String> {
        let name = name.as_ref();
        if name.is_empty() {
            Err(String::from("Member name is empty"))
        } else if name.contains(&['.', ';', '[', '/', '\0'][..]) && name != ".ctor" {
            Err(format!("Member name '{}' contains an illegal character", name))
        } else {
            Ok(())
        }
    }

    fn as_cow(&self) -> &Cow<'static, str> {
        &self.0
    }

    fn from_string(name: String) -> Result<Self, String> {
        Self::check_valid(&name)?;
        Ok(MemberName(Cow::Owned(name)))
    }
}

impl TypeName {
    /// Assemble a name from parts known to be valid at compile time
    pub const fn from_static(name: &'static str) -> TypeName {
        TypeName(Cow::Borrowed(name))
    }

    /// Name of the array type whose elements have this name
    pub fn array(&self) -> TypeName {
        TypeName(Cow::Owned(format!("{}[]", self.as_str())))
    }

    pub const OBJECT: TypeName = TypeName::from_static("System.Object");
    pub const STRING: TypeName = TypeName::from_static("System.String");
    pub const VALUE_TYPE: TypeName = TypeName::from_static("System.ValueType");
    pub const ARRAY: TypeName = TypeName::from_static("System.Array");
    pub const EXCEPTION: TypeName = TypeName::from_static("System.Exception");
    pub const BOOLEAN: TypeName = TypeName::from_static("System.Boolean");
    pub const CHAR: TypeName = TypeName::from_static("System.Char");
    pub const SBYTE: TypeName = TypeName::from_static("System.SByte");
    pub const BYTE: TypeName = TypeName::from_static("System.Byte");
    pub const INT16: TypeName = TypeName::from_static("System.Int16");
    pub const UINT16: TypeName = TypeName::from_static("System.UInt16");
    pub const INT32: TypeName = TypeName::from_static("System.Int32");
    pub const UINT32: TypeName = TypeName::from_static("System.UInt32");
    pub const INT64: TypeName = TypeName::from_static("System.Int64");
    pub const UINT64: TypeName = TypeName::from_static("System.UInt64");
    pub const INT_PTR: TypeName = TypeName::from_static("System.IntPtr");
    pub const UINT_PTR: TypeName = TypeName::from_static("System.UIntPtr");
    pub const SINGLE: TypeName = TypeName::from_static("System.Single");
    pub const DOUBLE: TypeName = TypeName::from_static("System.Double");
}

impl MemberName {
    pub const fn from_static(name: &'static str) -> MemberName {
        MemberName(Cow::Borrowed(name))
    }

    /// Name every constructor carries in metadata
    pub const CTOR: MemberName = MemberName::from_static(".ctor");
}

impl AsRef<str> for TypeName {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl AsRef<str> for MemberName {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl Debug for TypeName {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> Result<(), FmtError> {
        self.0.fmt(formatter)
    }
}

impl Debug for MemberName {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> Result<(), FmtError> {
        self.0.fmt(formatter)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn valid_type_names() {
        assert!(TypeName::from_string(String::from("System.Int32")).is_ok());
        assert!(TypeName::from_string(String::from("Widget")).is_ok());
        assert!(TypeName::from_string(String::from("A.B.C.D")).is_ok());
    }

    #[test]
    fn invalid_type_names() {
        assert!(TypeName::from_string(String::from("")).is_err());
        assert!(TypeName::from_string(String::from("System..Int32")).is_err());
        assert!(TypeName::from_string(String::from("System/Int32")).is_err());
        assert!(TypeName::from_string(String::from(".Leading")).is_err());
    }

    #[test]
    fn member_names() {
        assert!(MemberName::from_string(String::from("ToString")).is_ok());
        assert!(MemberName::from_string(String::from(".ctor")).is_ok());
        assert!(MemberName::from_string(String::from("bad.name")).is_err());
        assert!(MemberName::from_string(String::from("")).is_err());
    }
}
