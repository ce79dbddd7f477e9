//! Constant-pool handles.
//!
//! The surrounding tool owns the interning pool; method bodies only carry
//! opaque indices into it. Two handles are equal exactly when they name the
//! same pool slot.

use std::fmt;

/// Index into the string pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StringRef(pub u32);

/// Index into the type pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeRef(pub u32);

/// Index into the field pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldRef(pub u32);

/// Index into the method pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodRef(pub u32);

/// A constant-pool reference operand attached to an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolRef {
    String(StringRef),
    Type(TypeRef),
    Field(FieldRef),
    Method(MethodRef),
}

impl PoolRef {
    /// The raw pool index, whatever the kind.
    pub fn index(self) -> u32 {
        match self {
            PoolRef::String(StringRef(i)) => i,
            PoolRef::Type(TypeRef(i)) => i,
            PoolRef::Field(FieldRef(i)) => i,
            PoolRef::Method(MethodRef(i)) => i,
        }
    }

    /// The field handle, if this is a field reference.
    pub fn field(self) -> Option<FieldRef> {
        match self {
            PoolRef::Field(f) => Some(f),
            _ => None,
        }
    }

    /// The method handle, if this is a method reference.
    pub fn method(self) -> Option<MethodRef> {
        match self {
            PoolRef::Method(m) => Some(m),
            _ => None,
        }
    }

    /// The type handle, if this is a type reference.
    pub fn type_ref(self) -> Option<TypeRef> {
        match self {
            PoolRef::Type(t) => Some(t),
            _ => None,
        }
    }
}

impl fmt::Display for PoolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolRef::String(StringRef(i)) => write!(f, "string@{}", i),
            PoolRef::Type(TypeRef(i)) => write!(f, "type@{}", i),
            PoolRef::Field(FieldRef(i)) => write!(f, "field@{}", i),
            PoolRef::Method(MethodRef(i)) => write!(f, "method@{}", i),
        }
    }
}
