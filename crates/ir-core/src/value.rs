//! Values
//!
//! Everything an instruction can take as an operand: the polymorphic
//! union from spec §3 — constant, global, function, instruction,
//! block-address, inline-asm, parameter.

use std::fmt;

use crate::types::Type;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    ConstInt(Type, i64),
    ConstArray(Type, Vec<Value>),
    ConstStruct(Type, Vec<Value>),
    Undef(Type),
    Null(Type),
    ZeroInitializer(Type),
    /// A global variable's address; `Type` is the pointer type.
    Global(Type, String),
    /// A function's address; `Type` is the pointer-to-function type.
    FunctionRef(Type, String),
    Param(Type, usize),
    /// A reference to another instruction's result, by its SSA name.
    Inst(Type, String),
    /// A block-address constant used by indirect branches.
    BlockAddress(Type, String, String),
}

impl Value {
    pub fn get_type(&self) -> &Type {
        match self {
            Value::ConstInt(t, _)
            | Value::ConstArray(t, _)
            | Value::ConstStruct(t, _)
            | Value::Undef(t)
            | Value::Null(t)
            | Value::ZeroInitializer(t)
            | Value::Global(t, _)
            | Value::FunctionRef(t, _)
            | Value::Param(t, _)
            | Value::Inst(t, _)
            | Value::BlockAddress(t, _, _) => t,
        }
    }

    pub fn is_constant(&self) -> bool {
        !matches!(self, Value::Inst(..) | Value::Param(..))
    }

    pub fn as_const_int(&self) -> Option<i64> {
        match self {
            Value::ConstInt(_, v) => Some(*v),
            Value::ZeroInitializer(t) if t.is_integer() => Some(0),
            _ => None,
        }
    }

    pub fn inst_name(&self) -> Option<&str> {
        match self {
            Value::Inst(_, n) => Some(n.as_str()),
            _ => None,
        }
    }

    pub fn is_global_ref(&self) -> bool {
        matches!(self, Value::Global(..))
    }

    pub fn global_name(&self) -> Option<&str> {
        match self {
            Value::Global(_, n) => Some(n.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::ConstInt(ty, v) => write!(f, "{} {}", ty, v),
            Value::ConstArray(ty, elems) => {
                write!(f, "{} [", ty)?;
                for (i, e) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, "]")
            }
            Value::ConstStruct(ty, fields) => {
                write!(f, "{} {{", ty)?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", field)?;
                }
                write!(f, "}}")
            }
            Value::Undef(ty) => write!(f, "{} undef", ty),
            Value::Null(ty) => write!(f, "{} null", ty),
            Value::ZeroInitializer(ty) => write!(f, "{} zeroinitializer", ty),
            Value::Global(ty, name) => write!(f, "{} @{}", ty, name),
            Value::FunctionRef(ty, name) => write!(f, "{} @{}", ty, name),
            Value::Param(ty, idx) => write!(f, "{} %arg{}", ty, idx),
            Value::Inst(ty, name) => write!(f, "{} %{}", ty, name),
            Value::BlockAddress(ty, func, block) => {
                write!(f, "{} blockaddress(@{}, %{})", ty, func, block)
            }
        }
    }
}
