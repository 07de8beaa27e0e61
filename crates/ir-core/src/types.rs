//! IR Type System
//!
//! A deliberately small type lattice: integers of arbitrary bit width,
//! pointers, arrays, structs, function signatures, and void. Floats are
//! represented only so the verifier and virtualization-eligibility check
//! can recognize and reject them; nothing in this crate builds float
//! arithmetic.

use std::fmt;

/// A type in the IR.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    Integer(u32),
    Float32,
    Float64,
    Pointer(Box<Type>),
    Array(Box<Type>, usize),
    Struct(Vec<Type>),
    Function(Box<Type>, Vec<Type>, bool),
}

impl Type {
    pub fn i1() -> Type {
        Type::Integer(1)
    }
    pub fn i8() -> Type {
        Type::Integer(8)
    }
    pub fn i16() -> Type {
        Type::Integer(16)
    }
    pub fn i32() -> Type {
        Type::Integer(32)
    }
    pub fn i64() -> Type {
        Type::Integer(64)
    }

    pub fn ptr(pointee: Type) -> Type {
        Type::Pointer(Box::new(pointee))
    }

    pub fn array(element: Type, len: usize) -> Type {
        Type::Array(Box::new(element), len)
    }

    pub fn function(ret: Type, params: Vec<Type>, is_var_arg: bool) -> Type {
        Type::Function(Box::new(ret), params, is_var_arg)
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Type::Integer(_))
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Type::Float32 | Type::Float64)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Pointer(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Type::Array(_, _))
    }

    pub fn is_struct(&self) -> bool {
        matches!(self, Type::Struct(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Type::Function(_, _, _))
    }

    /// Bit width for integer types; byte-granular memory types resolve
    /// through `byte_size` instead.
    pub fn bit_width(&self) -> Option<u32> {
        match self {
            Type::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn pointee(&self) -> Option<&Type> {
        match self {
            Type::Pointer(p) => Some(p),
            _ => None,
        }
    }

    pub fn array_element(&self) -> Option<&Type> {
        match self {
            Type::Array(e, _) => Some(e),
            _ => None,
        }
    }

    pub fn array_len(&self) -> Option<usize> {
        match self {
            Type::Array(_, n) => Some(*n),
            _ => None,
        }
    }

    pub fn struct_fields(&self) -> Option<&[Type]> {
        match self {
            Type::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    /// Size in bytes, rounding integer bit widths up to the byte.
    /// Used by the global/string encryption byte-cycling scheme and by
    /// the bytecode compiler's stack-slot layout.
    pub fn byte_size(&self) -> usize {
        match self {
            Type::Void => 0,
            Type::Integer(bits) => ((*bits as usize) + 7) / 8,
            Type::Float32 => 4,
            Type::Float64 => 8,
            Type::Pointer(_) => 8,
            Type::Array(elem, len) => elem.byte_size() * len,
            Type::Struct(fields) => fields.iter().map(|f| f.byte_size()).sum(),
            Type::Function(..) => 8,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Integer(bits) => write!(f, "i{}", bits),
            Type::Float32 => write!(f, "float"),
            Type::Float64 => write!(f, "double"),
            Type::Pointer(p) => write!(f, "{}*", p),
            Type::Array(e, n) => write!(f, "[{} x {}]", n, e),
            Type::Struct(fields) => {
                write!(f, "{{ ")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", field)?;
                }
                write!(f, " }}")
            }
            Type::Function(ret, params, var_arg) => {
                write!(f, "{} (", ret)?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                if *var_arg {
                    if !params.is_empty() {
                        write!(f, ", ")?;
                    }
                    write!(f, "...")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_byte_sizes_round_up() {
        assert_eq!(Type::Integer(1).byte_size(), 1);
        assert_eq!(Type::Integer(8).byte_size(), 1);
        assert_eq!(Type::Integer(9).byte_size(), 2);
        assert_eq!(Type::Integer(32).byte_size(), 4);
        assert_eq!(Type::Integer(64).byte_size(), 8);
    }

    #[test]
    fn array_of_struct_size() {
        let st = Type::Struct(vec![Type::i32(), Type::ptr(Type::i8())]);
        let arr = Type::array(st, 3);
        assert_eq!(arr.byte_size(), (4 + 8) * 3);
    }

    #[test]
    fn display_roundish() {
        assert_eq!(Type::i32().to_string(), "i32");
        assert_eq!(Type::ptr(Type::i8()).to_string(), "i8*");
    }
}
