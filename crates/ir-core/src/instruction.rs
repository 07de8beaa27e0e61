//! Instructions
//!
//! An instruction carries a generic `Vec<Value>` operand list plus an
//! opcode-specific `InstKind` payload for the information a flat operand
//! list can't express safely: branch target labels, PHI incoming edges,
//! GEP indices, and call callee/calling-convention. Passes match on
//! `InstKind` rather than re-deriving structure from operand position.

use std::fmt;

use crate::types::Type;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Ret,
    Br,
    CondBr,
    Switch,
    IndirectBr,
    Unreachable,

    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,

    Shl,
    LShr,
    AShr,
    And,
    Or,
    Xor,

    FAdd,
    FSub,
    FMul,
    FDiv,

    Alloca,
    Load,
    Store,
    GetElementPtr,

    ICmp,
    FCmp,

    Trunc,
    ZExt,
    SExt,
    PtrToInt,
    IntToPtr,
    BitCast,

    Phi,
    Call,
    Select,
    InlineAsm,
}

impl Opcode {
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::Ret
                | Opcode::Br
                | Opcode::CondBr
                | Opcode::Switch
                | Opcode::IndirectBr
                | Opcode::Unreachable
        )
    }

    pub fn is_integer_binop(self) -> bool {
        matches!(
            self,
            Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::UDiv
                | Opcode::SDiv
                | Opcode::URem
                | Opcode::SRem
                | Opcode::Shl
                | Opcode::LShr
                | Opcode::AShr
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
        )
    }

    /// The four ops arithmetic substitution (§4.6) and linear-MBA (§4.7)
    /// both apply to.
    pub fn is_substitutable(self) -> bool {
        matches!(
            self,
            Opcode::Add | Opcode::Sub | Opcode::And | Opcode::Or | Opcode::Xor
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntPredicate {
    Eq,
    Ne,
    Ugt,
    Uge,
    Ult,
    Ule,
    Sgt,
    Sge,
    Slt,
    Sle,
}

impl IntPredicate {
    pub fn evaluate(self, lhs: i64, rhs: i64) -> bool {
        match self {
            IntPredicate::Eq => lhs == rhs,
            IntPredicate::Ne => lhs != rhs,
            IntPredicate::Ugt => (lhs as u64) > (rhs as u64),
            IntPredicate::Uge => (lhs as u64) >= (rhs as u64),
            IntPredicate::Ult => (lhs as u64) < (rhs as u64),
            IntPredicate::Ule => (lhs as u64) <= (rhs as u64),
            IntPredicate::Sgt => lhs > rhs,
            IntPredicate::Sge => lhs >= rhs,
            IntPredicate::Slt => lhs < rhs,
            IntPredicate::Sle => lhs <= rhs,
        }
    }

    pub fn negate(self) -> IntPredicate {
        match self {
            IntPredicate::Eq => IntPredicate::Ne,
            IntPredicate::Ne => IntPredicate::Eq,
            IntPredicate::Ugt => IntPredicate::Ule,
            IntPredicate::Uge => IntPredicate::Ult,
            IntPredicate::Ult => IntPredicate::Uge,
            IntPredicate::Ule => IntPredicate::Ugt,
            IntPredicate::Sgt => IntPredicate::Sle,
            IntPredicate::Sge => IntPredicate::Slt,
            IntPredicate::Slt => IntPredicate::Sge,
            IntPredicate::Sle => IntPredicate::Sgt,
        }
    }
}

/// Calling convention, for §4.10's randomization and the VM's host ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallingConv {
    C,
    Fast,
    Cold,
    PreserveMost,
    PreserveAll,
    RegCall,
    X86_64SysV,
    Win64,
}

impl CallingConv {
    pub const RANDOM_POOL: [CallingConv; 7] = [
        CallingConv::Fast,
        CallingConv::Cold,
        CallingConv::PreserveMost,
        CallingConv::PreserveAll,
        CallingConv::RegCall,
        CallingConv::X86_64SysV,
        CallingConv::Win64,
    ];
}

impl fmt::Display for CallingConv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallingConv::C => "ccc",
            CallingConv::Fast => "fastcc",
            CallingConv::Cold => "coldcc",
            CallingConv::PreserveMost => "preserve_mostcc",
            CallingConv::PreserveAll => "preserve_allcc",
            CallingConv::RegCall => "x86_regcallcc",
            CallingConv::X86_64SysV => "x86_64_sysvcc",
            CallingConv::Win64 => "win64cc",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    Direct(String),
    Indirect,
}

/// Opcode-specific payload that a flat operand list cannot carry safely.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InstKind {
    #[default]
    Plain,
    Br {
        target: String,
    },
    CondBr {
        then_target: String,
        else_target: String,
    },
    Switch {
        default: String,
        cases: Vec<(i64, String)>,
    },
    IndirectBr {
        possible_targets: Vec<String>,
    },
    Phi {
        incoming: Vec<(String, Value)>,
    },
    Call {
        callee: CallTarget,
        cc: CallingConv,
    },
    Gep {
        base_ty: Type,
        indices: Vec<i64>,
    },
    ICmp(IntPredicate),
    Alloca {
        allocated_ty: Type,
    },
    InlineAsm {
        bytes: Vec<u8>,
        asm: String,
    },
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub opcode: Opcode,
    pub ty: Type,
    /// Result name (the `%name` an SSA value is referenced by). `None`
    /// for void-typed instructions: store, the terminators, and calls to
    /// void functions.
    pub name: Option<String>,
    pub operands: Vec<Value>,
    pub kind: InstKind,
}

impl Instruction {
    pub fn new(opcode: Opcode, ty: Type, name: Option<String>, operands: Vec<Value>) -> Self {
        Instruction {
            opcode,
            ty,
            name,
            operands,
            kind: InstKind::Plain,
        }
    }

    pub fn with_kind(mut self, kind: InstKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn is_terminator(&self) -> bool {
        self.opcode.is_terminator()
    }

    pub fn is_phi(&self) -> bool {
        self.opcode == Opcode::Phi
    }

    pub fn result_value(&self) -> Option<Value> {
        if self.ty.is_void() {
            return None;
        }
        self.name
            .as_ref()
            .map(|n| Value::Inst(self.ty.clone(), n.clone()))
    }

    /// Successor block labels this instruction's terminator lists,
    /// honoring §3's invariant that "successors listed by a branch equal
    /// the set of blocks actually targeted."
    pub fn successors(&self) -> Vec<String> {
        match &self.kind {
            InstKind::Br { target } => vec![target.clone()],
            InstKind::CondBr {
                then_target,
                else_target,
            } => vec![then_target.clone(), else_target.clone()],
            InstKind::Switch { default, cases } => {
                let mut v = vec![default.clone()];
                v.extend(cases.iter().map(|(_, t)| t.clone()));
                v
            }
            InstKind::IndirectBr { possible_targets } => possible_targets.clone(),
            _ => Vec::new(),
        }
    }

    /// Replace every operand equal to `old` with `new`. Used by passes
    /// before erasing an instruction, so no erased value is ever used
    /// afterward (§3 invariant).
    pub fn replace_uses_of(&mut self, old: &Value, new: &Value) {
        for op in self.operands.iter_mut() {
            if op == old {
                *op = new.clone();
            }
        }
        if let InstKind::Phi { incoming } = &mut self.kind {
            for (_, v) in incoming.iter_mut() {
                if v == old {
                    *v = new.clone();
                }
            }
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            write!(f, "%{} = ", name)?;
        }
        write!(f, "{:?}", self.opcode)?;
        if !self.operands.is_empty() {
            write!(f, " ")?;
            for (i, op) in self.operands.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", op)?;
            }
        }
        match &self.kind {
            InstKind::Br { target } => write!(f, " label %{}", target),
            InstKind::CondBr {
                then_target,
                else_target,
            } => write!(f, ", label %{}, label %{}", then_target, else_target),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminator_classification() {
        let ret = Instruction::new(Opcode::Ret, Type::Void, None, vec![]);
        assert!(ret.is_terminator());
        let add = Instruction::new(Opcode::Add, Type::i32(), Some("x".into()), vec![]);
        assert!(!add.is_terminator());
    }

    #[test]
    fn condbr_successors() {
        let inst = Instruction::new(Opcode::CondBr, Type::Void, None, vec![])
            .with_kind(InstKind::CondBr {
                then_target: "a".into(),
                else_target: "b".into(),
            });
        assert_eq!(inst.successors(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn predicate_negation_is_involutive() {
        for p in [
            IntPredicate::Eq,
            IntPredicate::Slt,
            IntPredicate::Uge,
            IntPredicate::Ne,
        ] {
            assert_eq!(p.negate().negate(), p);
        }
    }
}
