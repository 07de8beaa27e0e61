//! IR Builder
//!
//! A scoped cursor for inserting instructions, per §5's resource
//! discipline: acquired at the start of an insertion region, released
//! before any value it produced is observed outside that region. Every
//! pass in this workspace constructs a short-lived `Builder` borrowing
//! the owning `Function` for fresh-name allocation.

use crate::basic_block::BasicBlock;
use crate::function::Function;
use crate::instruction::{CallTarget, CallingConv, InstKind, Instruction, IntPredicate, Opcode};
use crate::types::Type;
use crate::value::Value;

enum Position {
    /// Insert at the end of the block (it must not yet be terminated).
    End(BasicBlock),
    /// Insert before the instruction currently at `index`.
    Before(BasicBlock, usize),
}

pub struct Builder<'f> {
    function: &'f Function,
    position: Option<Position>,
    name_prefix: &'static str,
}

impl<'f> Builder<'f> {
    pub fn new(function: &'f Function) -> Self {
        Builder {
            function,
            position: None,
            name_prefix: "v",
        }
    }

    pub fn with_name_prefix(mut self, prefix: &'static str) -> Self {
        self.name_prefix = prefix;
        self
    }

    pub fn position_at_end(&mut self, block: BasicBlock) {
        self.position = Some(Position::End(block));
    }

    /// Position immediately before `index` in `block`'s instruction list,
    /// the anchor point for §4.2's key-update calls and §4.3's split.
    pub fn position_before_index(&mut self, block: BasicBlock, index: usize) {
        self.position = Some(Position::Before(block, index));
    }

    fn fresh_name(&self) -> String {
        self.function.fresh_value_name(self.name_prefix)
    }

    fn emit(&mut self, inst: Instruction) -> Option<Value> {
        let result = inst.result_value();
        match self.position.take() {
            Some(Position::End(block)) => {
                block.push_instruction(inst);
                self.position = Some(Position::End(block));
            }
            Some(Position::Before(block, index)) => {
                block.with_instructions(|v| v.insert(index, inst));
                self.position = Some(Position::Before(block, index + 1));
            }
            None => panic!("builder has no insertion point"),
        }
        result
    }

    // -- terminators --

    pub fn build_ret_void(&mut self) {
        self.emit(Instruction::new(Opcode::Ret, Type::Void, None, vec![]));
    }

    pub fn build_ret(&mut self, value: Value) {
        self.emit(Instruction::new(Opcode::Ret, Type::Void, None, vec![value]));
    }

    pub fn build_unreachable(&mut self) {
        self.emit(Instruction::new(Opcode::Unreachable, Type::Void, None, vec![]));
    }

    pub fn build_br(&mut self, target: &str) {
        let inst = Instruction::new(Opcode::Br, Type::Void, None, vec![]).with_kind(
            InstKind::Br {
                target: target.to_string(),
            },
        );
        self.emit(inst);
    }

    pub fn build_cond_br(&mut self, cond: Value, then_target: &str, else_target: &str) {
        let inst = Instruction::new(Opcode::CondBr, Type::Void, None, vec![cond]).with_kind(
            InstKind::CondBr {
                then_target: then_target.to_string(),
                else_target: else_target.to_string(),
            },
        );
        self.emit(inst);
    }

    pub fn build_switch(&mut self, cond: Value, default: &str, cases: Vec<(i64, String)>) {
        let inst = Instruction::new(Opcode::Switch, Type::Void, None, vec![cond]).with_kind(
            InstKind::Switch {
                default: default.to_string(),
                cases,
            },
        );
        self.emit(inst);
    }

    pub fn build_indirect_br(&mut self, addr: Value, possible_targets: Vec<String>) {
        let inst = Instruction::new(Opcode::IndirectBr, Type::Void, None, vec![addr])
            .with_kind(InstKind::IndirectBr { possible_targets });
        self.emit(inst);
    }

    // -- memory --

    pub fn build_alloca(&mut self, ty: Type) -> Value {
        let name = self.fresh_name();
        let inst = Instruction::new(Opcode::Alloca, Type::ptr(ty.clone()), Some(name), vec![])
            .with_kind(InstKind::Alloca { allocated_ty: ty });
        self.emit(inst).unwrap()
    }

    pub fn build_load(&mut self, ty: Type, ptr: Value) -> Value {
        let name = self.fresh_name();
        let inst = Instruction::new(Opcode::Load, ty, Some(name), vec![ptr]);
        self.emit(inst).unwrap()
    }

    pub fn build_store(&mut self, value: Value, ptr: Value) {
        self.emit(Instruction::new(Opcode::Store, Type::Void, None, vec![value, ptr]));
    }

    /// Constant-index-only GEP (every pass in this crate uses compile-time
    /// indices; no variable index reaches `ir-core`).
    pub fn build_gep(&mut self, base_ty: Type, ptr: Value, indices: Vec<i64>, result_ty: Type) -> Value {
        let name = self.fresh_name();
        let inst = Instruction::new(Opcode::GetElementPtr, Type::ptr(result_ty), Some(name), vec![ptr])
            .with_kind(InstKind::Gep { base_ty, indices });
        self.emit(inst).unwrap()
    }

    // -- binary ops --

    fn build_binop(&mut self, opcode: Opcode, lhs: Value, rhs: Value) -> Value {
        let ty = lhs.get_type().clone();
        let name = self.fresh_name();
        let inst = Instruction::new(opcode, ty, Some(name), vec![lhs, rhs]);
        self.emit(inst).unwrap()
    }

    pub fn build_add(&mut self, lhs: Value, rhs: Value) -> Value {
        self.build_binop(Opcode::Add, lhs, rhs)
    }
    pub fn build_sub(&mut self, lhs: Value, rhs: Value) -> Value {
        self.build_binop(Opcode::Sub, lhs, rhs)
    }
    pub fn build_mul(&mut self, lhs: Value, rhs: Value) -> Value {
        self.build_binop(Opcode::Mul, lhs, rhs)
    }
    pub fn build_udiv(&mut self, lhs: Value, rhs: Value) -> Value {
        self.build_binop(Opcode::UDiv, lhs, rhs)
    }
    pub fn build_sdiv(&mut self, lhs: Value, rhs: Value) -> Value {
        self.build_binop(Opcode::SDiv, lhs, rhs)
    }
    pub fn build_urem(&mut self, lhs: Value, rhs: Value) -> Value {
        self.build_binop(Opcode::URem, lhs, rhs)
    }
    pub fn build_srem(&mut self, lhs: Value, rhs: Value) -> Value {
        self.build_binop(Opcode::SRem, lhs, rhs)
    }
    pub fn build_shl(&mut self, lhs: Value, rhs: Value) -> Value {
        self.build_binop(Opcode::Shl, lhs, rhs)
    }
    pub fn build_lshr(&mut self, lhs: Value, rhs: Value) -> Value {
        self.build_binop(Opcode::LShr, lhs, rhs)
    }
    pub fn build_ashr(&mut self, lhs: Value, rhs: Value) -> Value {
        self.build_binop(Opcode::AShr, lhs, rhs)
    }
    pub fn build_and(&mut self, lhs: Value, rhs: Value) -> Value {
        self.build_binop(Opcode::And, lhs, rhs)
    }
    pub fn build_or(&mut self, lhs: Value, rhs: Value) -> Value {
        self.build_binop(Opcode::Or, lhs, rhs)
    }
    pub fn build_xor(&mut self, lhs: Value, rhs: Value) -> Value {
        self.build_binop(Opcode::Xor, lhs, rhs)
    }

    // -- comparisons / conversions --

    pub fn build_icmp(&mut self, pred: IntPredicate, lhs: Value, rhs: Value) -> Value {
        let name = self.fresh_name();
        let inst = Instruction::new(Opcode::ICmp, Type::i1(), Some(name), vec![lhs, rhs])
            .with_kind(InstKind::ICmp(pred));
        self.emit(inst).unwrap()
    }

    fn build_conv(&mut self, opcode: Opcode, value: Value, dest_ty: Type) -> Value {
        let name = self.fresh_name();
        let inst = Instruction::new(opcode, dest_ty, Some(name), vec![value]);
        self.emit(inst).unwrap()
    }

    pub fn build_zext(&mut self, value: Value, dest_ty: Type) -> Value {
        self.build_conv(Opcode::ZExt, value, dest_ty)
    }
    pub fn build_sext(&mut self, value: Value, dest_ty: Type) -> Value {
        self.build_conv(Opcode::SExt, value, dest_ty)
    }
    pub fn build_trunc(&mut self, value: Value, dest_ty: Type) -> Value {
        self.build_conv(Opcode::Trunc, value, dest_ty)
    }
    pub fn build_ptrtoint(&mut self, value: Value, dest_ty: Type) -> Value {
        self.build_conv(Opcode::PtrToInt, value, dest_ty)
    }
    pub fn build_inttoptr(&mut self, value: Value, dest_ty: Type) -> Value {
        self.build_conv(Opcode::IntToPtr, value, dest_ty)
    }
    pub fn build_bitcast(&mut self, value: Value, dest_ty: Type) -> Value {
        self.build_conv(Opcode::BitCast, value, dest_ty)
    }

    // -- other --

    pub fn build_phi(&mut self, ty: Type, incoming: Vec<(String, Value)>) -> Value {
        let name = self.fresh_name();
        let inst = Instruction::new(Opcode::Phi, ty, Some(name), vec![])
            .with_kind(InstKind::Phi { incoming });
        self.emit(inst).unwrap()
    }

    pub fn build_call(
        &mut self,
        ret_ty: Type,
        callee: CallTarget,
        cc: CallingConv,
        args: Vec<Value>,
        want_result: bool,
    ) -> Option<Value> {
        let name = if want_result && !ret_ty.is_void() {
            Some(self.fresh_name())
        } else {
            None
        };
        let ty = if want_result { ret_ty } else { Type::Void };
        let inst =
            Instruction::new(Opcode::Call, ty, name, args).with_kind(InstKind::Call { callee, cc });
        self.emit(inst)
    }

    pub fn build_select(&mut self, cond: Value, then_val: Value, else_val: Value) -> Value {
        let ty = then_val.get_type().clone();
        let name = self.fresh_name();
        let inst = Instruction::new(Opcode::Select, ty, Some(name), vec![cond, then_val, else_val]);
        self.emit(inst).unwrap()
    }

    pub fn build_inline_asm(&mut self, bytes: Vec<u8>, asm: String) {
        let inst = Instruction::new(Opcode::InlineAsm, Type::Void, None, vec![])
            .with_kind(InstKind::InlineAsm { bytes, asm });
        self.emit(inst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Function;

    #[test]
    fn build_add_pushes_one_instruction() {
        let f = Function::new("f", Type::i32(), vec![]);
        let bb = BasicBlock::new("entry");
        f.append_block(bb.clone());
        let mut b = Builder::new(&f);
        b.position_at_end(bb.clone());
        let lhs = Value::ConstInt(Type::i32(), 1);
        let rhs = Value::ConstInt(Type::i32(), 2);
        let sum = b.build_add(lhs, rhs);
        b.build_ret(sum);
        assert_eq!(bb.instruction_count(), 2);
    }

    #[test]
    fn insert_before_index_advances_cursor() {
        let f = Function::new("f", Type::Void, vec![]);
        let bb = BasicBlock::new("entry");
        f.append_block(bb.clone());
        let mut b = Builder::new(&f);
        b.position_at_end(bb.clone());
        b.build_ret_void();
        let mut b2 = Builder::new(&f);
        b2.position_before_index(bb.clone(), 0);
        let a = b2.build_alloca(Type::i32());
        assert!(matches!(a, Value::Inst(..)));
        assert_eq!(bb.instruction_count(), 2);
        assert_eq!(bb.instructions()[0].opcode, Opcode::Alloca);
    }
}
