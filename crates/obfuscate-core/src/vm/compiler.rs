//! Bytecode Compiler (§4.12.2)
//!
//! Lowers one eligible function into the ISA in [`super::isa`]. This does
//! not mutate the function being compiled; body replacement (§4.12.4)
//! happens separately once the bytecode, host-call table, and global-ref
//! table are known.
//!
//! Simplifications against the full field spec, recorded because a
//! future reader comparing this against real RV64 conventions will
//! otherwise be confused: comparisons other than `slt`/`sltu` are
//! synthesized from two `OP64` instructions instead of the
//! branch-over-`addi` sequence; register allocation assigns one fresh
//! temporary per value rather than doing last-use liveness, spilling
//! every value that crosses a block boundary instead of only at
//! exhaustion; eligibility additionally caps parameter count at 6 so
//! the reserved global-ref-table base register never collides with an
//! argument register.

use std::collections::HashMap;

use ir_core::{CallTarget, Function, InstKind, IntPredicate, Opcode, Type, Value};

use crate::pass::{PassError, PassResult};
use crate::vm::isa::{ArithOp, BranchOp, VmInst, Width, A0, SP, T0, ZERO};

#[derive(Debug, Clone, Default)]
pub struct BytecodeProgram {
    pub words: Vec<u32>,
    pub host_function_names: Vec<String>,
    pub global_ref_names: Vec<String>,
    pub frame_size: i32,
}

fn is_eligible_type(ty: &Type) -> bool {
    ty.is_integer() || ty.is_pointer() || ty.is_void()
}

fn check_eligibility(f: &Function) -> PassResult<()> {
    if f.is_declaration() {
        return Err(ineligible(f, "has no body"));
    }
    if !is_eligible_type(&f.return_type()) {
        return Err(ineligible(f, "non-integer, non-void return type"));
    }
    if f.param_types().len() > 6 {
        return Err(ineligible(f, "more than 6 parameters"));
    }
    for ty in f.param_types() {
        if !is_eligible_type(&ty) {
            return Err(ineligible(f, "non-integer, non-pointer parameter"));
        }
    }
    for block in f.blocks() {
        for inst in block.instructions() {
            if matches!(
                inst.opcode,
                Opcode::FAdd | Opcode::FSub | Opcode::FMul | Opcode::FDiv | Opcode::FCmp
            ) {
                return Err(ineligible(f, "contains floating-point operations"));
            }
            if let InstKind::Call { callee, .. } = &inst.kind {
                if matches!(callee, CallTarget::Indirect) {
                    return Err(ineligible(f, "contains an indirect call"));
                }
                if inst.operands.len() > 6 {
                    return Err(ineligible(f, "call with more than 6 arguments"));
                }
            }
        }
    }
    Ok(())
}

fn ineligible(f: &Function, reason: &str) -> PassError {
    PassError::Failed("virtualize".into(), format!("{} is ineligible: {}", f.name(), reason))
}

struct Frame {
    slots: HashMap<String, i32>,
    next_offset: i32,
}

impl Frame {
    fn new() -> Self {
        Frame {
            slots: HashMap::new(),
            next_offset: -8,
        }
    }

    fn alloc(&mut self, name: &str, size: usize) -> i32 {
        if let Some(off) = self.slots.get(name) {
            return *off;
        }
        let aligned = ((size.max(1) + 7) / 8 * 8) as i32;
        let off = self.next_offset;
        self.next_offset -= aligned;
        self.slots.insert(name.to_string(), off);
        off
    }

    fn offset(&self, name: &str) -> Option<i32> {
        self.slots.get(name).copied()
    }
}

struct Fixup {
    index: usize,
    target: String,
}

struct Emitter<'a> {
    f: &'a Function,
    out: Vec<VmInst>,
    fixups: Vec<Fixup>,
    block_start: HashMap<String, usize>,
    frame: Frame,
    escaping: HashMap<String, Type>,
    def_block: HashMap<String, String>,
    value_reg: HashMap<String, u8>,
    next_temp: u8,
    host_fns: Vec<String>,
    global_refs: Vec<String>,
    global_base_reg: u8,
    alloca_names: std::collections::HashSet<String>,
}

fn scan_escaping(f: &Function) -> (HashMap<String, String>, HashMap<String, Type>) {
    let mut def_block = HashMap::new();
    for block in f.blocks() {
        for inst in block.instructions() {
            if let Some(name) = &inst.name {
                def_block.insert(name.clone(), block.name());
            }
        }
    }
    let mut escaping = HashMap::new();
    for block in f.blocks() {
        for inst in block.instructions() {
            if inst.is_phi() {
                escaping.insert(inst.name.clone().unwrap(), inst.ty.clone());
                continue;
            }
            for op in &inst.operands {
                if let Value::Inst(ty, name) = op {
                    if def_block.get(name).map(|b| b != &block.name()).unwrap_or(false) {
                        escaping.insert(name.clone(), ty.clone());
                    }
                }
            }
            if let InstKind::Phi { incoming } = &inst.kind {
                for (_, v) in incoming {
                    if let Value::Inst(ty, name) = v {
                        escaping.insert(name.clone(), ty.clone());
                    }
                }
            }
        }
    }
    (def_block, escaping)
}

impl<'a> Emitter<'a> {
    fn new(f: &'a Function) -> Self {
        let (def_block, escaping) = scan_escaping(f);
        let num_params = f.param_types().len() as u8;
        Emitter {
            f,
            out: Vec::new(),
            fixups: Vec::new(),
            block_start: HashMap::new(),
            frame: Frame::new(),
            escaping,
            def_block,
            value_reg: HashMap::new(),
            next_temp: T0,
            host_fns: Vec::new(),
            global_refs: Vec::new(),
            global_base_reg: A0 + num_params,
            alloca_names: std::collections::HashSet::new(),
        }
    }

    /// Frame key for a spilled value: allocas get a distinct key from the
    /// buffer they point to, since both live under the same SSA name.
    fn spill_key(&self, name: &str) -> String {
        if self.alloca_names.contains(name) {
            format!("{}.addr", name)
        } else {
            name.to_string()
        }
    }

    fn fresh_temp(&mut self) -> u8 {
        let r = self.next_temp;
        self.next_temp = if self.next_temp >= T0 + 6 { T0 } else { self.next_temp + 1 };
        r
    }

    fn emit(&mut self, inst: VmInst) -> usize {
        self.out.push(inst);
        self.out.len() - 1
    }

    fn materialize_const(&mut self, imm: i64) -> u8 {
        let rd = self.fresh_temp();
        if (-2048..2048).contains(&imm) {
            self.emit(VmInst::OpImm {
                op: ArithOp::Add,
                rd,
                rs1: ZERO,
                imm: imm as i32,
            });
        } else {
            let upper = ((imm >> 12) & 0xf_ffff) as i32;
            let lower = (imm & 0xfff) as i32;
            self.emit(VmInst::Lui { rd, imm: upper << 12 });
            self.emit(VmInst::OpImm {
                op: ArithOp::Add,
                rd,
                rs1: rd,
                imm: lower,
            });
        }
        rd
    }

    fn host_index(&mut self, name: &str) -> i64 {
        if let Some(i) = self.host_fns.iter().position(|n| n == name) {
            return i as i64;
        }
        self.host_fns.push(name.to_string());
        (self.host_fns.len() - 1) as i64
    }

    fn global_index(&mut self, name: &str) -> i64 {
        if let Some(i) = self.global_refs.iter().position(|n| n == name) {
            return i as i64;
        }
        self.global_refs.push(name.to_string());
        (self.global_refs.len() - 1) as i64
    }

    /// Resolves `v` to a register holding its value, materializing
    /// constants and reloading spilled (escaping) values from the frame.
    fn operand_reg(&mut self, v: &Value) -> u8 {
        match v {
            Value::ConstInt(_, n) => self.materialize_const(*n),
            Value::Param(_, idx) => A0 + *idx as u8,
            Value::Inst(ty, name) => {
                if self.escaping.contains_key(name) {
                    let key = self.spill_key(name);
                    let off = self.frame.offset(&key).expect("escaping value has a slot");
                    let rd = self.fresh_temp();
                    self.emit(VmInst::Load {
                        width: Width::from_bytes(ty.byte_size()),
                        rd,
                        rs1: SP,
                        imm: off,
                    });
                    rd
                } else if let Some(r) = self.value_reg.get(name) {
                    *r
                } else {
                    self.materialize_const(0)
                }
            }
            Value::Global(_, name) => {
                let idx = self.global_index(name);
                let rd = self.fresh_temp();
                self.emit(VmInst::Load {
                    width: Width::B8,
                    rd,
                    rs1: self.global_base_reg,
                    imm: (idx * 8) as i32,
                });
                rd
            }
            Value::Null(_) | Value::ZeroInitializer(_) | Value::Undef(_) => self.materialize_const(0),
            _ => self.materialize_const(0),
        }
    }

    fn set_result(&mut self, inst: &ir_core::Instruction, reg: u8) {
        let Some(name) = &inst.name else { return };
        if let Some(ty) = self.escaping.get(name).cloned() {
            let key = self.spill_key(name);
            let off = self.frame.alloc(&key, ty.byte_size());
            self.emit(VmInst::Store {
                width: Width::from_bytes(ty.byte_size()),
                rs1: SP,
                rs2: reg,
                imm: off,
            });
        } else {
            self.value_reg.insert(name.clone(), reg);
        }
    }

    fn emit_cmp(&mut self, pred: IntPredicate, a: u8, b: u8) -> u8 {
        use IntPredicate::*;
        match pred {
            Slt => {
                let rd = self.fresh_temp();
                self.emit(VmInst::Op { op: ArithOp::Slt, rd, rs1: a, rs2: b });
                rd
            }
            Ult => {
                let rd = self.fresh_temp();
                self.emit(VmInst::Op { op: ArithOp::Sltu, rd, rs1: a, rs2: b });
                rd
            }
            Sgt => {
                let rd = self.fresh_temp();
                self.emit(VmInst::Op { op: ArithOp::Slt, rd, rs1: b, rs2: a });
                rd
            }
            Ugt => {
                let rd = self.fresh_temp();
                self.emit(VmInst::Op { op: ArithOp::Sltu, rd, rs1: b, rs2: a });
                rd
            }
            Sge => {
                let t = self.emit_cmp(Slt, a, b);
                let rd = self.fresh_temp();
                self.emit(VmInst::OpImm { op: ArithOp::Xor, rd, rs1: t, imm: 1 });
                rd
            }
            Uge => {
                let t = self.emit_cmp(Ult, a, b);
                let rd = self.fresh_temp();
                self.emit(VmInst::OpImm { op: ArithOp::Xor, rd, rs1: t, imm: 1 });
                rd
            }
            Sle => {
                let t = self.emit_cmp(Sgt, a, b);
                let rd = self.fresh_temp();
                self.emit(VmInst::OpImm { op: ArithOp::Xor, rd, rs1: t, imm: 1 });
                rd
            }
            Ule => {
                let t = self.emit_cmp(Ugt, a, b);
                let rd = self.fresh_temp();
                self.emit(VmInst::OpImm { op: ArithOp::Xor, rd, rs1: t, imm: 1 });
                rd
            }
            Eq => {
                let diff = self.fresh_temp();
                self.emit(VmInst::Op { op: ArithOp::Xor, rd: diff, rs1: a, rs2: b });
                let rd = self.fresh_temp();
                self.emit(VmInst::OpImm { op: ArithOp::Sltu, rd, rs1: diff, imm: 1 });
                rd
            }
            Ne => {
                let eq = self.emit_cmp(Eq, a, b);
                let rd = self.fresh_temp();
                self.emit(VmInst::OpImm { op: ArithOp::Xor, rd, rs1: eq, imm: 1 });
                rd
            }
        }
    }

    fn binop(&mut self, opcode: Opcode) -> Option<ArithOp> {
        Some(match opcode {
            Opcode::Add => ArithOp::Add,
            Opcode::Sub => ArithOp::Sub,
            Opcode::Mul => ArithOp::Mul,
            Opcode::UDiv => ArithOp::Div,
            Opcode::SDiv => ArithOp::Div,
            Opcode::URem => ArithOp::Rem,
            Opcode::SRem => ArithOp::Rem,
            Opcode::And => ArithOp::And,
            Opcode::Or => ArithOp::Or,
            Opcode::Xor => ArithOp::Xor,
            Opcode::Shl => ArithOp::Sll,
            Opcode::LShr => ArithOp::Srl,
            Opcode::AShr => ArithOp::Sra,
            _ => return None,
        })
    }

    fn write_phi_stores(&mut self, from_block: &str, to_block: &str) {
        let Some(target) = self.f.block_by_name(to_block) else { return };
        for phi in target.phis() {
            let InstKind::Phi { incoming } = &phi.kind else { continue };
            let Some((_, value)) = incoming.iter().find(|(label, _)| label == from_block) else {
                continue;
            };
            let reg = self.operand_reg(value);
            let name = phi.name.clone().unwrap();
            let off = self.frame.alloc(&name, phi.ty.byte_size());
            self.emit(VmInst::Store {
                width: Width::from_bytes(phi.ty.byte_size()),
                rs1: SP,
                rs2: reg,
                imm: off,
            });
        }
    }

    fn compile(mut self) -> PassResult<BytecodeProgram> {
        for block in self.f.blocks() {
            self.block_start.insert(block.name(), self.out.len());
            self.value_reg.clear();

            for phi in block.phis() {
                let name = phi.name.clone().unwrap();
                let off = self.frame.alloc(&name, phi.ty.byte_size());
                let rd = self.fresh_temp();
                self.emit(VmInst::Load {
                    width: Width::from_bytes(phi.ty.byte_size()),
                    rd,
                    rs1: SP,
                    imm: off,
                });
                self.value_reg.insert(name, rd);
            }

            let insts = block.instructions();
            for inst in insts.iter().filter(|i| !i.is_phi()) {
                self.compile_instruction(&block.name(), inst)?;
            }
        }

        for fixup in std::mem::take(&mut self.fixups) {
            let target_idx = *self
                .block_start
                .get(&fixup.target)
                .ok_or_else(|| PassError::InvalidIr("virtualize".into(), format!("unknown target {}", fixup.target)))?;
            let offset_bytes = (target_idx as i64 - fixup.index as i64) * 4;
            match &mut self.out[fixup.index] {
                VmInst::Branch { offset, .. } => *offset = offset_bytes as i32,
                VmInst::Jal { offset, .. } => *offset = offset_bytes as i32,
                _ => {}
            }
        }

        let words = self.out.iter().map(|i| i.encode()).collect();
        Ok(BytecodeProgram {
            words,
            host_function_names: self.host_fns,
            global_ref_names: self.global_refs,
            frame_size: -self.frame.next_offset,
        })
    }

    fn compile_instruction(&mut self, block_name: &str, inst: &ir_core::Instruction) -> PassResult<()> {
        match inst.opcode {
            Opcode::Alloca => {
                let InstKind::Alloca { allocated_ty } = &inst.kind else {
                    unreachable!()
                };
                let name = inst.name.clone().unwrap();
                let off = self.frame.alloc(&name, allocated_ty.byte_size().max(8));
                let rd = self.fresh_temp();
                self.emit(VmInst::OpImm {
                    op: ArithOp::Add,
                    rd,
                    rs1: SP,
                    imm: off,
                });
                self.alloca_names.insert(name.clone());
                if self.escaping.contains_key(&name) {
                    // Separate slot from the buffer itself: this one holds
                    // the computed `sp + off` address, reloaded on demand.
                    let key = self.spill_key(&name);
                    let slot = self.frame.alloc(&key, 8);
                    self.emit(VmInst::Store {
                        width: Width::B8,
                        rs1: SP,
                        rs2: rd,
                        imm: slot,
                    });
                } else {
                    self.value_reg.insert(name, rd);
                }
            }
            Opcode::Load => {
                let ptr = self.operand_reg(&inst.operands[0]);
                let rd = self.fresh_temp();
                self.emit(VmInst::Load {
                    width: Width::from_bytes(inst.ty.byte_size()),
                    rd,
                    rs1: ptr,
                    imm: 0,
                });
                self.set_result(inst, rd);
            }
            Opcode::Store => {
                let val = self.operand_reg(&inst.operands[0]);
                let ptr = self.operand_reg(&inst.operands[1]);
                let width = Width::from_bytes(inst.operands[0].get_type().byte_size());
                self.emit(VmInst::Store { width, rs1: ptr, rs2: val, imm: 0 });
            }
            Opcode::GetElementPtr => {
                let InstKind::Gep { base_ty, indices } = &inst.kind else {
                    unreachable!()
                };
                let base = self.operand_reg(&inst.operands[0]);
                let byte_off = gep_byte_offset(base_ty, indices);
                let rd = self.fresh_temp();
                self.emit(VmInst::OpImm { op: ArithOp::Add, rd, rs1: base, imm: byte_off });
                self.set_result(inst, rd);
            }
            Opcode::ICmp => {
                let InstKind::ICmp(pred) = &inst.kind else { unreachable!() };
                let pred = *pred;
                let a = self.operand_reg(&inst.operands[0]);
                let b = self.operand_reg(&inst.operands[1]);
                let rd = self.emit_cmp(pred, a, b);
                self.set_result(inst, rd);
            }
            Opcode::ZExt | Opcode::SExt | Opcode::Trunc | Opcode::PtrToInt | Opcode::IntToPtr | Opcode::BitCast => {
                let src = self.operand_reg(&inst.operands[0]);
                self.set_result(inst, src);
            }
            Opcode::Select => {
                let cond = self.operand_reg(&inst.operands[0]);
                let t = self.operand_reg(&inst.operands[1]);
                let e = self.operand_reg(&inst.operands[2]);
                let mask = self.fresh_temp();
                self.emit(VmInst::OpImm { op: ArithOp::Sltu, rd: mask, rs1: cond, imm: 1 });
                let not_mask = self.fresh_temp();
                self.emit(VmInst::OpImm { op: ArithOp::Xor, rd: not_mask, rs1: mask, imm: 1 });
                let then_part = self.fresh_temp();
                self.emit(VmInst::Op { op: ArithOp::Mul, rd: then_part, rs1: t, rs2: not_mask });
                let else_part = self.fresh_temp();
                self.emit(VmInst::Op { op: ArithOp::Mul, rd: else_part, rs1: e, rs2: mask });
                let rd = self.fresh_temp();
                self.emit(VmInst::Op { op: ArithOp::Add, rd, rs1: then_part, rs2: else_part });
                self.set_result(inst, rd);
            }
            Opcode::Call => {
                let InstKind::Call { callee, .. } = &inst.kind else { unreachable!() };
                let CallTarget::Direct(name) = callee else {
                    return Err(ineligible(self.f, "indirect call reached the compiler"));
                };
                for (i, arg) in inst.operands.iter().enumerate() {
                    let reg = self.operand_reg(arg);
                    self.emit(VmInst::OpImm {
                        op: ArithOp::Add,
                        rd: A0 + 1 + i as u8,
                        rs1: reg,
                        imm: 0,
                    });
                }
                let idx = self.host_index(name);
                self.emit(VmInst::OpImm { op: ArithOp::Add, rd: A0, rs1: ZERO, imm: idx as i32 });
                self.emit(VmInst::OpImm {
                    op: ArithOp::Add,
                    rd: A0 + 7,
                    rs1: ZERO,
                    imm: crate::vm::isa::SYSCALL_HOST_CALL as i32,
                });
                self.emit(VmInst::Ecall);
                if inst.name.is_some() {
                    self.set_result(inst, A0);
                }
            }
            Opcode::Br => {
                let InstKind::Br { target } = &inst.kind else { unreachable!() };
                self.write_phi_stores(block_name, target);
                let idx = self.emit(VmInst::Jal { rd: ZERO, offset: 0 });
                self.fixups.push(Fixup { index: idx, target: target.clone() });
            }
            Opcode::CondBr => {
                let InstKind::CondBr { then_target, else_target } = &inst.kind else {
                    unreachable!()
                };
                let cond = self.operand_reg(&inst.operands[0]);
                self.write_phi_stores(block_name, then_target);
                let branch_idx = self.emit(VmInst::Branch {
                    op: BranchOp::Ne,
                    rs1: cond,
                    rs2: ZERO,
                    offset: 0,
                });
                self.fixups.push(Fixup { index: branch_idx, target: then_target.clone() });
                self.write_phi_stores(block_name, else_target);
                let jal_idx = self.emit(VmInst::Jal { rd: ZERO, offset: 0 });
                self.fixups.push(Fixup { index: jal_idx, target: else_target.clone() });
            }
            Opcode::Switch => {
                let InstKind::Switch { default, cases } = &inst.kind else {
                    unreachable!()
                };
                let selector = self.operand_reg(&inst.operands[0]);
                for (val, target) in cases {
                    self.write_phi_stores(block_name, target);
                    let cmp = self.materialize_const(*val);
                    let idx = self.emit(VmInst::Branch {
                        op: BranchOp::Eq,
                        rs1: selector,
                        rs2: cmp,
                        offset: 0,
                    });
                    self.fixups.push(Fixup { index: idx, target: target.clone() });
                }
                self.write_phi_stores(block_name, default);
                let idx = self.emit(VmInst::Jal { rd: ZERO, offset: 0 });
                self.fixups.push(Fixup { index: idx, target: default.clone() });
            }
            Opcode::Ret => {
                if let Some(v) = inst.operands.first() {
                    let reg = self.operand_reg(v);
                    self.emit(VmInst::OpImm { op: ArithOp::Add, rd: A0, rs1: reg, imm: 0 });
                }
                self.emit(VmInst::OpImm {
                    op: ArithOp::Add,
                    rd: A0 + 7,
                    rs1: ZERO,
                    imm: crate::vm::isa::SYSCALL_EXIT as i32,
                });
                self.emit(VmInst::Ecall);
            }
            Opcode::Unreachable => {
                self.emit(VmInst::OpImm {
                    op: ArithOp::Add,
                    rd: A0 + 7,
                    rs1: ZERO,
                    imm: crate::vm::isa::SYSCALL_EXIT as i32,
                });
                self.emit(VmInst::Ecall);
            }
            other if self.binop(other).is_some() => {
                let op = self.binop(other).unwrap();
                let a = self.operand_reg(&inst.operands[0]);
                let b = self.operand_reg(&inst.operands[1]);
                let rd = self.fresh_temp();
                self.emit(VmInst::Op { op, rd, rs1: a, rs2: b });
                self.set_result(inst, rd);
            }
            other => {
                return Err(ineligible(self.f, &format!("unsupported opcode {:?}", other)));
            }
        }
        Ok(())
    }
}

fn gep_byte_offset(base_ty: &Type, indices: &[i64]) -> i32 {
    let mut ty = base_ty.clone();
    let mut offset: i64 = 0;
    for &idx in indices {
        match &ty {
            Type::Array(elem, _) => {
                offset += idx * elem.byte_size() as i64;
                ty = (**elem).clone();
            }
            Type::Struct(fields) => {
                for f in fields.iter().take(idx as usize) {
                    offset += f.byte_size() as i64;
                }
                if let Some(f) = fields.get(idx as usize) {
                    ty = f.clone();
                }
            }
            _ => offset += idx * ty.byte_size() as i64,
        }
    }
    offset as i32
}

pub fn compile_function(f: &Function) -> PassResult<BytecodeProgram> {
    check_eligibility(f)?;
    Emitter::new(f).compile()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir_core::{BasicBlock, Instruction, Opcode};

    #[test]
    fn compiles_a_straight_line_adder() {
        let f = Function::new("add", Type::i32(), vec![Type::i32(), Type::i32()]);
        let bb = BasicBlock::new("entry");
        bb.push_instruction(Instruction::new(
            Opcode::Add,
            Type::i32(),
            Some("s".into()),
            vec![Value::Param(Type::i32(), 0), Value::Param(Type::i32(), 1)],
        ));
        bb.push_instruction(Instruction::new(
            Opcode::Ret,
            Type::Void,
            None,
            vec![Value::Inst(Type::i32(), "s".into())],
        ));
        f.append_block(bb);

        let program = compile_function(&f).unwrap();
        assert!(!program.words.is_empty());
        for word in &program.words {
            assert!(VmInst::decode(*word).is_some());
        }
    }

    #[test]
    fn compiles_a_branching_function_with_phi() {
        let f = Function::new("branch_func", Type::i32(), vec![Type::i32()]);
        let entry = BasicBlock::new("entry");
        let then_bb = BasicBlock::new("then");
        let else_bb = BasicBlock::new("else");
        let join = BasicBlock::new("join");

        entry.push_instruction(
            Instruction::new(Opcode::ICmp, Type::i1(), Some("c".into()), vec![
                Value::Param(Type::i32(), 0),
                Value::ConstInt(Type::i32(), 0),
            ])
            .with_kind(InstKind::ICmp(IntPredicate::Sgt)),
        );
        entry.push_instruction(
            Instruction::new(Opcode::CondBr, Type::Void, None, vec![Value::Inst(Type::i1(), "c".into())])
                .with_kind(InstKind::CondBr {
                    then_target: "then".into(),
                    else_target: "else".into(),
                }),
        );
        then_bb.push_instruction(Instruction::new(Opcode::Br, Type::Void, None, vec![]).with_kind(
            InstKind::Br { target: "join".into() },
        ));
        else_bb.push_instruction(Instruction::new(Opcode::Br, Type::Void, None, vec![]).with_kind(
            InstKind::Br { target: "join".into() },
        ));
        join.push_instruction(
            Instruction::new(Opcode::Phi, Type::i32(), Some("r".into()), vec![]).with_kind(InstKind::Phi {
                incoming: vec![
                    ("then".into(), Value::ConstInt(Type::i32(), 1)),
                    ("else".into(), Value::ConstInt(Type::i32(), -1)),
                ],
            }),
        );
        join.push_instruction(Instruction::new(
            Opcode::Ret,
            Type::Void,
            None,
            vec![Value::Inst(Type::i32(), "r".into())],
        ));

        f.append_block(entry);
        f.append_block(then_bb);
        f.append_block(else_bb);
        f.append_block(join);

        let program = compile_function(&f).unwrap();
        assert!(!program.words.is_empty());
    }

    #[test]
    fn float_ops_are_ineligible() {
        let f = Function::new("fadd", Type::Float32, vec![]);
        let bb = BasicBlock::new("entry");
        bb.push_instruction(Instruction::new(
            Opcode::FAdd,
            Type::Float32,
            Some("x".into()),
            vec![],
        ));
        bb.push_instruction(Instruction::new(Opcode::Ret, Type::Void, None, vec![]));
        f.append_block(bb);
        assert!(compile_function(&f).is_err());
    }
}
