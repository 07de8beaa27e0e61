//! Bogus Control Flow (§4.3)
//!
//! Splits a block into `head | body | tail`, clones `body` into a `clone`
//! block that is only reachable behind an opaque predicate nothing short
//! of arithmetic reasoning can prove false, and wires `clone` back into
//! `body` so the CFG grows a loop-shaped detour that never actually
//! executes. Two independent opaque predicates guard the two new edges,
//! each built from a tamper-seeded stack variable rather than a literal
//! constant so the tautology isn't visible to a pattern matcher reading
//! the instruction stream.
//!
//! Blocks with no real instructions (only PHIs and a terminator) are
//! skipped: there is nothing to guard.

use std::collections::HashMap;

use ir_core::{BasicBlock, Builder, Function, InstKind, Instruction, IntPredicate, Opcode, Type, Value};
use rand::Rng;

use crate::pass::{FunctionPass, Pass, PassContext, PassInfo, PassResult};
use crate::rewrite::build_seeded_stack_ptr;

pub struct BogusControlFlowPass {
    pub probability: f64,
}

impl Pass for BogusControlFlowPass {
    fn info(&self) -> PassInfo {
        PassInfo {
            name: "bogus_control_flow",
            description: "[Pluto] splits blocks behind opaque predicates that always resolve the same way at runtime",
            is_module_pass: false,
        }
    }
}

/// `(x * (x + 1)) mod 2 == 0`, always true since the product of two
/// consecutive integers is always even. `x` is read back from a stack
/// slot seeded with a random value rather than used as a bare literal.
fn opaque_predicate_parity(b: &mut Builder, function: &Function, ctx: &mut PassContext) -> Value {
    let seed = ctx.rng.inner_mut().gen_range(2..1000);
    let x_ptr = build_seeded_stack_ptr(function, Type::i32(), Value::ConstInt(Type::i32(), seed));
    let x = b.build_load(Type::i32(), x_ptr);
    let one = Value::ConstInt(Type::i32(), 1);
    let x_plus_1 = b.build_add(x.clone(), one);
    let product = b.build_mul(x, x_plus_1);
    let two = Value::ConstInt(Type::i32(), 2);
    let remainder = b.build_urem(product, two);
    let zero = Value::ConstInt(Type::i32(), 0);
    b.build_icmp(IntPredicate::Eq, remainder, zero)
}

/// `y < 10 OR (z * (z + 1)) mod 2 == 0`. `y` is seeded in `0..10` so the
/// left disjunct alone already makes the whole predicate tautological;
/// the right disjunct is live but redundant padding.
fn opaque_predicate_bound_or_parity(b: &mut Builder, function: &Function, ctx: &mut PassContext) -> Value {
    let y_seed = ctx.rng.inner_mut().gen_range(0..10);
    let y_ptr = build_seeded_stack_ptr(function, Type::i64(), Value::ConstInt(Type::i64(), y_seed));
    let y = b.build_load(Type::i64(), y_ptr);
    let ten = Value::ConstInt(Type::i64(), 10);
    let bound = b.build_icmp(IntPredicate::Slt, y, ten);

    let z_seed = ctx.rng.inner_mut().gen_range(2..1000);
    let z_ptr = build_seeded_stack_ptr(function, Type::i64(), Value::ConstInt(Type::i64(), z_seed));
    let z = b.build_load(Type::i64(), z_ptr);
    let one = Value::ConstInt(Type::i64(), 1);
    let z_plus_1 = b.build_add(z.clone(), one);
    let product = b.build_mul(z, z_plus_1);
    let two = Value::ConstInt(Type::i64(), 2);
    let remainder = b.build_urem(product, two);
    let zero = Value::ConstInt(Type::i64(), 0);
    let parity = b.build_icmp(IntPredicate::Eq, remainder, zero);

    b.build_or(bound, parity)
}

/// Clones `insts` with every intra-block SSA name replaced by a fresh one
/// prefixed `clone_prefix`, so the clone defines its own values instead
/// of redefining the original block's.
fn clone_instructions(insts: &[Instruction], clone_prefix: &str) -> Vec<Instruction> {
    let mut rename: HashMap<String, String> = HashMap::new();
    for inst in insts {
        if let Some(name) = &inst.name {
            rename.insert(name.clone(), format!("{}.{}", clone_prefix, name));
        }
    }
    let remap = |v: &Value| -> Value {
        match v {
            Value::Inst(ty, n) => match rename.get(n) {
                Some(new_n) => Value::Inst(ty.clone(), new_n.clone()),
                None => v.clone(),
            },
            other => other.clone(),
        }
    };
    insts
        .iter()
        .map(|inst| Instruction {
            opcode: inst.opcode,
            ty: inst.ty.clone(),
            name: inst.name.as_ref().map(|n| rename[n].clone()),
            operands: inst.operands.iter().map(remap).collect(),
            kind: inst.kind.clone(),
        })
        .collect()
}

/// Adds an `undef` incoming value for `pred_name` to every leading PHI in
/// `block`, needed once `block` gains `clone` as an extra predecessor.
fn add_undef_incoming_to_phis(block: &BasicBlock, pred_name: &str) {
    block.with_instructions(|insts| {
        for inst in insts.iter_mut() {
            if let InstKind::Phi { incoming } = &mut inst.kind {
                incoming.push((pred_name.to_string(), Value::Undef(inst.ty.clone())));
            } else {
                break;
            }
        }
    });
}

impl FunctionPass for BogusControlFlowPass {
    fn run_on_function(&mut self, function: &Function, ctx: &mut PassContext) -> PassResult<bool> {
        let blocks = function.blocks();
        let mut changed = false;

        for block in &blocks {
            if block.is_empty_of_real_work() {
                continue;
            }
            if !ctx.rng.inner_mut().gen_bool(self.probability.clamp(0.0, 1.0)) {
                continue;
            }

            let all_insts = block.instructions();
            let split = block.first_non_phi_index();
            let head_phis = all_insts[..split].to_vec();
            let terminator = all_insts.last().cloned().expect("block has a terminator");
            let body_insts = all_insts[split..all_insts.len() - 1].to_vec();

            let body_name = function.fresh_block_name(&format!("{}_bcf_body", block.name()));
            let clone_name = function.fresh_block_name(&format!("{}_bcf_clone", block.name()));
            let tail_name = function.fresh_block_name(&format!("{}_bcf_tail", block.name()));

            let tail_block = BasicBlock::new(tail_name.clone());
            tail_block.push_instruction(terminator);

            let clone_insts = clone_instructions(&body_insts, &format!("{}.clone", block.name()));
            let clone_block = BasicBlock::new(clone_name.clone());
            clone_block.set_instructions(clone_insts);
            let mut cb = Builder::new(function);
            cb.position_at_end(clone_block.clone());
            cb.build_br(&body_name);

            let body_block = BasicBlock::new(body_name.clone());
            body_block.set_instructions(body_insts);
            add_undef_incoming_to_phis(&body_block, &clone_name);
            let mut bb = Builder::new(function);
            bb.position_at_end(body_block.clone());
            let p2 = opaque_predicate_parity(&mut bb, function, ctx);
            bb.build_cond_br(p2, &tail_name, &clone_name);

            block.set_instructions(head_phis);
            let mut hb = Builder::new(function);
            hb.position_at_end(block.clone());
            let p1 = opaque_predicate_bound_or_parity(&mut hb, function, ctx);
            hb.build_cond_br(p1, &body_name, &clone_name);

            function.append_block(body_block);
            function.append_block(clone_block);
            function.append_block(tail_block);
            changed = true;
        }

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir_core::verification::verify_function;

    #[test]
    fn splits_a_block_with_real_work_into_four_blocks() {
        let f = Function::new("f", Type::Void, vec![]);
        let bb = BasicBlock::new("entry");
        bb.push_instruction(Instruction::new(
            Opcode::Add,
            Type::i32(),
            Some("v".into()),
            vec![Value::ConstInt(Type::i32(), 1), Value::ConstInt(Type::i32(), 1)],
        ));
        bb.push_instruction(Instruction::new(Opcode::Ret, Type::Void, None, vec![]));
        f.append_block(bb);

        let mut pass = BogusControlFlowPass { probability: 1.0 };
        let mut ctx = PassContext::new(3);
        let changed = pass.run_on_function(&f, &mut ctx).unwrap();
        assert!(changed);
        assert_eq!(f.block_count(), 4);
        verify_function(&f).unwrap();
    }

    #[test]
    fn zero_probability_never_splits() {
        let f = Function::new("f", Type::Void, vec![]);
        let bb = BasicBlock::new("entry");
        bb.push_instruction(Instruction::new(
            Opcode::Add,
            Type::i32(),
            Some("v".into()),
            vec![Value::ConstInt(Type::i32(), 1), Value::ConstInt(Type::i32(), 1)],
        ));
        bb.push_instruction(Instruction::new(Opcode::Ret, Type::Void, None, vec![]));
        f.append_block(bb);

        let mut pass = BogusControlFlowPass { probability: 0.0 };
        let mut ctx = PassContext::new(3);
        assert!(!pass.run_on_function(&f, &mut ctx).unwrap());
        assert_eq!(f.block_count(), 1);
    }

    #[test]
    fn empty_of_real_work_block_is_skipped() {
        let f = Function::new("f", Type::Void, vec![]);
        let bb = BasicBlock::new("entry");
        bb.push_instruction(Instruction::new(Opcode::Ret, Type::Void, None, vec![]));
        f.append_block(bb);
        let mut pass = BogusControlFlowPass { probability: 1.0 };
        let mut ctx = PassContext::new(3);
        assert!(!pass.run_on_function(&f, &mut ctx).unwrap());
    }

    #[test]
    fn clone_block_is_unreachable_at_runtime_but_present_in_the_cfg() {
        let f = Function::new("f", Type::Void, vec![]);
        let bb = BasicBlock::new("entry");
        bb.push_instruction(Instruction::new(
            Opcode::Add,
            Type::i32(),
            Some("v".into()),
            vec![Value::ConstInt(Type::i32(), 2), Value::ConstInt(Type::i32(), 3)],
        ));
        bb.push_instruction(Instruction::new(Opcode::Ret, Type::Void, None, vec![]));
        f.append_block(bb);

        let mut pass = BogusControlFlowPass { probability: 1.0 };
        let mut ctx = PassContext::new(7);
        pass.run_on_function(&f, &mut ctx).unwrap();
        verify_function(&f).unwrap();

        let clone = f
            .blocks()
            .into_iter()
            .find(|b| b.name().contains("_bcf_clone"))
            .expect("clone block exists");
        let body = f
            .blocks()
            .into_iter()
            .find(|b| b.name().contains("_bcf_body"))
            .expect("body block exists");
        let clone_term = clone.terminator().unwrap();
        assert_eq!(clone_term.opcode, Opcode::Br);
        let InstKind::Br { target } = &clone_term.kind else {
            panic!("clone should end in an unconditional br");
        };
        assert_eq!(target, &body.name());
    }
}
