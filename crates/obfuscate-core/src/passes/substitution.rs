//! Arithmetic Substitution (§4.6)
//!
//! Replaces `add`/`sub`/`and`/`or`/`xor` instructions with a longer but
//! behaviorally identical sequence drawn from a small catalog of
//! bitwise identities, chosen per-occurrence from the pipeline's shared
//! RNG. Every identity here is exact over two's-complement machine
//! integers, not an approximation, so no `iterations` count can change
//! the function's observable behavior, only how much the IR obscures it.

use std::collections::HashSet;

use ir_core::{Builder, Opcode, Type, Value};

use crate::pass::{Pass, PassContext, PassInfo, PassResult};
use crate::rewrite::{find_index_by_name, find_unprocessed, remove_instruction_at, replace_value_in_function};

pub struct ArithmeticSubstitutionPass {
    pub iterations: u32,
}

impl Pass for ArithmeticSubstitutionPass {
    fn info(&self) -> PassInfo {
        PassInfo {
            name: "arithmetic_substitution",
            description: "[Pluto] replaces arithmetic instructions with behaviorally identical bitwise identity chains",
            is_module_pass: false,
        }
    }
}

impl crate::pass::FunctionPass for ArithmeticSubstitutionPass {
    fn run_on_function(
        &mut self,
        function: &ir_core::Function,
        ctx: &mut PassContext,
    ) -> PassResult<bool> {
        let mut changed = false;
        for _ in 0..self.iterations.max(1) {
            let mut processed = HashSet::new();
            loop {
                let found = find_unprocessed(function, &processed, |i| {
                    i.opcode.is_substitutable() && i.name.is_some() && i.operands.len() == 2
                });
                let Some((block, index, inst)) = found else {
                    break;
                };
                let name = inst.name.clone().unwrap();
                processed.insert(name.clone());

                let lhs = inst.operands[0].clone();
                let rhs = inst.operands[1].clone();
                let ty = inst.ty.clone();

                let mut builder = Builder::new(function);
                builder.position_before_index(block.clone(), index);
                let new_val = emit_pattern(&mut builder, inst.opcode, &ty, lhs, rhs, ctx);

                let old_val = Value::Inst(ty, name.clone());
                replace_value_in_function(function, &old_val, &new_val);

                // The replacement sequence was inserted before `index`, so
                // the original instruction shifted forward; find it by name.
                if let Some(i) = find_index_by_name(&block, &name) {
                    remove_instruction_at(&block, i);
                }
                changed = true;
            }
        }
        Ok(changed)
    }
}

fn emit_pattern(
    b: &mut Builder,
    opcode: Opcode,
    ty: &Type,
    lhs: Value,
    rhs: Value,
    ctx: &mut PassContext,
) -> Value {
    use rand::Rng;
    match opcode {
        Opcode::Add => {
            // a + b = (a ^ b) + ((a & b) << 1)
            let x = b.build_xor(lhs.clone(), rhs.clone());
            let a = b.build_and(lhs, rhs);
            let one = Value::ConstInt(ty.clone(), 1);
            let shifted = b.build_shl(a, one);
            b.build_add(x, shifted)
        }
        Opcode::Sub => {
            if ctx.rng.inner_mut().gen_bool(0.5) {
                // a - b = a + (~b + 1)
                let all_ones = Value::ConstInt(ty.clone(), -1);
                let not_b = b.build_xor(rhs, all_ones);
                let one = Value::ConstInt(ty.clone(), 1);
                let neg_b = b.build_add(not_b, one);
                b.build_add(lhs, neg_b)
            } else {
                // a - b = (a ^ b) - 2*(~a & b)
                let x = b.build_xor(lhs.clone(), rhs.clone());
                let all_ones = Value::ConstInt(ty.clone(), -1);
                let not_a = b.build_xor(lhs, all_ones);
                let and_ = b.build_and(not_a, rhs);
                let one = Value::ConstInt(ty.clone(), 1);
                let shifted = b.build_shl(and_, one);
                b.build_sub(x, shifted)
            }
        }
        Opcode::And => {
            // a & b = (a | b) - (a ^ b)
            let or_ = b.build_or(lhs.clone(), rhs.clone());
            let xor_ = b.build_xor(lhs, rhs);
            b.build_sub(or_, xor_)
        }
        Opcode::Or => {
            // a | b = (a & b) + (a ^ b)
            let and_ = b.build_and(lhs.clone(), rhs.clone());
            let xor_ = b.build_xor(lhs, rhs);
            b.build_add(and_, xor_)
        }
        Opcode::Xor => {
            // a ^ b = (a | b) - (a & b)
            let or_ = b.build_or(lhs.clone(), rhs.clone());
            let and_ = b.build_and(lhs, rhs);
            b.build_sub(or_, and_)
        }
        _ => unreachable!("is_substitutable() restricts the opcode set"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pass::FunctionPass;
    use ir_core::{BasicBlock, Function, Instruction};

    #[test]
    fn rewrites_add_without_changing_terminator() {
        let f = Function::new("f", Type::i32(), vec![]);
        let bb = BasicBlock::new("entry");
        bb.push_instruction(Instruction::new(
            Opcode::Add,
            Type::i32(),
            Some("sum".into()),
            vec![Value::ConstInt(Type::i32(), 3), Value::ConstInt(Type::i32(), 4)],
        ));
        bb.push_instruction(Instruction::new(
            Opcode::Ret,
            Type::Void,
            None,
            vec![Value::Inst(Type::i32(), "sum".into())],
        ));
        f.append_block(bb.clone());

        let mut pass = ArithmeticSubstitutionPass { iterations: 1 };
        let mut ctx = PassContext::new(7);
        let changed = pass.run_on_function(&f, &mut ctx).unwrap();
        assert!(changed);
        assert!(bb.instruction_count() > 2);
        let ret = bb.terminator().unwrap();
        assert_eq!(ret.opcode, Opcode::Ret);
        assert!(!ret.operands[0].is_constant());
    }
}
