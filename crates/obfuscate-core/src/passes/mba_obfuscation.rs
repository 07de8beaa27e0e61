//! MBA Obfuscation (§4.7)
//!
//! Like arithmetic substitution, but the replacement expression's
//! coefficients come from [`crate::mba::search`] instead of one fixed
//! identity, so the same source operation expands into a different
//! linear combination of bitwise terms depending on the run's seed.

use std::collections::HashSet;

use ir_core::{Builder, Function, Type, Value};

use crate::mba::{self, BasisTerm};
use crate::pass::{FunctionPass, Pass, PassContext, PassInfo, PassResult};
use crate::rewrite::{find_index_by_name, find_unprocessed, remove_instruction_at, replace_value_in_function};

pub struct MbaObfuscationPass {
    pub max_terms: u32,
}

impl Pass for MbaObfuscationPass {
    fn info(&self) -> PassInfo {
        PassInfo {
            name: "mba_obfuscation",
            description: "[Pluto] rewrites arithmetic through a solver-derived linear mixed boolean-arithmetic expansion",
            is_module_pass: false,
        }
    }
}

fn emit_basis(b: &mut Builder, term: BasisTerm, ty: &Type, a: Value, bval: Value) -> Value {
    match term {
        BasisTerm::One => Value::ConstInt(ty.clone(), 1),
        BasisTerm::A => a,
        BasisTerm::B => bval,
        BasisTerm::AAndB => b.build_and(a, bval),
        BasisTerm::AOrB => b.build_or(a, bval),
        BasisTerm::AXorB => b.build_xor(a, bval),
        BasisTerm::NotAAndB => {
            let all_ones = Value::ConstInt(ty.clone(), -1);
            let not_a = b.build_xor(a, all_ones);
            b.build_and(not_a, bval)
        }
        BasisTerm::AAndNotB => {
            let all_ones = Value::ConstInt(ty.clone(), -1);
            let not_b = b.build_xor(bval, all_ones);
            b.build_and(a, not_b)
        }
    }
}

impl FunctionPass for MbaObfuscationPass {
    fn run_on_function(&mut self, function: &Function, ctx: &mut PassContext) -> PassResult<bool> {
        let mut changed = false;
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

            let Some(solution) =
                mba::search(inst.opcode, self.max_terms as usize, 6, ctx.rng.inner_mut())
            else {
                continue;
            };

            let lhs = inst.operands[0].clone();
            let rhs = inst.operands[1].clone();
            let ty = inst.ty.clone();

            let mut b = Builder::new(function);
            b.position_before_index(block.clone(), index);
            let mut sum: Option<Value> = None;
            for (coeff, term) in solution {
                let term_val = emit_basis(&mut b, term, &ty, lhs.clone(), rhs.clone());
                let c = Value::ConstInt(ty.clone(), coeff);
                let scaled = b.build_mul(term_val, c);
                sum = Some(match sum {
                    None => scaled,
                    Some(s) => b.build_add(s, scaled),
                });
            }
            let new_val = sum.unwrap_or_else(|| Value::ConstInt(ty.clone(), 0));

            let old_val = Value::Inst(ty, name.clone());
            replace_value_in_function(function, &old_val, &new_val);
            if let Some(i) = find_index_by_name(&block, &name) {
                remove_instruction_at(&block, i);
            }
            changed = true;
        }

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir_core::{verification::verify_function, BasicBlock, Instruction, Opcode};

    #[test]
    fn rewrites_xor_into_a_linear_combination() {
        let f = Function::new("f", Type::i32(), vec![]);
        let bb = BasicBlock::new("entry");
        bb.push_instruction(Instruction::new(
            Opcode::Xor,
            Type::i32(),
            Some("x".into()),
            vec![Value::ConstInt(Type::i32(), 5), Value::ConstInt(Type::i32(), 9)],
        ));
        bb.push_instruction(Instruction::new(
            Opcode::Ret,
            Type::Void,
            None,
            vec![Value::Inst(Type::i32(), "x".into())],
        ));
        f.append_block(bb.clone());

        let mut pass = MbaObfuscationPass { max_terms: 4 };
        let mut ctx = PassContext::new(2);
        let changed = pass.run_on_function(&f, &mut ctx).unwrap();
        assert!(changed);
        verify_function(&f).unwrap();
        assert!(bb.instruction_count() > 2);
    }
}
