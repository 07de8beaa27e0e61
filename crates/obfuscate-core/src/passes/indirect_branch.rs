//! Indirect Branch (§4.4)
//!
//! Replaces every direct `br`/`condbr` terminator with an `indirectbr`
//! whose target address is read out of a two-slot stack jump table
//! allocated at function entry and filled with `blockaddress` constants.
//! A conditional branch's two possible targets both get loaded
//! unconditionally; the real target is chosen by an index built from a
//! mixed-boolean-arithmetic identity equivalent to `!cond` rather than a
//! bare `select` on the condition itself, so the branch site carries no
//! opcode that names the original relation.

use std::collections::HashSet;

use ir_core::{BasicBlock, Builder, Function, InstKind, Module, Type, Value};

use crate::pass::{ModulePass, Pass, PassContext, PassInfo, PassResult};
use crate::rewrite::build_opaque_one_ptr;

pub struct IndirectBranchPass;

impl Pass for IndirectBranchPass {
    fn info(&self) -> PassInfo {
        PassInfo {
            name: "indirect_branch",
            description: "[Polaris] converts direct branches to table-driven indirect branches",
            is_module_pass: true,
        }
    }
}

/// Allocates a `slots`-wide pointer array at `function`'s entry block and
/// stores `values` into it, returning the slot pointers' base `alloca`.
fn build_stack_table(function: &Function, ptr_ty: &Type, values: &[Value]) -> Value {
    let entry = function.entry_block().expect("function has an entry block");
    let arr_ty = Type::array(ptr_ty.clone(), values.len());
    let mut seed = Builder::new(function);
    seed.position_before_index(entry.clone(), entry.first_non_phi_index());
    let table = seed.build_alloca(arr_ty.clone());
    for (i, v) in values.iter().enumerate() {
        let slot = seed.build_gep(arr_ty.clone(), table.clone(), vec![0, i as i64], ptr_ty.clone());
        seed.build_store(v.clone(), slot);
    }
    table
}

/// Builds `(!a & r) | (a & !r)`, which always equals `a ^ r`. With `r`
/// read back from a stack slot instead of supplied as a literal, the
/// expression never folds to a bare `xor` against a known constant.
fn mba_xor_with_opaque_r(b: &mut Builder, a: Value, r: Value) -> Value {
    let one = Value::ConstInt(Type::i1(), 1);
    let not_a = b.build_xor(a.clone(), one.clone());
    let not_r = b.build_xor(r.clone(), one);
    let left = b.build_and(not_a, r);
    let right = b.build_and(a, not_r);
    b.build_or(left, right)
}

fn rewrite_block(function: &Function, block: &BasicBlock) -> Option<bool> {
    let term = block.terminator()?;
    let ptr_ty = Type::ptr(Type::i8());

    match term.kind.clone() {
        InstKind::Br { target } => {
            let ba = Value::BlockAddress(ptr_ty.clone(), function.name(), target.clone());
            let table = build_stack_table(function, &ptr_ty, &[ba]);

            block.with_instructions(|v| {
                v.pop();
            });
            let arr_ty = Type::array(ptr_ty.clone(), 1);
            let mut b = Builder::new(function);
            b.position_at_end(block.clone());
            let slot = b.build_gep(arr_ty, table, vec![0, 0], ptr_ty.clone());
            let loaded = b.build_load(ptr_ty, slot);
            b.build_indirect_br(loaded, vec![target]);
            Some(true)
        }
        InstKind::CondBr {
            then_target,
            else_target,
        } => {
            let cond = term.operands[0].clone();
            let ba_then = Value::BlockAddress(ptr_ty.clone(), function.name(), then_target.clone());
            let ba_else = Value::BlockAddress(ptr_ty.clone(), function.name(), else_target.clone());
            let table = build_stack_table(function, &ptr_ty, &[ba_then, ba_else]);
            let r_ptr = build_opaque_one_ptr(function);

            block.with_instructions(|v| {
                v.pop();
            });
            let arr_ty = Type::array(ptr_ty.clone(), 2);
            let mut b = Builder::new(function);
            b.position_at_end(block.clone());
            let e0 = b.build_gep(arr_ty.clone(), table.clone(), vec![0, 0], ptr_ty.clone());
            let e1 = b.build_gep(arr_ty, table, vec![0, 1], ptr_ty.clone());
            let l0 = b.build_load(ptr_ty.clone(), e0);
            let l1 = b.build_load(ptr_ty, e1);
            let r = b.build_load(Type::i8(), r_ptr);
            let r_bool = b.build_trunc(r, Type::i1());
            let index = mba_xor_with_opaque_r(&mut b, cond, r_bool);
            // index == cond ^ r_bool, and r_bool is always 1, so index == !cond:
            // false when cond holds (selects l0, the then target).
            let addr = b.build_select(index, l1, l0);
            b.build_indirect_br(addr, vec![then_target, else_target]);
            Some(true)
        }
        _ => None,
    }
}

impl ModulePass for IndirectBranchPass {
    fn run_on_module(
        &mut self,
        module: &mut Module,
        _ctx: &mut PassContext,
        selected_functions: Option<&HashSet<String>>,
    ) -> PassResult<bool> {
        let functions: Vec<Function> = module.functions().to_vec();
        let mut changed = false;

        for function in &functions {
            if function.is_declaration() {
                continue;
            }
            if let Some(set) = selected_functions {
                if !set.contains(&function.name()) {
                    continue;
                }
            }
            for block in function.blocks() {
                if rewrite_block(function, &block).is_some() {
                    changed = true;
                }
            }
        }

        Ok(changed)
    }
}
