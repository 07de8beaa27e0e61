//! Control-Flow Flattening (§4.2)
//!
//! Collapses a function's block graph into a single dispatch loop driven
//! by a state variable: every original edge becomes "store the next
//! block's id, branch to the dispatcher", and the dispatcher is one
//! `switch` over that id.
//!
//! `encrypted_dispatch` XORs the stored id with a per-block key that is
//! itself assembled at runtime rather than known anywhere as a single
//! constant: each block generates a random key `K[i]`, and whenever a
//! block that dominates others actually runs, it XORs its own key into a
//! shared runtime `keys[]` slot for each block it dominates. By the time
//! a block starts, every one of its dominators has necessarily already
//! run, so its own `keys[i]` slot has accumulated exactly the XOR of
//! their keys — the same value `KEY_MAP[i]` this pass can also compute
//! statically from the dominator tree, but never writes down as a single
//! constant anywhere in the IR. A terminator's stored state is `keys[i]`
//! XORed with a compile-time constant derived from the target and
//! `KEY_MAP[i]`; the two cancel at runtime (the scheme obscures the
//! transition from block-local, pattern-matching inspection, not from
//! anyone willing to trace the dominance relation through).
//!
//! Functions containing PHI nodes or an `indirectbr` are left alone:
//! PHI demotion and dynamic targets both need analysis this pass doesn't
//! do, and a function this pass can't safely flatten should fall through
//! unmodified rather than produce a function flattening half-handled.
//! Blocks ending in `switch` keep their terminator untouched — they
//! still take part in key propagation and the dispatcher's case table,
//! just not in the store-then-jump-to-dispatcher rewrite.

use std::collections::HashMap;

use ir_core::{
    BasicBlock, Builder, Cfg, DominatorTree, Function, InstKind, IntPredicate, Opcode, Type, Value,
};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::pass::{FunctionPass, Pass, PassContext, PassInfo, PassResult};

pub struct FlatteningPass {
    pub encrypted_dispatch: bool,
}

impl Pass for FlatteningPass {
    fn info(&self) -> PassInfo {
        PassInfo {
            name: "flattening",
            description: "[Polaris] collapses a function's control flow into a single dispatch loop keyed on an encoded block id",
            is_module_pass: false,
        }
    }
}

/// Per-block bookkeeping computed once, before any block is touched.
struct KeyScheme {
    /// `K[i]`: this block's own random key.
    k: Vec<i64>,
    /// `KEY_MAP[i]`: XOR of `K[j]` over every `j` that dominates `i`.
    key_map: Vec<i64>,
    /// Indices of the other blocks that block `i` dominates.
    dominated: Vec<Vec<usize>>,
}

impl KeyScheme {
    fn build(names: &[String], dom: &DominatorTree, ctx: &mut PassContext) -> Self {
        let n = names.len();
        let k: Vec<i64> = (0..n)
            .map(|_| ctx.rng.inner_mut().gen_range(1i64..=0x7FFF_FFFF))
            .collect();

        let mut dominated = vec![Vec::new(); n];
        for i in 0..n {
            for j in 0..n {
                if i != j && dom.dominates(&names[i], &names[j]) {
                    dominated[i].push(j);
                }
            }
        }

        let key_map: Vec<i64> = (0..n)
            .map(|i| {
                (0..n)
                    .filter(|&j| j != i && dom.dominates(&names[j], &names[i]))
                    .fold(0i64, |acc, j| acc ^ k[j])
            })
            .collect();

        KeyScheme { k, key_map, dominated }
    }
}

/// Loads `keys[i]` and XORs it with the compile-time constant
/// `state[target_idx] ^ KEY_MAP[i]`, or just returns the plaintext target
/// state when there is no key scheme at all.
fn encoded_target(
    b: &mut Builder<'_>,
    state_ty: &Type,
    state: &[i64],
    n: usize,
    i: usize,
    target_idx: usize,
    scheme: Option<&KeyScheme>,
    keys_ptr: Option<&Value>,
) -> Value {
    match (scheme, keys_ptr) {
        (Some(scheme), Some(keys_ptr)) => {
            let combined = state[target_idx] ^ scheme.key_map[i];
            let slot = b.build_gep(
                Type::array(Type::i32(), n),
                keys_ptr.clone(),
                vec![0, i as i64],
                Type::ptr(Type::i32()),
            );
            let keys_i = b.build_load(Type::i32(), slot);
            b.build_xor(keys_i, Value::ConstInt(state_ty.clone(), combined))
        }
        _ => Value::ConstInt(state_ty.clone(), state[target_idx]),
    }
}

/// Emits the inline equivalent of `update_key(visited[i], dominated[i],
/// keys, K[i])`: on first visit only, XORs `K[i]` into `keys[j]` for every
/// `j` block `i` dominates, guarded by `visited[i]`. The dominator index
/// set is known at pass time, so it's unrolled directly rather than read
/// from a runtime table (this `FunctionPass` has no handle on the module
/// to place that table in as a global).
fn emit_update_key(
    function: &Function,
    block: &BasicBlock,
    keys_ptr: &Value,
    visited_ptr: &Value,
    i: usize,
    scheme: &KeyScheme,
) -> BasicBlock {
    let do_update_name = function.fresh_block_name("fl_do_update");
    let after_name = function.fresh_block_name("fl_after_update");

    let mut b = Builder::new(function);
    b.position_at_end(block.clone());
    let visited_i = b.build_gep(
        Type::array(Type::i8(), scheme.k.len()),
        visited_ptr.clone(),
        vec![0, i as i64],
        Type::ptr(Type::i8()),
    );
    let loaded = b.build_load(Type::i8(), visited_i.clone());
    let zero = Value::ConstInt(Type::i8(), 0);
    let not_visited = b.build_icmp(IntPredicate::Eq, loaded, zero);
    b.build_cond_br(not_visited, &do_update_name, &after_name);

    let do_update = BasicBlock::new(do_update_name.clone());
    let mut db = Builder::new(function);
    db.position_at_end(do_update.clone());
    let k_i = Value::ConstInt(Type::i32(), scheme.k[i]);
    for &j in &scheme.dominated[i] {
        let slot = db.build_gep(
            Type::array(Type::i32(), scheme.k.len()),
            keys_ptr.clone(),
            vec![0, j as i64],
            Type::ptr(Type::i32()),
        );
        let old = db.build_load(Type::i32(), slot.clone());
        let updated = db.build_xor(old, k_i.clone());
        db.build_store(updated, slot);
    }
    let one = Value::ConstInt(Type::i8(), 1);
    db.build_store(one, visited_i);
    db.build_br(&after_name);

    let after_update = BasicBlock::new(after_name);
    function.append_block(do_update);
    after_update
}

impl FunctionPass for FlatteningPass {
    fn run_on_function(&mut self, function: &Function, ctx: &mut PassContext) -> PassResult<bool> {
        let original_blocks = function.blocks();
        if original_blocks.len() < 2 {
            return Ok(false);
        }
        if original_blocks.iter().any(|b| !b.phis().is_empty()) {
            return Ok(false);
        }
        if original_blocks.iter().any(|b| {
            b.terminator()
                .map(|t| matches!(t.kind, InstKind::IndirectBr { .. }))
                .unwrap_or(false)
        }) {
            return Ok(false);
        }

        let names: Vec<String> = original_blocks.iter().map(|b| b.name()).collect();
        let n = names.len();

        let mut state_perm: Vec<i64> = (0..n as i64).collect();
        state_perm.shuffle(ctx.rng.inner_mut());
        let state: Vec<i64> = state_perm.iter().map(|p| 0x000F_0000 + p).collect();
        let id_of: HashMap<String, usize> = names.iter().cloned().zip(0..n).collect();

        let scheme = if self.encrypted_dispatch {
            let cfg = Cfg::build(function);
            let dom = DominatorTree::build(&cfg);
            Some(KeyScheme::build(&names, &dom, ctx))
        } else {
            None
        };

        let state_ty = Type::i32();
        let entry_name = function.fresh_block_name("fl_entry");
        let dispatcher_name = function.fresh_block_name("fl_dispatch");
        let trap_name = function.fresh_block_name("fl_trap");

        let new_entry = BasicBlock::new(entry_name.clone());
        let dispatcher = BasicBlock::new(dispatcher_name.clone());
        let trap = BasicBlock::new(trap_name.clone());

        let mut entry_builder = Builder::new(function);
        entry_builder.position_at_end(new_entry.clone());
        let state_ptr = entry_builder.build_alloca(state_ty.clone());

        let (keys_ptr, visited_ptr) = if scheme.is_some() {
            let keys_ptr = entry_builder.build_alloca(Type::array(Type::i32(), n));
            let visited_ptr = entry_builder.build_alloca(Type::array(Type::i8(), n));
            for i in 0..n {
                let ks = entry_builder.build_gep(
                    Type::array(Type::i32(), n),
                    keys_ptr.clone(),
                    vec![0, i as i64],
                    Type::ptr(Type::i32()),
                );
                entry_builder.build_store(Value::ConstInt(Type::i32(), 0), ks);
                let vs = entry_builder.build_gep(
                    Type::array(Type::i8(), n),
                    visited_ptr.clone(),
                    vec![0, i as i64],
                    Type::ptr(Type::i8()),
                );
                entry_builder.build_store(Value::ConstInt(Type::i8(), 0), vs);
            }
            (Some(keys_ptr), Some(visited_ptr))
        } else {
            (None, None)
        };

        entry_builder.build_store(Value::ConstInt(state_ty.clone(), state[0]), state_ptr.clone());
        entry_builder.build_br(&dispatcher_name);

        let mut trap_builder = Builder::new(function);
        trap_builder.position_at_end(trap.clone());
        trap_builder.build_unreachable();

        let mut extra_blocks = Vec::new();

        for (i, block) in original_blocks.iter().enumerate() {
            let term = match block.terminator() {
                Some(t) => t,
                None => continue,
            };

            let needs_update_key = scheme
                .as_ref()
                .map(|s| !s.dominated[i].is_empty())
                .unwrap_or(false);

            let active_block = if needs_update_key {
                block.with_instructions(|v| {
                    v.pop();
                });
                let after = emit_update_key(
                    function,
                    block,
                    keys_ptr.as_ref().unwrap(),
                    visited_ptr.as_ref().unwrap(),
                    i,
                    scheme.as_ref().unwrap(),
                );
                extra_blocks.push(after.clone());
                after
            } else {
                block.clone()
            };

            match term.kind.clone() {
                InstKind::Br { target } => {
                    let tgt_idx = id_of[&target];
                    if !needs_update_key {
                        block.with_instructions(|v| {
                            v.pop();
                        });
                    }
                    let mut b = Builder::new(function);
                    b.position_at_end(active_block.clone());
                    let encoded = encoded_target(&mut b, &state_ty, &state, n, i, tgt_idx, scheme.as_ref(), keys_ptr.as_ref());
                    b.build_store(encoded, state_ptr.clone());
                    b.build_br(&dispatcher_name);
                }
                InstKind::CondBr {
                    then_target,
                    else_target,
                } => {
                    let cond = term.operands[0].clone();
                    let then_idx = id_of[&then_target];
                    let else_idx = id_of[&else_target];
                    if !needs_update_key {
                        block.with_instructions(|v| {
                            v.pop();
                        });
                    }
                    let mut b = Builder::new(function);
                    b.position_at_end(active_block.clone());
                    let then_val = encoded_target(&mut b, &state_ty, &state, n, i, then_idx, scheme.as_ref(), keys_ptr.as_ref());
                    let else_val = encoded_target(&mut b, &state_ty, &state, n, i, else_idx, scheme.as_ref(), keys_ptr.as_ref());
                    let selected = b.build_select(cond, then_val, else_val);
                    b.build_store(selected, state_ptr.clone());
                    b.build_br(&dispatcher_name);
                }
                _ => {
                    // Switch / Ret / Unreachable: left untouched. A switch
                    // keeps its original multi-way edges; Ret/Unreachable
                    // are genuine exits. The update_key prologue (if any)
                    // already popped the terminator off `block`, so it
                    // has to be reattached to the block it now lands in.
                    if needs_update_key {
                        active_block.push_instruction(term.clone());
                    }
                }
            }
        }

        let mut new_blocks = vec![new_entry];
        new_blocks.extend(original_blocks.iter().cloned());
        new_blocks.extend(extra_blocks);
        new_blocks.push(dispatcher.clone());
        new_blocks.push(trap);

        let mut db = Builder::new(function);
        db.position_at_end(dispatcher);
        let loaded = db.build_load(state_ty.clone(), state_ptr);
        let cases: Vec<(i64, String)> = names.iter().enumerate().map(|(i, name)| (state[i], name.clone())).collect();
        db.build_switch(loaded, &trap_name, cases);

        function.set_blocks(new_blocks);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir_core::{verification::verify_function, Instruction};

    fn two_block_function() -> Function {
        let f = Function::new("f", Type::Void, vec![]);
        let entry = BasicBlock::new("entry");
        let exit = BasicBlock::new("exit");
        entry.push_instruction(
            Instruction::new(Opcode::Br, Type::Void, None, vec![]).with_kind(InstKind::Br {
                target: "exit".into(),
            }),
        );
        exit.push_instruction(Instruction::new(Opcode::Ret, Type::Void, None, vec![]));
        f.append_block(entry);
        f.append_block(exit);
        f
    }

    fn diamond_function() -> Function {
        let f = Function::new("f", Type::Void, vec![]);
        let entry = BasicBlock::new("entry");
        let left = BasicBlock::new("left");
        let right = BasicBlock::new("right");
        let join = BasicBlock::new("join");
        entry.push_instruction(
            Instruction::new(Opcode::CondBr, Type::Void, None, vec![Value::ConstInt(Type::i1(), 1)])
                .with_kind(InstKind::CondBr {
                    then_target: "left".into(),
                    else_target: "right".into(),
                }),
        );
        left.push_instruction(
            Instruction::new(Opcode::Br, Type::Void, None, vec![]).with_kind(InstKind::Br {
                target: "join".into(),
            }),
        );
        right.push_instruction(
            Instruction::new(Opcode::Br, Type::Void, None, vec![]).with_kind(InstKind::Br {
                target: "join".into(),
            }),
        );
        join.push_instruction(Instruction::new(Opcode::Ret, Type::Void, None, vec![]));
        f.append_block(entry);
        f.append_block(left);
        f.append_block(right);
        f.append_block(join);
        f
    }

    #[test]
    fn flattens_and_stays_verifiable() {
        let f = two_block_function();
        let mut pass = FlatteningPass {
            encrypted_dispatch: false,
        };
        let mut ctx = PassContext::new(1);
        let changed = pass.run_on_function(&f, &mut ctx).unwrap();
        assert!(changed);
        assert!(f.block_count() > 2);
        verify_function(&f).unwrap();
    }

    #[test]
    fn encrypted_dispatch_on_a_diamond_still_verifies() {
        let f = diamond_function();
        let mut pass = FlatteningPass {
            encrypted_dispatch: true,
        };
        let mut ctx = PassContext::new(99);
        let changed = pass.run_on_function(&f, &mut ctx).unwrap();
        assert!(changed);
        verify_function(&f).unwrap();
    }

    #[test]
    fn encrypted_dispatch_allocates_keys_and_visited_arrays() {
        let f = diamond_function();
        let mut pass = FlatteningPass {
            encrypted_dispatch: true,
        };
        let mut ctx = PassContext::new(7);
        pass.run_on_function(&f, &mut ctx).unwrap();
        let entry = f.entry_block().unwrap();
        let alloca_count = entry.instructions().iter().filter(|i| i.opcode == Opcode::Alloca).count();
        // state slot + keys array + visited array.
        assert_eq!(alloca_count, 3);
    }

    #[test]
    fn single_block_function_is_skipped() {
        let f = Function::new("f", Type::Void, vec![]);
        let bb = BasicBlock::new("entry");
        bb.push_instruction(Instruction::new(Opcode::Ret, Type::Void, None, vec![]));
        f.append_block(bb);
        let mut pass = FlatteningPass {
            encrypted_dispatch: false,
        };
        let mut ctx = PassContext::new(1);
        assert!(!pass.run_on_function(&f, &mut ctx).unwrap());
    }
}
