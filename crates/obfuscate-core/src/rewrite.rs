//! Small rewrite helpers shared by the passes in this crate: hunting for
//! the next instruction a pass still needs to visit, replacing every use
//! of a value once its replacement is built, and removing the original.

use std::collections::HashSet;

use ir_core::{BasicBlock, Function, Instruction, Type, Value};

/// Finds the first not-yet-processed instruction in `function` matching
/// `pred`, scanning blocks and instructions in declaration order so a
/// pass's output doesn't depend on hash-map iteration order.
pub fn find_unprocessed<F>(
    function: &Function,
    processed: &HashSet<String>,
    pred: F,
) -> Option<(BasicBlock, usize, Instruction)>
where
    F: Fn(&Instruction) -> bool,
{
    for block in function.blocks() {
        let insts = block.instructions();
        for (i, inst) in insts.iter().enumerate() {
            if !pred(inst) {
                continue;
            }
            if let Some(name) = &inst.name {
                if processed.contains(name) {
                    continue;
                }
            }
            return Some((block.clone(), i, inst.clone()));
        }
    }
    None
}

/// Rewrites every operand (and PHI incoming value) across every block of
/// `function` that currently reads `old` to read `new` instead.
pub fn replace_value_in_function(function: &Function, old: &Value, new: &Value) {
    for block in function.blocks() {
        block.with_instructions(|insts| {
            for inst in insts.iter_mut() {
                inst.replace_uses_of(old, new);
            }
        });
    }
}

pub fn remove_instruction_at(block: &BasicBlock, index: usize) {
    block.with_instructions(|insts| {
        insts.remove(index);
    });
}

/// Looks up an instruction's current index by its SSA name, needed after
/// a builder has inserted new instructions ahead of it and shifted it
/// forward.
pub fn find_index_by_name(block: &BasicBlock, name: &str) -> Option<usize> {
    block
        .instructions()
        .iter()
        .position(|i| i.name.as_deref() == Some(name))
}

/// Allocates a stack slot of type `ty` at `function`'s entry block, stores
/// `value` into it, and returns the pointer. Loading it back at the point
/// of use (rather than reusing the constant directly) gives an opaque
/// predicate or index computation an operand a constant folder can't see
/// through statically.
///
/// Must be called before positioning any other builder inside the entry
/// block in the same pass invocation: it inserts ahead of that block's
/// first non-PHI instruction, which would desynchronize an already
/// positioned `Builder`'s cursor into the same block.
pub fn build_seeded_stack_ptr(function: &Function, ty: Type, value: Value) -> Value {
    use ir_core::Builder;

    let entry = function.entry_block().expect("function has an entry block");
    let mut seed = Builder::new(function);
    seed.position_before_index(entry.clone(), entry.first_non_phi_index());
    let ptr = seed.build_alloca(ty);
    seed.build_store(value, ptr.clone());
    ptr
}

/// Specialization of [`build_seeded_stack_ptr`] for the `i8` constant `1`,
/// used as the tamper-seeded `r` in `(¬a ∧ r) ∨ (a ∧ ¬r)`-shaped index and
/// predicate rewrites.
pub fn build_opaque_one_ptr(function: &Function) -> Value {
    build_seeded_stack_ptr(function, Type::i8(), Value::ConstInt(Type::i8(), 1))
}
