//! Function Merging (§4.8)
//!
//! Functions that share a signature are folded into one body behind a
//! `switch` on an injected selector parameter; each original function
//! becomes a thin wrapper that calls the merged body with its group
//! index. A disassembler sees one large function instead of several
//! small ones with recognizable boundaries.

use std::collections::{HashMap, HashSet};

use ir_core::{
    BasicBlock, Builder, CallTarget, Function, InstKind, Instruction, Module, Type, Value,
};

use crate::pass::{ModulePass, Pass, PassContext, PassInfo, PassResult};

pub struct FunctionMergePass {
    pub min_group_size: usize,
}

impl Pass for FunctionMergePass {
    fn info(&self) -> PassInfo {
        PassInfo {
            name: "function_merge",
            description: "[Polaris] merges same-signature functions behind a discriminator parameter",
            is_module_pass: true,
        }
    }
}

fn signature_key(f: &Function) -> String {
    let params: Vec<String> = f.param_types().iter().map(|t| t.to_string()).collect();
    format!("{}({})", f.return_type(), params.join(","))
}

/// Renames a group member's blocks and value names with an `f{idx}.`
/// prefix so merging several bodies into one function can't collide,
/// and shifts every `Param` operand up by one slot for the selector.
fn rename_instruction(
    inst: &Instruction,
    block_rename: &HashMap<String, String>,
    value_rename: &HashMap<String, String>,
) -> Instruction {
    let remap_value = |v: &Value| -> Value {
        match v {
            Value::Inst(ty, n) => Value::Inst(ty.clone(), value_rename[n].clone()),
            Value::Param(ty, i) => Value::Param(ty.clone(), i + 1),
            other => other.clone(),
        }
    };
    let remap_label = |l: &str| -> String { block_rename[l].clone() };

    let new_name = inst.name.as_ref().map(|n| value_rename[n].clone());
    let new_operands: Vec<Value> = inst.operands.iter().map(remap_value).collect();
    let new_kind = match &inst.kind {
        InstKind::Br { target } => InstKind::Br {
            target: remap_label(target),
        },
        InstKind::CondBr {
            then_target,
            else_target,
        } => InstKind::CondBr {
            then_target: remap_label(then_target),
            else_target: remap_label(else_target),
        },
        InstKind::Switch { default, cases } => InstKind::Switch {
            default: remap_label(default),
            cases: cases
                .iter()
                .map(|(v, t)| (*v, remap_label(t)))
                .collect(),
        },
        InstKind::IndirectBr { possible_targets } => InstKind::IndirectBr {
            possible_targets: possible_targets.iter().map(|t| remap_label(t)).collect(),
        },
        InstKind::Phi { incoming } => InstKind::Phi {
            incoming: incoming
                .iter()
                .map(|(label, v)| (remap_label(label), remap_value(v)))
                .collect(),
        },
        InstKind::Call { callee, cc } => InstKind::Call {
            callee: callee.clone(),
            cc: *cc,
        },
        other => other.clone(),
    };
    Instruction {
        opcode: inst.opcode,
        ty: inst.ty.clone(),
        name: new_name,
        operands: new_operands,
        kind: new_kind,
    }
}

fn merge_group(group: &[Function], group_id: usize) -> (Function, Vec<(String, usize)>) {
    let ret_ty = group[0].return_type();
    let mut param_types = vec![Type::i32()];
    param_types.extend(group[0].param_types());
    let merged = Function::new(format!("merged.{}", group_id), ret_ty, param_types);

    let mut dispatch_cases = Vec::new();
    let mut assignments = Vec::new();
    let mut all_blocks = Vec::new();

    for (idx, f) in group.iter().enumerate() {
        let mut block_rename = HashMap::new();
        let mut value_rename = HashMap::new();
        for block in f.blocks() {
            block_rename.insert(block.name(), format!("f{}.{}", idx, block.name()));
            for inst in block.instructions() {
                if let Some(name) = &inst.name {
                    value_rename.insert(name.clone(), format!("f{}.{}", idx, name));
                }
            }
        }

        let entry_name = f.entry_block().map(|b| b.name());
        if let Some(entry_name) = entry_name {
            dispatch_cases.push((idx as i64, block_rename[&entry_name].clone()));
        }

        for block in f.blocks() {
            let new_block = BasicBlock::new(block_rename[&block.name()].clone());
            for inst in block.instructions() {
                new_block.push_instruction(rename_instruction(&inst, &block_rename, &value_rename));
            }
            all_blocks.push(new_block);
        }

        assignments.push((f.name(), idx));
    }

    let dispatch = BasicBlock::new("dispatch");
    merged.append_block(dispatch.clone());
    for block in all_blocks {
        merged.append_block(block);
    }

    let trap = BasicBlock::new("dispatch.trap");
    let mut b = Builder::new(&merged);
    b.position_at_end(trap.clone());
    b.build_unreachable();
    merged.append_block(trap);

    let mut b = Builder::new(&merged);
    b.position_at_end(dispatch);
    let selector = Value::Param(Type::i32(), 0);
    b.build_switch(selector, "dispatch.trap", dispatch_cases);

    (merged, assignments)
}

/// Replaces `f`'s body with a call through to `merged` carrying `idx` as
/// the selector and `f`'s own parameters unshifted.
fn rewrite_as_wrapper(f: &Function, merged: &Function, idx: usize) {
    let entry = BasicBlock::new("entry");
    f.set_blocks(vec![]);
    f.append_block(entry.clone());
    let mut b = Builder::new(f);
    b.position_at_end(entry);

    let mut args = vec![Value::ConstInt(Type::i32(), idx as i64)];
    for (i, ty) in f.param_types().into_iter().enumerate() {
        args.push(Value::Param(ty, i));
    }
    let ret_ty = f.return_type();
    let want_result = !ret_ty.is_void();
    let result = b.build_call(ret_ty, CallTarget::Direct(merged.name()), f.calling_conv(), args, want_result);
    match result {
        Some(v) => b.build_ret(v),
        None => b.build_ret_void(),
    }
}

impl ModulePass for FunctionMergePass {
    fn run_on_module(
        &mut self,
        module: &mut Module,
        _ctx: &mut PassContext,
        selected_functions: Option<&HashSet<String>>,
    ) -> PassResult<bool> {
        let mut groups: HashMap<String, Vec<Function>> = HashMap::new();
        for f in module.functions() {
            if f.is_declaration() {
                continue;
            }
            if let Some(set) = selected_functions {
                if !set.contains(&f.name()) {
                    continue;
                }
            }
            groups.entry(signature_key(f)).or_default().push(f.clone());
        }

        let mut changed = false;
        let mut group_id = 0usize;
        let mut merged_functions = Vec::new();

        let mut keys: Vec<String> = groups.keys().cloned().collect();
        keys.sort();
        for key in keys {
            let group = &groups[&key];
            if group.len() < self.min_group_size {
                continue;
            }
            let (merged, assignments) = merge_group(group, group_id);
            group_id += 1;
            for (name, idx) in assignments {
                let f = module.function_by_name(&name).unwrap().clone();
                rewrite_as_wrapper(&f, &merged, idx);
            }
            merged_functions.push(merged);
            changed = true;
        }

        for merged in merged_functions {
            module.add_function(merged);
        }

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir_core::{verification::verify_module, Opcode};

    fn make_adder(name: &str) -> Function {
        let f = Function::new(name, Type::i32(), vec![Type::i32(), Type::i32()]);
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
        f
    }

    #[test]
    fn merges_same_signature_functions_into_one_body() {
        let mut m = Module::new("x86_64-unknown-linux-gnu");
        m.add_function(make_adder("add1"));
        m.add_function(make_adder("add2"));

        let mut pass = FunctionMergePass { min_group_size: 2 };
        let mut ctx = PassContext::new(21);
        let changed = pass.run_on_module(&mut m, &mut ctx, None).unwrap();
        assert!(changed);
        assert!(m.function_by_name("merged.0").is_some());
        verify_module(&m).unwrap();

        let add1 = m.function_by_name("add1").unwrap();
        assert_eq!(add1.block_count(), 1);
    }

    #[test]
    fn below_min_group_size_is_left_alone() {
        let mut m = Module::new("x86_64-unknown-linux-gnu");
        m.add_function(make_adder("solo"));

        let mut pass = FunctionMergePass { min_group_size: 2 };
        let mut ctx = PassContext::new(21);
        assert!(!pass.run_on_module(&mut m, &mut ctx, None).unwrap());
    }
}
