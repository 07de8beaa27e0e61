//! Calling Convention Randomization (§4.10)
//!
//! Assigns each defined function a calling convention drawn from
//! [`CallingConv::RANDOM_POOL`] instead of the default `C`, then patches
//! every direct call site in the module so the `cc` recorded on the call
//! matches the callee's new convention. A mismatch there would be a
//! correctness bug in a real backend, not just an obfuscation wrinkle.

use std::collections::{HashMap, HashSet};

use ir_core::{CallTarget, CallingConv, InstKind, Module};
use rand::seq::SliceRandom;

use crate::pass::{ModulePass, Pass, PassContext, PassInfo, PassResult};

pub struct CallingConventionPass;

impl Pass for CallingConventionPass {
    fn info(&self) -> PassInfo {
        PassInfo {
            name: "calling_convention",
            description: "[Polaris] randomizes each function's calling convention and patches call sites to match",
            is_module_pass: true,
        }
    }
}

impl ModulePass for CallingConventionPass {
    fn run_on_module(
        &mut self,
        module: &mut Module,
        ctx: &mut PassContext,
        selected_functions: Option<&HashSet<String>>,
    ) -> PassResult<bool> {
        let mut changed = false;
        let mut assigned: HashMap<String, CallingConv> = HashMap::new();

        for function in module.functions() {
            if function.is_declaration() {
                continue;
            }
            if let Some(set) = selected_functions {
                if !set.contains(&function.name()) {
                    continue;
                }
            }
            let cc = *CallingConv::RANDOM_POOL
                .choose(ctx.rng.inner_mut())
                .expect("RANDOM_POOL is non-empty");
            function.set_calling_conv(cc);
            assigned.insert(function.name(), cc);
            changed = true;
        }

        if assigned.is_empty() {
            return Ok(changed);
        }

        for function in module.functions() {
            for block in function.blocks() {
                block.with_instructions(|insts| {
                    for inst in insts.iter_mut() {
                        if let InstKind::Call {
                            callee: CallTarget::Direct(name),
                            cc,
                        } = &mut inst.kind
                        {
                            if let Some(new_cc) = assigned.get(name) {
                                *cc = *new_cc;
                            }
                        }
                    }
                });
            }
        }

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir_core::{verification::verify_module, BasicBlock, CallingConv as CC, Function, Instruction, Opcode, Type};

    #[test]
    fn randomizes_callee_and_patches_call_sites() {
        let mut m = Module::new("x86_64-unknown-linux-gnu");

        let callee = Function::new("callee", Type::Void, vec![]);
        let cbb = BasicBlock::new("entry");
        cbb.push_instruction(Instruction::new(Opcode::Ret, Type::Void, None, vec![]));
        callee.append_block(cbb);
        m.add_function(callee);

        let caller = Function::new("caller", Type::Void, vec![]);
        let bb = BasicBlock::new("entry");
        bb.push_instruction(
            Instruction::new(Opcode::Call, Type::Void, None, vec![]).with_kind(InstKind::Call {
                callee: CallTarget::Direct("callee".into()),
                cc: CC::C,
            }),
        );
        bb.push_instruction(Instruction::new(Opcode::Ret, Type::Void, None, vec![]));
        caller.append_block(bb.clone());
        m.add_function(caller);

        let mut pass = CallingConventionPass;
        let mut ctx = PassContext::new(9);
        let changed = pass.run_on_module(&mut m, &mut ctx, None).unwrap();
        assert!(changed);
        verify_module(&m).unwrap();

        let callee_cc = m.function_by_name("callee").unwrap().calling_conv();
        let call = bb
            .instructions()
            .into_iter()
            .find(|i| i.opcode == Opcode::Call)
            .unwrap();
        let InstKind::Call { cc, .. } = call.kind else {
            panic!("expected a call");
        };
        assert_eq!(cc, callee_cc);
    }
}
