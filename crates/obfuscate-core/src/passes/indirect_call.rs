//! Indirect Call (§4.4)
//!
//! Replaces every direct `call @callee(...)` with a call through a
//! function pointer spilled to a one-element local table and reloaded
//! immediately before the call. `CallTarget::Indirect`'s convention in
//! this crate is that operand 0 is the resolved callee pointer and the
//! remaining operands are the original arguments.

use std::collections::HashSet;

use ir_core::{CallTarget, Function, InstKind, Instruction, Opcode, Type, Value};

use crate::pass::{FunctionPass, Pass, PassContext, PassInfo, PassResult};
use crate::rewrite::find_unprocessed;

pub struct IndirectCallPass;

impl Pass for IndirectCallPass {
    fn info(&self) -> PassInfo {
        PassInfo {
            name: "indirect_call",
            description: "[Polaris] resolves direct call targets through a function-pointer table instead of a symbol reference",
            is_module_pass: false,
        }
    }
}

impl FunctionPass for IndirectCallPass {
    fn run_on_function(&mut self, function: &Function, _ctx: &mut PassContext) -> PassResult<bool> {
        let mut changed = false;

        loop {
            let found = find_unprocessed(function, &HashSet::new(), |i| {
                matches!(&i.kind, InstKind::Call { callee: CallTarget::Direct(_), .. })
            });
            let Some((block, index, inst)) = found else {
                break;
            };
            let (callee_name, cc) = match &inst.kind {
                InstKind::Call {
                    callee: CallTarget::Direct(n),
                    cc,
                } => (n.clone(), *cc),
                _ => unreachable!(),
            };

            let ptr_ty = Type::ptr(Type::i8());
            let table_ty = Type::array(ptr_ty.clone(), 1);
            let table_name = function.fresh_value_name("icall_table");
            let gep_name = function.fresh_value_name("icall_slot");
            let load_name = function.fresh_value_name("icall_fn");

            let alloca_inst = Instruction::new(
                Opcode::Alloca,
                Type::ptr(table_ty.clone()),
                Some(table_name.clone()),
                vec![],
            )
            .with_kind(InstKind::Alloca {
                allocated_ty: table_ty.clone(),
            });
            let table_ptr = Value::Inst(Type::ptr(table_ty.clone()), table_name);

            let gep_inst = Instruction::new(
                Opcode::GetElementPtr,
                Type::ptr(ptr_ty.clone()),
                Some(gep_name.clone()),
                vec![table_ptr],
            )
            .with_kind(InstKind::Gep {
                base_ty: table_ty,
                indices: vec![0, 0],
            });
            let slot_ptr = Value::Inst(Type::ptr(ptr_ty.clone()), gep_name);

            let fn_ref = Value::FunctionRef(ptr_ty.clone(), callee_name);
            let store_inst = Instruction::new(
                Opcode::Store,
                Type::Void,
                None,
                vec![fn_ref, slot_ptr.clone()],
            );

            let load_inst = Instruction::new(
                Opcode::Load,
                ptr_ty.clone(),
                Some(load_name.clone()),
                vec![slot_ptr],
            );
            let loaded_ptr = Value::Inst(ptr_ty, load_name);

            let mut new_operands = vec![loaded_ptr];
            new_operands.extend(inst.operands.clone());
            let new_call =
                Instruction::new(inst.opcode, inst.ty.clone(), inst.name.clone(), new_operands)
                    .with_kind(InstKind::Call {
                        callee: CallTarget::Indirect,
                        cc,
                    });

            block.with_instructions(|insts| {
                insts.splice(index..=index, [alloca_inst, gep_inst, store_inst, load_inst, new_call]);
            });
            changed = true;
        }

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir_core::{verification::verify_function, BasicBlock, CallingConv};

    #[test]
    fn direct_call_becomes_indirect() {
        let f = Function::new("caller", Type::Void, vec![]);
        let bb = BasicBlock::new("entry");
        bb.push_instruction(
            Instruction::new(Opcode::Call, Type::Void, None, vec![])
                .with_kind(InstKind::Call {
                    callee: CallTarget::Direct("callee".into()),
                    cc: CallingConv::C,
                }),
        );
        bb.push_instruction(Instruction::new(Opcode::Ret, Type::Void, None, vec![]));
        f.append_block(bb.clone());

        let mut pass = IndirectCallPass;
        let mut ctx = PassContext::new(6);
        let changed = pass.run_on_function(&f, &mut ctx).unwrap();
        assert!(changed);
        verify_function(&f).unwrap();
        let insts = bb.instructions();
        let call = insts.iter().find(|i| i.opcode == Opcode::Call).unwrap();
        assert!(matches!(&call.kind, InstKind::Call { callee: CallTarget::Indirect, .. }));
        assert_eq!(call.operands.len(), 1);
    }
}
