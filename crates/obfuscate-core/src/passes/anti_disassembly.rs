//! Anti-Disassembly Byte Injection (§4.11)
//!
//! Inserts a crafted 15-byte x86 sequence that a linear-sweep
//! disassembler decodes as a 10-byte `mov rax, imm64` followed by a
//! short jump, when the bytes are really a 2-byte jump over 8 bytes of
//! junk preceded by 5 bytes that only look like a `mov` prefix. The real
//! control flow never executes any of it; `jmp rel8 +8` lands past the
//! junk either way. x86-only: the encoding only desyncs x86's
//! variable-length instruction decoder, so this pass is a no-op off an
//! x86 target triple.

use std::collections::HashSet;

use ir_core::{InstKind, Instruction, Module, Opcode, Type};
use rand::Rng;

use crate::pass::{ModulePass, Pass, PassContext, PassInfo, PassResult};

pub struct AntiDisassemblyPass {
    /// Probability of an additional injection before each non-terminator
    /// instruction past the block's first real one. The first real
    /// instruction of every block always gets one regardless of this.
    pub density: f64,
}

impl Default for AntiDisassemblyPass {
    fn default() -> Self {
        AntiDisassemblyPass { density: 0.3 }
    }
}

impl Pass for AntiDisassemblyPass {
    fn info(&self) -> PassInfo {
        PassInfo {
            name: "anti_disassembly",
            description: "[Polaris] injects malformed-looking byte sequences that desync linear disassemblers without affecting execution",
            is_module_pass: true,
        }
    }
}

/// `48 B8` (the `mov rax, imm64` prefix+opcode) + 3 random bytes, then
/// `EB 08` (`jmp rel8 +8`) skipping the 8 junk bytes that follow. A
/// disassembler that decodes linearly from the `48 B8` reads a 10-byte
/// `mov` spanning into what is actually the jump and junk, losing sync
/// with the real instruction stream for the rest of the block.
fn anti_disasm_sequence(rng: &mut impl Rng) -> Vec<u8> {
    let mut out = vec![0x48_u8, 0xB8];
    for _ in 0..3 {
        out.push(rng.gen());
    }
    out.push(0xEB);
    out.push(0x08);
    for _ in 0..8 {
        out.push(rng.gen());
    }
    debug_assert_eq!(out.len(), 15);
    out
}

fn inline_asm(bytes: Vec<u8>) -> Instruction {
    let asm = format!(
        ".byte {}",
        bytes.iter().map(|b| format!("0x{:02x}", b)).collect::<Vec<_>>().join(", ")
    );
    Instruction::new(Opcode::InlineAsm, Type::Void, None, vec![]).with_kind(InstKind::InlineAsm { bytes, asm })
}

impl ModulePass for AntiDisassemblyPass {
    fn run_on_module(
        &mut self,
        module: &mut Module,
        ctx: &mut PassContext,
        selected_functions: Option<&HashSet<String>>,
    ) -> PassResult<bool> {
        if !module.is_x86_target() {
            return Ok(false);
        }
        let mut changed = false;

        for function in module.functions() {
            if function.is_declaration() {
                continue;
            }
            if let Some(set) = selected_functions {
                if !set.contains(&function.name()) {
                    continue;
                }
            }

            for block in function.blocks() {
                let insts = block.instructions();
                if insts.is_empty() {
                    continue;
                }
                let first_real = block.first_non_phi_index();
                if first_real >= insts.len() {
                    continue;
                }
                let last_index = insts.len() - 1;

                let mut rewritten = Vec::with_capacity(insts.len() + 4);
                for (i, inst) in insts.into_iter().enumerate() {
                    let is_terminator = i == last_index;
                    let inject = if i == first_real {
                        true
                    } else if i > first_real && !is_terminator {
                        ctx.rng.inner_mut().gen_bool(self.density)
                    } else {
                        false
                    };
                    if inject {
                        rewritten.push(inline_asm(anti_disasm_sequence(ctx.rng.inner_mut())));
                        changed = true;
                    }
                    rewritten.push(inst);
                }
                block.set_instructions(rewritten);
            }
        }

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir_core::{verification::verify_module, BasicBlock, Function, Opcode as Op, Value};

    fn count_asm(bb: &BasicBlock) -> usize {
        bb.instructions()
            .iter()
            .filter(|i| matches!(i.kind, InstKind::InlineAsm { .. }))
            .count()
    }

    #[test]
    fn injects_fifteen_byte_sequence_before_first_real_instruction() {
        let mut m = Module::new("x86_64-unknown-linux-gnu");
        let f = Function::new("f", Type::Void, vec![]);
        let bb = BasicBlock::new("entry");
        bb.push_instruction(Instruction::new(Op::Ret, Type::Void, None, vec![]));
        f.append_block(bb.clone());
        m.add_function(f);

        let mut pass = AntiDisassemblyPass { density: 0.0 };
        let mut ctx = PassContext::new(13);
        let changed = pass.run_on_module(&mut m, &mut ctx, None).unwrap();
        assert!(changed);
        verify_module(&m).unwrap();

        let insts = bb.instructions();
        let InstKind::InlineAsm { bytes, .. } = &insts[0].kind else {
            panic!("expected inline asm first");
        };
        assert_eq!(bytes.len(), 15);
        assert_eq!(&bytes[0..2], &[0x48, 0xB8]);
        assert_eq!(&bytes[5..7], &[0xEB, 0x08]);
        assert_eq!(count_asm(&bb), 1);
    }

    #[test]
    fn density_one_injects_before_every_non_terminator() {
        let mut m = Module::new("x86_64-unknown-linux-gnu");
        let f = Function::new("f", Type::i32(), vec![Type::i32()]);
        let bb = BasicBlock::new("entry");
        bb.push_instruction(Instruction::new(
            Op::Add,
            Type::i32(),
            Some("a".into()),
            vec![Value::Param(Type::i32(), 0), Value::ConstInt(Type::i32(), 1)],
        ));
        bb.push_instruction(Instruction::new(
            Op::Add,
            Type::i32(),
            Some("b".into()),
            vec![Value::Inst(Type::i32(), "a".into()), Value::ConstInt(Type::i32(), 1)],
        ));
        bb.push_instruction(Instruction::new(Op::Ret, Type::Void, None, vec![Value::Inst(Type::i32(), "b".into())]));
        f.append_block(bb.clone());
        m.add_function(f);

        let mut pass = AntiDisassemblyPass { density: 1.0 };
        let mut ctx = PassContext::new(5);
        pass.run_on_module(&mut m, &mut ctx, None).unwrap();
        verify_module(&m).unwrap();
        // first real instruction always gets one, plus the second
        // non-terminator at density 1.0; the terminator never does.
        assert_eq!(count_asm(&bb), 2);
    }

    #[test]
    fn skips_non_x86_targets() {
        let mut m = Module::new("aarch64-apple-darwin");
        let f = Function::new("f", Type::Void, vec![]);
        let bb = BasicBlock::new("entry");
        bb.push_instruction(Instruction::new(Op::Ret, Type::Void, None, vec![]));
        f.append_block(bb);
        m.add_function(f);

        let mut pass = AntiDisassemblyPass::default();
        let mut ctx = PassContext::new(13);
        assert!(!pass.run_on_module(&mut m, &mut ctx, None).unwrap());
    }

    #[test]
    fn respects_selected_functions() {
        let mut m = Module::new("x86_64-unknown-linux-gnu");
        let f1 = Function::new("keep", Type::Void, vec![]);
        let bb1 = BasicBlock::new("entry");
        bb1.push_instruction(Instruction::new(Op::Ret, Type::Void, None, vec![]));
        f1.append_block(bb1.clone());
        m.add_function(f1);

        let f2 = Function::new("skip", Type::Void, vec![]);
        let bb2 = BasicBlock::new("entry");
        bb2.push_instruction(Instruction::new(Op::Ret, Type::Void, None, vec![]));
        f2.append_block(bb2.clone());
        m.add_function(f2);

        let selected: HashSet<String> = ["keep".to_string()].into_iter().collect();
        let mut pass = AntiDisassemblyPass { density: 0.0 };
        let mut ctx = PassContext::new(13);
        pass.run_on_module(&mut m, &mut ctx, Some(&selected)).unwrap();

        assert_eq!(count_asm(&bb1), 1);
        assert_eq!(count_asm(&bb2), 0);
    }
}
