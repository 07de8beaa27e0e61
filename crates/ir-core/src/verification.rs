//! Verifier
//!
//! Checks the structural invariants every pass in this workspace must
//! preserve: blocks terminated, PHIs form a contiguous prefix, every
//! branch target exists, every PHI's incoming set matches the block's
//! actual predecessors exactly, and every block is reachable from the
//! entry. Run after each pass in the pipeline (§4.1) rather than only at
//! the end, so a defect is attributed to the pass that introduced it.

use rustc_hash::FxHashSet;

use crate::cfg::Cfg;
use crate::error::VerifyError;
use crate::function::Function;
use crate::instruction::InstKind;
use crate::module::Module;

pub fn verify_module(module: &Module) -> Result<(), VerifyError> {
    for f in module.functions() {
        verify_function(f)?;
    }
    Ok(())
}

pub fn verify_function(function: &Function) -> Result<(), VerifyError> {
    if function.is_declaration() {
        return Ok(());
    }
    let fname = function.name();
    let blocks = function.blocks();

    for block in &blocks {
        if !block.is_terminated() {
            return Err(VerifyError::UnterminatedBlock {
                function: fname.clone(),
                block: block.name(),
            });
        }
        let insts = block.instructions();
        let mut seen_non_phi = false;
        for inst in &insts {
            if inst.is_phi() {
                if seen_non_phi {
                    return Err(VerifyError::PhiNotAPrefix {
                        function: fname.clone(),
                        block: block.name(),
                    });
                }
            } else {
                seen_non_phi = true;
            }
        }
    }

    let cfg = Cfg::build(function);
    let known: FxHashSet<String> = blocks.iter().map(|b| b.name()).collect();

    for block in &blocks {
        for target in block.successors() {
            if !known.contains(&target) {
                return Err(VerifyError::UnknownBranchTarget {
                    function: fname.clone(),
                    block: block.name(),
                    target,
                });
            }
        }

        for phi in block.phis() {
            if let InstKind::Phi { incoming } = &phi.kind {
                let preds: FxHashSet<&String> = cfg.predecessors(&block.name()).iter().collect();
                let listed: FxHashSet<&String> = incoming.iter().map(|(p, _)| p).collect();
                for p in &preds {
                    if !listed.contains(*p) {
                        return Err(VerifyError::PhiMissingIncoming {
                            function: fname.clone(),
                            block: block.name(),
                            predecessor: (*p).clone(),
                        });
                    }
                }
                for l in &listed {
                    if !preds.contains(*l) {
                        return Err(VerifyError::PhiSpuriousIncoming {
                            function: fname.clone(),
                            block: block.name(),
                            from: (*l).clone(),
                        });
                    }
                }
            }
        }
    }

    let reachable = cfg.reachable_from_entry();
    for block in &blocks {
        if !reachable.contains(&block.name()) {
            return Err(VerifyError::UnreachableBlock {
                function: fname.clone(),
                block: block.name(),
            });
        }
    }

    Ok(())
}
