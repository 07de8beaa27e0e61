//! Pipeline Runner
//!
//! Turns an `ObfuscationConfig` into instantiated passes and runs them
//! against a module in declared order, verifying after every pass so a
//! broken rewrite is caught at the pass that introduced it rather than
//! surfacing later as a mysterious interpreter crash.

use ir_core::{verification::verify_module, Module, VerifyError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ObfuscationConfig, PassSpec};
use crate::pass::{ForEachFunction, ModulePass, PassContext, PassError};
use crate::passes::{
    AliasAccessPass, AntiDisassemblyPass, ArithmeticSubstitutionPass, BogusControlFlowPass,
    CallingConventionPass, FlatteningPass, FunctionMergePass, GlobalEncryptionPass,
    IndirectBranchPass, IndirectCallPass, MbaObfuscationPass, VirtualizePass,
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Pass(#[from] PassError),
    #[error("module failed verification after pass {pass}: {source}")]
    Verify {
        pass: &'static str,
        #[source]
        source: VerifyError,
    },
}

/// One line per pass applied, recording whether it changed anything.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub applied: Vec<(&'static str, bool)>,
}

fn build_pass(spec: &PassSpec) -> Box<dyn ModulePass> {
    match spec.clone() {
        PassSpec::Flattening { encrypted_dispatch } => Box::new(ForEachFunction::new(FlatteningPass { encrypted_dispatch })),
        PassSpec::BogusControlFlow { probability } => Box::new(ForEachFunction::new(BogusControlFlowPass { probability })),
        // Alias-access's six getters are shared module-wide infrastructure,
        // added once on first use rather than per selected function.
        PassSpec::AliasAccess => Box::new(AliasAccessPass),
        PassSpec::IndirectBranch => Box::new(IndirectBranchPass),
        // Indirect-call builds one shared resolved-callee scheme across the
        // whole module; restricting it to a function subset would leave
        // some call sites pointing at a table the rest of the module
        // doesn't share, so it always runs everywhere.
        PassSpec::IndirectCall => Box::new(ForEachFunction::ignoring_selection(IndirectCallPass)),
        PassSpec::GlobalEncryption { encrypt_strings } => Box::new(GlobalEncryptionPass { encrypt_strings }),
        PassSpec::ArithmeticSubstitution { iterations } => Box::new(ForEachFunction::new(ArithmeticSubstitutionPass { iterations })),
        PassSpec::MbaObfuscation { max_terms } => Box::new(ForEachFunction::new(MbaObfuscationPass { max_terms })),
        PassSpec::FunctionMerge { min_group_size } => Box::new(FunctionMergePass { min_group_size }),
        PassSpec::CallingConvention => Box::new(CallingConventionPass),
        PassSpec::AntiDisassembly { density } => Box::new(AntiDisassemblyPass { density }),
        PassSpec::Virtualize { functions } => Box::new(VirtualizePass { functions }),
    }
}

/// Runs every pass named in `config` against `module` in order, seeding a
/// single `PassContext` so the whole run is reproducible from the seed
/// alone. Verifies the module after each pass; a pass that corrupts the
/// IR fails the run at that pass rather than a later one. Once every pass
/// has run, stamps `no-inline`/`opt-none` on each function any function
/// pass actually transformed, per the pass framework's closing step:
/// an obfuscated function whose semantics an optimizer (or this pipeline,
/// run a second time over already-obfuscated IR) might "clean up" back
/// into something recognizable is exactly the failure mode that step
/// guards against. Returns `anyhow::Result` so a driver binary sees the
/// full error chain rather than just the failing pass's own enum.
pub fn run_pipeline(module: &mut Module, config: &ObfuscationConfig) -> anyhow::Result<PipelineReport> {
    let mut ctx = PassContext::new(config.seed);
    let mut report = PipelineReport { applied: Vec::new() };
    let selected = config.selected_functions.as_ref();

    info!(seed = config.seed, passes = config.passes.len(), "starting obfuscation pipeline");

    for spec in &config.passes {
        let mut pass = build_pass(spec);
        let name = pass.name();
        debug!(pass = name, "running pass");
        let changed = pass
            .run_on_module(module, &mut ctx, selected)
            .map_err(PipelineError::from)?;
        verify_module(module).map_err(|source| PipelineError::Verify { pass: name, source })?;
        if !changed {
            warn!(pass = name, "pass reported no change");
        }
        report.applied.push((name, changed));
    }

    for name in &ctx.obfuscated {
        if let Some(f) = module.function_by_name(name) {
            f.add_attribute("no-inline");
            f.add_attribute("opt-none");
        }
    }
    debug!(stamped = ctx.obfuscated.len(), "stamped obfuscated functions no-inline/opt-none");

    info!("obfuscation pipeline finished");
    Ok(report)
}
