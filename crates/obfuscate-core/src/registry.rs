//! Pass Registry (§4.1, §5, §9)
//!
//! A process-wide, insertion-ordered record of every pass this crate
//! ships: name, description, and a constructor for a default-configured
//! instance. Spec language like "registers itself at load time" assumes
//! a runtime that executes static initializers before `main`; Rust has
//! no such hook without a `ctor`-style crate, so the registry instead
//! builds itself lazily, the first time anything asks for it, and then
//! never changes again for the life of the process. That matches the
//! letter of §5's shared-mutable-state accounting either way: "populated
//! at module load, never mutated after" becomes "populated on first use,
//! never mutated after."
//!
//! This is a discovery surface for drivers and tooling (`--list-passes`,
//! a config-file schema validator) — it is not how the pipeline itself
//! builds passes from a config; `pipeline::build_pass` does that from a
//! `PassSpec`, matching on the variant rather than a name string.

use std::sync::OnceLock;

use crate::pass::{Pass, PassInfo};
use crate::passes::{
    AliasAccessPass, AntiDisassemblyPass, ArithmeticSubstitutionPass, BogusControlFlowPass,
    CallingConventionPass, FlatteningPass, FunctionMergePass, GlobalEncryptionPass,
    IndirectBranchPass, IndirectCallPass, MbaObfuscationPass, VirtualizePass,
};

/// One registered pass: its metadata plus a way to build a fresh,
/// default-configured instance. The constructor only yields a `dyn
/// Pass`, which can report `info()` but can't be run — running a pass
/// requires knowing whether it's a `FunctionPass` or a `ModulePass`,
/// which `dyn Pass` alone doesn't carry. Driving an actual pipeline goes
/// through `PassSpec` and `pipeline::build_pass` instead.
pub struct PassRegistryEntry {
    info: PassInfo,
    construct: fn() -> Box<dyn Pass>,
}

impl PassRegistryEntry {
    pub fn info(&self) -> PassInfo {
        self.info
    }

    pub fn construct(&self) -> Box<dyn Pass> {
        (self.construct)()
    }
}

fn entry(construct: fn() -> Box<dyn Pass>) -> PassRegistryEntry {
    let info = construct().info();
    PassRegistryEntry { info, construct }
}

static REGISTRY: OnceLock<Vec<PassRegistryEntry>> = OnceLock::new();

/// Declaration order here is the registry's insertion order; it has no
/// bearing on what order a pipeline actually runs passes in (that's
/// `ObfuscationConfig::passes`).
fn build_registry() -> Vec<PassRegistryEntry> {
    vec![
        entry(|| Box::new(ArithmeticSubstitutionPass { iterations: 2 })),
        entry(|| Box::new(MbaObfuscationPass { max_terms: 4 })),
        entry(|| Box::new(BogusControlFlowPass { probability: 0.3 })),
        entry(|| Box::new(FlatteningPass { encrypted_dispatch: true })),
        entry(|| Box::new(AliasAccessPass)),
        entry(|| Box::new(IndirectBranchPass)),
        entry(|| Box::new(IndirectCallPass)),
        entry(|| Box::new(GlobalEncryptionPass { encrypt_strings: true })),
        entry(|| Box::new(FunctionMergePass { min_group_size: 2 })),
        entry(|| Box::new(CallingConventionPass)),
        entry(|| Box::new(AntiDisassemblyPass::default())),
        entry(|| Box::new(VirtualizePass { functions: Vec::new() })),
    ]
}

/// The registry singleton, built on first access.
pub fn registry() -> &'static [PassRegistryEntry] {
    REGISTRY.get_or_init(build_registry)
}

/// Metadata for every registered pass, in insertion order. What a
/// `--list-passes` driver flag would print.
pub fn available_passes() -> Vec<PassInfo> {
    registry().iter().map(|e| e.info()).collect()
}

pub fn pass_by_name(name: &str) -> Option<&'static PassRegistryEntry> {
    registry().iter().find(|e| e.info().name == name)
}
