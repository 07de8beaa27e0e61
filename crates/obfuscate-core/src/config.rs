//! Run configuration
//!
//! A serializable description of one obfuscation run: the seed and an
//! ordered list of passes to apply, each carrying its own knobs. This is
//! the in-process analogue of a run profile a caller would load from a
//! TOML/JSON file; `ObfuscationConfig` itself doesn't do any file I/O.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObfuscationConfig {
    pub seed: u64,
    pub passes: Vec<PassSpec>,
    /// `None` runs every function-shaped pass against every defined
    /// function in the module, same as an absent filter. `Some(set)`
    /// restricts function passes to the named functions; module passes
    /// with an inherently global effect may still ignore it. Defaults to
    /// `None` so an unobfuscated-empty set never reads as "obfuscate
    /// nothing".
    #[serde(default)]
    pub selected_functions: Option<HashSet<String>>,
}

impl ObfuscationConfig {
    pub fn new(seed: u64) -> Self {
        ObfuscationConfig {
            seed,
            passes: Vec::new(),
            selected_functions: None,
        }
    }

    pub fn with_pass(mut self, spec: PassSpec) -> Self {
        self.passes.push(spec);
        self
    }

    pub fn with_selected_functions(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.selected_functions = Some(names.into_iter().collect());
        self
    }
}

/// One entry in a pipeline, tagged by pass, with that pass's own knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "pass", rename_all = "snake_case")]
pub enum PassSpec {
    Flattening { encrypted_dispatch: bool },
    BogusControlFlow { probability: f64 },
    AliasAccess,
    IndirectBranch,
    IndirectCall,
    GlobalEncryption { encrypt_strings: bool },
    ArithmeticSubstitution { iterations: u32 },
    MbaObfuscation { max_terms: u32 },
    FunctionMerge { min_group_size: usize },
    CallingConvention,
    AntiDisassembly { density: f64 },
    Virtualize { functions: Vec<String> },
}

impl PassSpec {
    pub fn name(&self) -> &'static str {
        match self {
            PassSpec::Flattening { .. } => "flattening",
            PassSpec::BogusControlFlow { .. } => "bogus_control_flow",
            PassSpec::AliasAccess => "alias_access",
            PassSpec::IndirectBranch => "indirect_branch",
            PassSpec::IndirectCall => "indirect_call",
            PassSpec::GlobalEncryption { .. } => "global_encryption",
            PassSpec::ArithmeticSubstitution { .. } => "arithmetic_substitution",
            PassSpec::MbaObfuscation { .. } => "mba_obfuscation",
            PassSpec::FunctionMerge { .. } => "function_merge",
            PassSpec::CallingConvention => "calling_convention",
            PassSpec::AntiDisassembly { .. } => "anti_disassembly",
            PassSpec::Virtualize { .. } => "virtualize",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_names_match_spec() {
        let cfg = ObfuscationConfig::new(7)
            .with_pass(PassSpec::BogusControlFlow { probability: 0.3 })
            .with_pass(PassSpec::CallingConvention);
        let names: Vec<&str> = cfg.passes.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["bogus_control_flow", "calling_convention"]);
    }
}
