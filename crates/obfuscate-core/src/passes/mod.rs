//! The obfuscation passes, one module each, plus whole-function
//! virtualization against the embedded bytecode VM.

pub mod alias_access;
pub mod anti_disassembly;
pub mod bogus_control_flow;
pub mod calling_convention;
pub mod flattening;
pub mod function_merge;
pub mod global_encryption;
pub mod indirect_branch;
pub mod indirect_call;
pub mod mba_obfuscation;
pub mod substitution;
pub mod virtualization;

pub use alias_access::AliasAccessPass;
pub use anti_disassembly::AntiDisassemblyPass;
pub use bogus_control_flow::BogusControlFlowPass;
pub use calling_convention::CallingConventionPass;
pub use flattening::FlatteningPass;
pub use function_merge::FunctionMergePass;
pub use global_encryption::GlobalEncryptionPass;
pub use indirect_branch::IndirectBranchPass;
pub use indirect_call::IndirectCallPass;
pub use mba_obfuscation::MbaObfuscationPass;
pub use substitution::ArithmeticSubstitutionPass;
pub use virtualization::VirtualizePass;
