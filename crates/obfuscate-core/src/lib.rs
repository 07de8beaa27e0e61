//! A pass pipeline that rewrites LLVM-style IR into a behavior-preserving
//! obfuscated equivalent: arithmetic substitution, control-flow flattening
//! and bogus control flow, alias-indirected memory access, indirect branch
//! and call dispatch, global/string encryption, linear MBA rewriting,
//! function merging, calling-convention randomization, anti-disassembly
//! byte injection, and whole-function virtualization against a small
//! embedded bytecode VM.

pub mod config;
pub mod mba;
pub mod pass;
pub mod passes;
pub mod pipeline;
pub mod registry;
pub mod rewrite;
pub mod rng;
pub mod vm;

pub use config::{ObfuscationConfig, PassSpec};
pub use pass::{FunctionPass, ModulePass, Pass, PassContext, PassError, PassResult};
pub use pipeline::{run_pipeline, PipelineError, PipelineReport};
pub use registry::{available_passes, pass_by_name, PassRegistryEntry};
pub use rng::DeterministicRng;
