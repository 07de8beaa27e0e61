//! Pass Infrastructure
//!
//! Mirrors the teacher's `ModulePass`/`FunctionPass` split, generalized
//! for obfuscation rather than verification: every pass gets a
//! `PassContext` carrying the shared deterministic RNG and a module-wide
//! `ir_core::Context` for synthesizing globally-unique names.

use std::collections::HashSet;

use ir_core::{Context, Function, Module};
use thiserror::Error;

use crate::rng::DeterministicRng;

#[derive(Debug, Error)]
pub enum PassError {
    #[error("pass {0} failed: {1}")]
    Failed(String, String),
    #[error("pass {0} produced invalid IR: {1}")]
    InvalidIr(String, String),
}

pub type PassResult<T> = Result<T, PassError>;

/// Shared state every pass draws from. Holding the RNG behind `&mut`
/// rather than giving each pass its own seed is what makes a pipeline
/// run reproducible as a whole: pass order determines draw order.
///
/// `obfuscated` accumulates the names of every function a function-pass
/// traversal successfully transformed, per §4.1 step 1's "obfuscated-set".
/// The pipeline stamps `no-inline`/`opt-none` on everything in it once
/// every pass has run.
pub struct PassContext {
    pub rng: DeterministicRng,
    pub names: Context,
    pub obfuscated: HashSet<String>,
}

impl PassContext {
    pub fn new(seed: u64) -> Self {
        PassContext {
            rng: DeterministicRng::from_seed(seed),
            names: Context::new(),
            obfuscated: HashSet::new(),
        }
    }
}

/// Static metadata a registered pass exposes to the driver/UI (spec §6's
/// "pass metadata surface"). Descriptions are tagged by provenance, the
/// way the source material's own pass catalog does.
#[derive(Debug, Clone, Copy)]
pub struct PassInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub is_module_pass: bool,
}

pub trait Pass {
    fn info(&self) -> PassInfo;

    fn name(&self) -> &'static str {
        self.info().name
    }
}

/// A pass that rewrites one function at a time. Most of the ten
/// transformations are function passes: they don't need cross-function
/// visibility except through the `Module` handed to `FunctionMerge` and
/// `Virtualize`, which are module passes instead.
pub trait FunctionPass: Pass {
    fn run_on_function(&mut self, function: &Function, ctx: &mut PassContext) -> PassResult<bool>;
}

pub trait ModulePass: Pass {
    /// `selected_functions`, when `Some`, restricts a function-shaped
    /// rewrite to the named functions; module passes whose effect is
    /// inherently global (indirect-call's shared table, global/string
    /// encryption) are free to ignore it, per §4.1 step 1.
    fn run_on_module(
        &mut self,
        module: &mut Module,
        ctx: &mut PassContext,
        selected_functions: Option<&HashSet<String>>,
    ) -> PassResult<bool>;
}

/// Adapts any `FunctionPass` into a `ModulePass` that applies it to every
/// defined function in declaration order, the same traversal the teacher's
/// `PassManager::run` used. `honor_selection` controls whether the
/// adapter restricts that traversal to `selected_functions`; passes whose
/// rewrite is global in character (indirect-call) are built with
/// [`ForEachFunction::ignoring_selection`] instead of [`ForEachFunction::new`].
pub struct ForEachFunction<P> {
    inner: P,
    honor_selection: bool,
}

impl<P: FunctionPass> ForEachFunction<P> {
    pub fn new(inner: P) -> Self {
        ForEachFunction {
            inner,
            honor_selection: true,
        }
    }

    pub fn ignoring_selection(inner: P) -> Self {
        ForEachFunction {
            inner,
            honor_selection: false,
        }
    }
}

impl<P: FunctionPass> Pass for ForEachFunction<P> {
    fn info(&self) -> PassInfo {
        self.inner.info()
    }
}

impl<P: FunctionPass> ModulePass for ForEachFunction<P> {
    fn run_on_module(
        &mut self,
        module: &mut Module,
        ctx: &mut PassContext,
        selected_functions: Option<&HashSet<String>>,
    ) -> PassResult<bool> {
        let mut changed = false;
        for f in module.functions() {
            if f.is_declaration() {
                continue;
            }
            if self.honor_selection {
                if let Some(set) = selected_functions {
                    if !set.contains(&f.name()) {
                        continue;
                    }
                }
            }
            if self.inner.run_on_function(f, ctx)? {
                changed = true;
                ctx.obfuscated.insert(f.name());
            }
        }
        Ok(changed)
    }
}
