//! Context
//!
//! The teacher's `Context` owned interned types and a string table. This
//! workspace's `Type` is already plain-old-data (no interning needed for
//! the sizes of module this crate processes), so `Context` is reduced to
//! what passes actually need: a monotonically increasing counter for
//! disambiguating names across an entire module, not just one function,
//! used by passes that synthesize helper functions (virtualization's
//! `__vm_interpret`, function merging's dispatcher).

use std::sync::atomic::{AtomicUsize, Ordering};

pub struct Context {
    counter: AtomicUsize,
}

impl Context {
    pub fn new() -> Self {
        Context {
            counter: AtomicUsize::new(0),
        }
    }

    /// A name unique for the lifetime of this `Context`, e.g.
    /// `__vm_interpret.3` when a module already defines `__vm_interpret`.
    pub fn fresh_global_name(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}.{}", prefix, n)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_names_increase_monotonically() {
        let ctx = Context::new();
        let a = ctx.fresh_global_name("helper");
        let b = ctx.fresh_global_name("helper");
        assert_ne!(a, b);
    }
}
