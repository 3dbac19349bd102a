//! Process-wide, initialize-once holder of the [`Interceptor`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use tracing::info;

use crate::interceptor::Interceptor;

/// Two states only: uninitialized, then initialized for the rest of the
/// process. Concurrent first calls race on the `OnceLock`, so exactly one
/// of them builds the interceptor and resolves bindings.
pub struct Bootstrap {
    cell: OnceLock<Interceptor>,
    passes: AtomicUsize,
}

impl Bootstrap {
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
            passes: AtomicUsize::new(0),
        }
    }

    /// Build the interceptor with `build` and run the eager resolution pass,
    /// unless that already happened. Always returns the single instance.
    pub fn initialize<F>(&self, build: F) -> &Interceptor
    where
        F: FnOnce() -> Interceptor,
    {
        self.cell.get_or_init(|| {
            let interceptor = build();
            let report = interceptor.resolve_bindings();
            self.passes.fetch_add(1, Ordering::Relaxed);
            info!(
                "vramcap initialized: reserved_fraction={}, enforcement={}, missing bindings={}",
                interceptor.policy().reserved_fraction(),
                interceptor.policy().enforcement(),
                report.missing.len()
            );
            interceptor
        })
    }

    pub fn get(&self) -> Option<&Interceptor> {
        self.cell.get()
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Number of resolution passes run so far. Never exceeds one.
    pub fn resolution_passes(&self) -> usize {
        self.passes.load(Ordering::Relaxed)
    }
}

impl Default for Bootstrap {
    fn default() -> Self {
        Self::new()
    }
}
