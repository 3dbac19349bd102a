//! Name-keyed redirect table consulted by the `dlsym` and `cuGetProcAddress`
//! replacements before they hand an address back to the caller.

use std::collections::HashMap;
use std::ffi::{c_void, CStr};

use crate::binding::EntryPoint;

/// An intercepted entry point together with the address of its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redirect {
    pub entry: EntryPoint,
    replacement: *mut c_void,
}

// SAFETY: the replacement is the address of a function in this library's
// text segment, valid for the life of the process from any thread.
unsafe impl Send for Redirect {}
unsafe impl Sync for Redirect {}

impl Redirect {
    pub fn replacement(&self) -> *mut c_void {
        self.replacement
    }
}

#[derive(Debug, Default)]
pub struct RedirectTable {
    by_symbol: HashMap<&'static CStr, Redirect>,
    by_proc_name: HashMap<&'static CStr, Vec<Redirect>>,
}

impl RedirectTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route lookups of `entry` to `replacement`. The entry is reachable by its
    /// exported symbol and, for CUDA calls, by its `cuGetProcAddress` name.
    pub fn insert(&mut self, entry: EntryPoint, replacement: *mut c_void) -> &mut Self {
        let redirect = Redirect { entry, replacement };
        self.by_symbol.insert(entry.symbol(), redirect);
        if let Some(proc_name) = entry.proc_name() {
            self.by_proc_name.entry(proc_name).or_default().push(redirect);
        }
        self
    }

    pub fn by_symbol(&self, symbol: &CStr) -> Option<Redirect> {
        self.by_symbol.get(symbol).copied()
    }

    /// Every entry reachable under `proc_name`, one per ABI version.
    pub fn by_proc_name(&self, proc_name: &CStr) -> &[Redirect] {
        self.by_proc_name
            .get(proc_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether `addr` is one of the replacements in this table.
    pub fn is_replacement(&self, addr: *mut c_void) -> bool {
        self.by_symbol.values().any(|r| r.replacement == addr)
    }

    pub fn len(&self) -> usize {
        self.by_symbol.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_symbol.is_empty()
    }
}
