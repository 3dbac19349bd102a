//! Entry-point bindings: the cached addresses of the genuine driver functions.
//!
//! Every slot starts null and is written at most once, either by the eager
//! bootstrap pass or lazily when a later lookup discovers the address.

use std::ffi::{c_void, CStr, CString};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use tracing::{debug, info};

/// Library an entry point belongs to. Decides which fail-fast code a
/// replacement returns when its binding is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Library {
    Cuda,
    Nvml,
}

/// Every driver function this layer binds.
///
/// Intercepted entries have a replacement exported under the same symbol;
/// auxiliary entries are only called for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryPoint {
    CuDeviceTotalMem,
    CuCtxCreate,
    CuMemAlloc,
    CuMemFree,
    CuMemcpyHtoD,
    CuMemcpyDtoH,
    CuLaunchKernel,
    CuMemGetInfo,
    CuGetProcAddress,
    CuGetProcAddressV2,
    NvmlDeviceGetMemoryInfo,
    NvmlDeviceGetMemoryInfoV2,
    CuCtxGetCurrent,
    CuCtxGetDevice,
    CuDeviceGetName,
}

impl EntryPoint {
    pub const COUNT: usize = 15;

    pub const ALL: [EntryPoint; Self::COUNT] = [
        EntryPoint::CuDeviceTotalMem,
        EntryPoint::CuCtxCreate,
        EntryPoint::CuMemAlloc,
        EntryPoint::CuMemFree,
        EntryPoint::CuMemcpyHtoD,
        EntryPoint::CuMemcpyDtoH,
        EntryPoint::CuLaunchKernel,
        EntryPoint::CuMemGetInfo,
        EntryPoint::CuGetProcAddress,
        EntryPoint::CuGetProcAddressV2,
        EntryPoint::NvmlDeviceGetMemoryInfo,
        EntryPoint::NvmlDeviceGetMemoryInfoV2,
        EntryPoint::CuCtxGetCurrent,
        EntryPoint::CuCtxGetDevice,
        EntryPoint::CuDeviceGetName,
    ];

    /// Exported symbol name, identical for the genuine function and the
    /// replacement.
    pub const fn symbol(self) -> &'static CStr {
        match self {
            EntryPoint::CuDeviceTotalMem => c"cuDeviceTotalMem_v2",
            EntryPoint::CuCtxCreate => c"cuCtxCreate_v2",
            EntryPoint::CuMemAlloc => c"cuMemAlloc_v2",
            EntryPoint::CuMemFree => c"cuMemFree_v2",
            EntryPoint::CuMemcpyHtoD => c"cuMemcpyHtoD_v2",
            EntryPoint::CuMemcpyDtoH => c"cuMemcpyDtoH_v2",
            EntryPoint::CuLaunchKernel => c"cuLaunchKernel",
            EntryPoint::CuMemGetInfo => c"cuMemGetInfo_v2",
            EntryPoint::CuGetProcAddress => c"cuGetProcAddress",
            EntryPoint::CuGetProcAddressV2 => c"cuGetProcAddress_v2",
            EntryPoint::NvmlDeviceGetMemoryInfo => c"nvmlDeviceGetMemoryInfo",
            EntryPoint::NvmlDeviceGetMemoryInfoV2 => c"nvmlDeviceGetMemoryInfo_v2",
            EntryPoint::CuCtxGetCurrent => c"cuCtxGetCurrent",
            EntryPoint::CuCtxGetDevice => c"cuCtxGetDevice",
            EntryPoint::CuDeviceGetName => c"cuDeviceGetName",
        }
    }

    /// Unversioned name a CUDA runtime passes to `cuGetProcAddress`.
    ///
    /// Both lookup entry points answer to `cuGetProcAddress`; the driver picks
    /// the ABI version from the requested CUDA version.
    pub const fn proc_name(self) -> Option<&'static CStr> {
        match self {
            EntryPoint::CuGetProcAddress | EntryPoint::CuGetProcAddressV2 => {
                Some(c"cuGetProcAddress")
            }
            EntryPoint::CuDeviceTotalMem => Some(c"cuDeviceTotalMem"),
            EntryPoint::CuCtxCreate => Some(c"cuCtxCreate"),
            EntryPoint::CuMemAlloc => Some(c"cuMemAlloc"),
            EntryPoint::CuMemFree => Some(c"cuMemFree"),
            EntryPoint::CuMemcpyHtoD => Some(c"cuMemcpyHtoD"),
            EntryPoint::CuMemcpyDtoH => Some(c"cuMemcpyDtoH"),
            EntryPoint::CuLaunchKernel => Some(c"cuLaunchKernel"),
            EntryPoint::CuMemGetInfo => Some(c"cuMemGetInfo"),
            _ => None,
        }
    }

    pub const fn library(self) -> Library {
        match self {
            EntryPoint::NvmlDeviceGetMemoryInfo | EntryPoint::NvmlDeviceGetMemoryInfoV2 => {
                Library::Nvml
            }
            _ => Library::Cuda,
        }
    }

    pub const fn is_intercepted(self) -> bool {
        !matches!(
            self,
            EntryPoint::CuCtxGetCurrent | EntryPoint::CuCtxGetDevice | EntryPoint::CuDeviceGetName
        )
    }

    pub fn name(self) -> &'static str {
        // Symbol names are ASCII literals.
        self.symbol().to_str().unwrap_or("<non-utf8>")
    }

    pub fn from_symbol(symbol: &CStr) -> Option<Self> {
        Self::ALL.into_iter().find(|entry| entry.symbol() == symbol)
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// Finds genuine implementations by name.
///
/// The preloaded library searches strictly after itself in the loader's
/// module order; tests hand in a table of fakes.
pub trait SymbolResolver: Send + Sync {
    /// Address of `symbol`, or null when it cannot be found.
    fn lookup(&self, symbol: &CStr) -> *mut c_void;

    /// Name of the exported symbol located exactly at `addr`, if known.
    fn symbol_at(&self, _addr: *mut c_void) -> Option<CString> {
        None
    }

    /// Loader diagnostic for the most recent failed lookup.
    fn last_error(&self) -> Option<String> {
        None
    }
}

/// One `{name, genuine address}` pair.
pub struct LazyBinding {
    entry: EntryPoint,
    addr: AtomicPtr<c_void>,
}

impl LazyBinding {
    pub fn new(entry: EntryPoint) -> Self {
        Self {
            entry,
            addr: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn entry(&self) -> EntryPoint {
        self.entry
    }

    pub fn get(&self) -> Option<NonNull<c_void>> {
        NonNull::new(self.addr.load(Ordering::Acquire))
    }

    pub fn is_resolved(&self) -> bool {
        self.get().is_some()
    }

    /// Store `addr` if the slot is still empty. Returns true when the slot now
    /// holds `addr`, whether this call or an earlier one wrote it.
    pub fn complete(&self, addr: *mut c_void) -> bool {
        if addr.is_null() {
            return false;
        }
        match self
            .addr
            .compare_exchange(ptr::null_mut(), addr, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == addr,
        }
    }

    /// The bound address as a function pointer of type `F`.
    ///
    /// # Safety
    /// `F` must be the `extern "C"` signature of this entry point.
    pub unsafe fn function<F: Copy>(&self) -> Option<F> {
        debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<*mut c_void>());
        self.get()
            .map(|addr| unsafe { std::mem::transmute_copy::<*mut c_void, F>(&addr.as_ptr()) })
    }
}

/// Outcome of one eager resolution pass.
#[derive(Debug, Default)]
pub struct ResolveReport {
    pub resolved: usize,
    pub missing: Vec<EntryPoint>,
}

/// The full binding table, one slot per [`EntryPoint`].
pub struct DriverBindings {
    slots: [LazyBinding; EntryPoint::COUNT],
}

impl DriverBindings {
    pub fn new() -> Self {
        Self {
            slots: EntryPoint::ALL.map(LazyBinding::new),
        }
    }

    pub fn slot(&self, entry: EntryPoint) -> &LazyBinding {
        &self.slots[entry.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &LazyBinding> {
        self.slots.iter()
    }

    /// Resolve every empty slot through `resolver`. Missing symbols are left
    /// null; libraries loaded later complete them through the lookup hooks.
    pub fn resolve_all(&self, resolver: &dyn SymbolResolver) -> ResolveReport {
        let mut report = ResolveReport::default();
        for slot in self.slots.iter().filter(|slot| !slot.is_resolved()) {
            let addr = resolver.lookup(slot.entry.symbol());
            if slot.complete(addr) {
                report.resolved += 1;
            } else {
                debug!(
                    "failed to resolve {}: {}",
                    slot.entry.name(),
                    resolver
                        .last_error()
                        .unwrap_or_else(|| "symbol not found".to_string())
                );
                report.missing.push(slot.entry);
            }
        }
        info!(
            "bindings resolved: {}/{}",
            report.resolved,
            report.resolved + report.missing.len()
        );
        report
    }
}

impl Default for DriverBindings {
    fn default() -> Self {
        Self::new()
    }
}
