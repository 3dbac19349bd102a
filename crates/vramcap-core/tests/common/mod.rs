//! Fake driver shared by the integration tests.
//!
//! The fake entry points have the genuine signatures and keep their state in
//! a thread local, so every test thread sees its own device.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::ffi::{c_char, c_int, c_uint, c_void, CStr, CString};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use vramcap_core::ffi::*;
use vramcap_core::{EntryPoint, Interceptor, QuotaPolicy, RedirectTable, SymbolResolver};

pub const GIB: u64 = 1024 * 1024 * 1024;
pub const CUDA_ERROR_NOT_FOUND: CUresult = 500;
pub const FAKE_DEVICE_PTR: CUdeviceptr = 0x7f00_0000;
pub const FAKE_CONTEXT: usize = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchArgs {
    pub f: usize,
    pub grid: [c_uint; 3],
    pub block: [c_uint; 3],
    pub shared: c_uint,
    pub stream: usize,
    pub params: usize,
    pub extra: usize,
}

#[derive(Debug, Default)]
pub struct FakeDriver {
    pub total: u64,
    pub free: u64,
    /// Driver-reserved bytes reported by the NVML v2 query
    pub nvml_reserved: u64,
    /// Error every fake returns instead of succeeding
    pub fail_with: Option<c_int>,
    pub calls: Vec<&'static str>,
    pub last_alloc: Option<usize>,
    pub last_free: Option<CUdeviceptr>,
    /// `(device pointer, host pointer, byte count)`
    pub last_copy: Option<(CUdeviceptr, usize, usize)>,
    pub last_launch: Option<LaunchArgs>,
    pub last_nvml_device: Option<usize>,
    /// Make `cuDeviceGetName` fail
    pub name_fails: bool,
    /// Answers of the fake `cuGetProcAddress`
    pub proc_table: HashMap<CString, usize>,
}

thread_local! {
    static DRIVER: RefCell<FakeDriver> = RefCell::new(FakeDriver::default());
}

pub fn with_driver<R>(f: impl FnOnce(&mut FakeDriver) -> R) -> R {
    DRIVER.with(|driver| f(&mut driver.borrow_mut()))
}

/// Reset this thread's fake device to `total` bytes with `free` available.
pub fn reset_driver(total: u64, free: u64) {
    with_driver(|driver| {
        *driver = FakeDriver {
            total,
            free,
            ..FakeDriver::default()
        }
    });
}

pub fn calls() -> Vec<&'static str> {
    with_driver(|driver| driver.calls.clone())
}

fn enter(name: &'static str) -> Option<c_int> {
    with_driver(|driver| {
        driver.calls.push(name);
        driver.fail_with
    })
}

// ── Fake genuine entry points ───────────────────────────────────────

pub unsafe extern "C" fn fake_device_total_mem(bytes: *mut usize, _dev: CUdevice) -> CUresult {
    if let Some(code) = enter("cuDeviceTotalMem_v2") {
        return code;
    }
    unsafe { *bytes = with_driver(|d| d.total) as usize };
    CUDA_SUCCESS
}

pub unsafe extern "C" fn fake_mem_get_info(free: *mut usize, total: *mut usize) -> CUresult {
    if let Some(code) = enter("cuMemGetInfo_v2") {
        return code;
    }
    let (f, t) = with_driver(|d| (d.free, d.total));
    unsafe {
        *free = f as usize;
        *total = t as usize;
    }
    CUDA_SUCCESS
}

/// Same signature as `cuMemGetInfo_v2`, standing in for another ABI version.
pub unsafe extern "C" fn fake_mem_get_info_legacy(free: *mut usize, total: *mut usize) -> CUresult {
    enter("cuMemGetInfo");
    unsafe {
        *free = 1;
        *total = 2;
    }
    CUDA_SUCCESS
}

pub unsafe extern "C" fn fake_mem_alloc(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult {
    if let Some(code) = enter("cuMemAlloc_v2") {
        return code;
    }
    with_driver(|d| d.last_alloc = Some(bytesize));
    unsafe { *dptr = FAKE_DEVICE_PTR };
    CUDA_SUCCESS
}

pub unsafe extern "C" fn fake_mem_free(dptr: CUdeviceptr) -> CUresult {
    if let Some(code) = enter("cuMemFree_v2") {
        return code;
    }
    with_driver(|d| d.last_free = Some(dptr));
    CUDA_SUCCESS
}

pub unsafe extern "C" fn fake_memcpy_htod(
    dst: CUdeviceptr,
    src: *const c_void,
    byte_count: usize,
) -> CUresult {
    if let Some(code) = enter("cuMemcpyHtoD_v2") {
        return code;
    }
    with_driver(|d| d.last_copy = Some((dst, src as usize, byte_count)));
    CUDA_SUCCESS
}

pub unsafe extern "C" fn fake_memcpy_dtoh(
    dst: *mut c_void,
    src: CUdeviceptr,
    byte_count: usize,
) -> CUresult {
    if let Some(code) = enter("cuMemcpyDtoH_v2") {
        return code;
    }
    with_driver(|d| d.last_copy = Some((src, dst as usize, byte_count)));
    CUDA_SUCCESS
}

pub unsafe extern "C" fn fake_ctx_create(
    pctx: *mut CUcontext,
    _flags: c_uint,
    _dev: CUdevice,
) -> CUresult {
    if let Some(code) = enter("cuCtxCreate_v2") {
        return code;
    }
    unsafe { *pctx = FAKE_CONTEXT as CUcontext };
    CUDA_SUCCESS
}

pub unsafe extern "C" fn fake_launch_kernel(
    f: CUfunction,
    grid_dim_x: c_uint,
    grid_dim_y: c_uint,
    grid_dim_z: c_uint,
    block_dim_x: c_uint,
    block_dim_y: c_uint,
    block_dim_z: c_uint,
    shared_mem_bytes: c_uint,
    hstream: CUstream,
    kernel_params: *mut *mut c_void,
    extra: *mut *mut c_void,
) -> CUresult {
    if let Some(code) = enter("cuLaunchKernel") {
        return code;
    }
    with_driver(|d| {
        d.last_launch = Some(LaunchArgs {
            f: f as usize,
            grid: [grid_dim_x, grid_dim_y, grid_dim_z],
            block: [block_dim_x, block_dim_y, block_dim_z],
            shared: shared_mem_bytes,
            stream: hstream as usize,
            params: kernel_params as usize,
            extra: extra as usize,
        })
    });
    CUDA_SUCCESS
}

unsafe fn answer_proc_address(symbol: *const c_char, pfn: *mut *mut c_void) -> CUresult {
    let name = unsafe { CStr::from_ptr(symbol) };
    match with_driver(|d| d.proc_table.get(name).copied()) {
        Some(addr) => {
            unsafe { *pfn = addr as *mut c_void };
            CUDA_SUCCESS
        }
        None => {
            unsafe { *pfn = ptr::null_mut() };
            CUDA_ERROR_NOT_FOUND
        }
    }
}

pub unsafe extern "C" fn fake_get_proc_address(
    symbol: *const c_char,
    pfn: *mut *mut c_void,
    _cuda_version: c_int,
    _flags: u64,
) -> CUresult {
    if let Some(code) = enter("cuGetProcAddress") {
        return code;
    }
    unsafe { answer_proc_address(symbol, pfn) }
}

pub unsafe extern "C" fn fake_get_proc_address_v2(
    symbol: *const c_char,
    pfn: *mut *mut c_void,
    _cuda_version: c_int,
    _flags: u64,
    symbol_status: *mut c_int,
) -> CUresult {
    if let Some(code) = enter("cuGetProcAddress_v2") {
        return code;
    }
    let res = unsafe { answer_proc_address(symbol, pfn) };
    if !symbol_status.is_null() {
        unsafe { *symbol_status = if res == CUDA_SUCCESS { 0 } else { 1 } };
    }
    res
}

pub unsafe extern "C" fn fake_ctx_get_current(pctx: *mut CUcontext) -> CUresult {
    enter("cuCtxGetCurrent");
    unsafe { *pctx = FAKE_CONTEXT as CUcontext };
    CUDA_SUCCESS
}

pub unsafe extern "C" fn fake_ctx_get_device(device: *mut CUdevice) -> CUresult {
    enter("cuCtxGetDevice");
    unsafe { *device = 0 };
    CUDA_SUCCESS
}

pub unsafe extern "C" fn fake_device_get_name(
    name: *mut c_char,
    len: c_int,
    _dev: CUdevice,
) -> CUresult {
    enter("cuDeviceGetName");
    if with_driver(|d| d.name_fails) {
        return CUDA_ERROR_INVALID_VALUE;
    }
    let fake = b"Fake GPU\0";
    let n = fake.len().min(len as usize);
    unsafe { ptr::copy_nonoverlapping(fake.as_ptr() as *const c_char, name, n) };
    CUDA_SUCCESS
}

pub unsafe extern "C" fn fake_nvml_memory_info(
    device: nvmlDevice_t,
    memory: *mut nvmlMemory_t,
) -> nvmlReturn_t {
    if let Some(code) = enter("nvmlDeviceGetMemoryInfo") {
        return code as nvmlReturn_t;
    }
    let (free, total) = with_driver(|d| {
        d.last_nvml_device = Some(device as usize);
        (d.free, d.total)
    });
    unsafe {
        *memory = nvmlMemory_t {
            total,
            free,
            used: total - free,
        }
    };
    NVML_SUCCESS
}

pub unsafe extern "C" fn fake_nvml_memory_info_v2(
    device: nvmlDevice_t,
    memory: *mut nvmlMemory_v2_t,
) -> nvmlReturn_t {
    if let Some(code) = enter("nvmlDeviceGetMemoryInfo_v2") {
        return code as nvmlReturn_t;
    }
    let (free, total, reserved) = with_driver(|d| {
        d.last_nvml_device = Some(device as usize);
        (d.free, d.total, d.nvml_reserved)
    });
    unsafe {
        let memory = &mut *memory;
        memory.total = total;
        memory.reserved = reserved;
        memory.free = free;
        memory.used = total - reserved - free;
    }
    NVML_SUCCESS
}

/// Address of the fake standing in for `entry`.
pub fn fake_address(entry: EntryPoint) -> *mut c_void {
    match entry {
        EntryPoint::CuDeviceTotalMem => fake_device_total_mem as FnCuDeviceTotalMem as *mut c_void,
        EntryPoint::CuCtxCreate => fake_ctx_create as FnCuCtxCreate as *mut c_void,
        EntryPoint::CuMemAlloc => fake_mem_alloc as FnCuMemAlloc as *mut c_void,
        EntryPoint::CuMemFree => fake_mem_free as FnCuMemFree as *mut c_void,
        EntryPoint::CuMemcpyHtoD => fake_memcpy_htod as FnCuMemcpyHtoD as *mut c_void,
        EntryPoint::CuMemcpyDtoH => fake_memcpy_dtoh as FnCuMemcpyDtoH as *mut c_void,
        EntryPoint::CuLaunchKernel => fake_launch_kernel as FnCuLaunchKernel as *mut c_void,
        EntryPoint::CuMemGetInfo => fake_mem_get_info as FnCuMemGetInfo as *mut c_void,
        EntryPoint::CuGetProcAddress => {
            fake_get_proc_address as FnCuGetProcAddress as *mut c_void
        }
        EntryPoint::CuGetProcAddressV2 => {
            fake_get_proc_address_v2 as FnCuGetProcAddressV2 as *mut c_void
        }
        EntryPoint::NvmlDeviceGetMemoryInfo => {
            fake_nvml_memory_info as FnNvmlDeviceGetMemoryInfo as *mut c_void
        }
        EntryPoint::NvmlDeviceGetMemoryInfoV2 => {
            fake_nvml_memory_info_v2 as FnNvmlDeviceGetMemoryInfoV2 as *mut c_void
        }
        EntryPoint::CuCtxGetCurrent => fake_ctx_get_current as FnCuCtxGetCurrent as *mut c_void,
        EntryPoint::CuCtxGetDevice => fake_ctx_get_device as FnCuCtxGetDevice as *mut c_void,
        EntryPoint::CuDeviceGetName => fake_device_get_name as FnCuDeviceGetName as *mut c_void,
    }
}

pub fn legacy_mem_get_info_address() -> *mut c_void {
    fake_mem_get_info_legacy as FnCuMemGetInfo as *mut c_void
}

// ── Resolver ────────────────────────────────────────────────────────

/// Resolver over the fakes. Clones share the hidden set and lookup counter,
/// so a test can keep one clone after handing another to an `Interceptor`.
#[derive(Clone, Default)]
pub struct FakeResolver {
    symbols: Arc<HashMap<CString, usize>>,
    hidden: Arc<Mutex<HashSet<CString>>>,
    lookups: Arc<AtomicUsize>,
}

impl FakeResolver {
    /// Every entry point resolves to its fake.
    pub fn full() -> Self {
        let symbols = EntryPoint::ALL
            .into_iter()
            .map(|entry| (entry.symbol().to_owned(), fake_address(entry) as usize))
            .collect();
        Self {
            symbols: Arc::new(symbols),
            ..Self::default()
        }
    }

    /// Nothing resolves and nothing is identifiable.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Make lookups of `entries` fail. `symbol_at` still identifies them.
    pub fn hiding(self, entries: &[EntryPoint]) -> Self {
        {
            let mut hidden = self.hidden.lock().unwrap();
            for entry in entries {
                hidden.insert(entry.symbol().to_owned());
            }
        }
        self
    }

    pub fn reveal(&self, entry: EntryPoint) {
        self.hidden.lock().unwrap().remove(entry.symbol());
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl SymbolResolver for FakeResolver {
    fn lookup(&self, symbol: &CStr) -> *mut c_void {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.hidden.lock().unwrap().contains(symbol) {
            return ptr::null_mut();
        }
        self.symbols
            .get(symbol)
            .map_or(ptr::null_mut(), |&addr| addr as *mut c_void)
    }

    fn symbol_at(&self, addr: *mut c_void) -> Option<CString> {
        self.symbols
            .iter()
            .find(|&(_, &known)| known == addr as usize)
            .map(|(name, _)| name.clone())
    }
}

/// Interceptor over `resolver` with the eager resolution pass already run.
pub fn interceptor(policy: QuotaPolicy, resolver: &FakeResolver) -> Interceptor {
    let interceptor = Interceptor::new(policy, Box::new(resolver.clone()));
    interceptor.resolve_bindings();
    interceptor
}

// ── Redirect table ──────────────────────────────────────────────────

static MARKERS: [u8; EntryPoint::COUNT] = [0; EntryPoint::COUNT];

/// Stand-in replacement address for `entry`, distinct per entry point.
pub fn marker(entry: EntryPoint) -> *mut c_void {
    &MARKERS[entry as usize] as *const u8 as *mut c_void
}

/// Redirect table routing every intercepted entry to its marker.
pub fn marker_table() -> RedirectTable {
    let mut table = RedirectTable::new();
    for entry in EntryPoint::ALL.into_iter().filter(|e| e.is_intercepted()) {
        table.insert(entry, marker(entry));
    }
    table
}
