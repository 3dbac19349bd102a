//! Replacement logic for every intercepted entry point.
//!
//! The exported `extern "C"` symbols in `vramcap-interpose` are one-line
//! shims over these methods. Each method forwards to the genuine function
//! bound in [`DriverBindings`] and rewrites outputs only on success.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr};
use std::ptr;

use tracing::{debug, trace, Level};

use crate::binding::{DriverBindings, EntryPoint, Library, ResolveReport, SymbolResolver};
use crate::ffi::*;
use crate::policy::{CapacityTriple, QuotaPolicy};
use crate::redirect::RedirectTable;

/// Length of the device-name buffer used for diagnostics.
const DEVICE_NAME_LEN: usize = 100;

pub struct Interceptor {
    bindings: DriverBindings,
    policy: QuotaPolicy,
    resolver: Box<dyn SymbolResolver>,
}

impl Interceptor {
    pub fn new(policy: QuotaPolicy, resolver: Box<dyn SymbolResolver>) -> Self {
        Self {
            bindings: DriverBindings::new(),
            policy,
            resolver,
        }
    }

    pub fn bindings(&self) -> &DriverBindings {
        &self.bindings
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    /// Eagerly resolve every binding through the resolver.
    pub fn resolve_bindings(&self) -> ResolveReport {
        self.bindings.resolve_all(self.resolver.as_ref())
    }

    /// The genuine function for `entry`, resolving it now if the eager pass
    /// came up empty.
    ///
    /// # Safety
    /// `F` must be the signature of `entry`.
    unsafe fn genuine<F: Copy>(&self, entry: EntryPoint) -> Option<F> {
        let slot = self.bindings.slot(entry);
        if !slot.is_resolved() && slot.complete(self.resolver.lookup(entry.symbol())) {
            debug!("{} bound at first use", entry.name());
        }
        unsafe { slot.function::<F>() }
    }

    fn unresolved_cuda(&self, entry: EntryPoint) -> CUresult {
        debug!("{}: genuine entry point unavailable", entry.name());
        CUDA_ERROR_SHARED_OBJECT_SYMBOL_NOT_FOUND
    }

    fn unresolved_nvml(&self, entry: EntryPoint) -> nvmlReturn_t {
        debug!("{}: genuine entry point unavailable", entry.name());
        NVML_ERROR_FUNCTION_NOT_FOUND
    }

    // ── Capacity reporting ──────────────────────────────────────────

    /// # Safety
    /// `bytes` must be null or valid for writes.
    pub unsafe fn device_total_mem(&self, bytes: *mut usize, dev: CUdevice) -> CUresult {
        if bytes.is_null() {
            return CUDA_ERROR_INVALID_VALUE;
        }
        let Some(genuine) =
            (unsafe { self.genuine::<FnCuDeviceTotalMem>(EntryPoint::CuDeviceTotalMem) })
        else {
            return self.unresolved_cuda(EntryPoint::CuDeviceTotalMem);
        };

        let res = unsafe { genuine(bytes, dev) };
        if res != CUDA_SUCCESS {
            return res;
        }

        let total = unsafe { *bytes } as u64;
        let adjusted = self.policy.adjusted_total(total);
        debug!("cuDeviceTotalMem_v2(dev={}) {} -> {}", dev, total, adjusted);
        unsafe { *bytes = adjusted as usize };
        CUDA_SUCCESS
    }

    /// # Safety
    /// `free` and `total` must be null or valid for writes.
    pub unsafe fn mem_get_info(&self, free: *mut usize, total: *mut usize) -> CUresult {
        if free.is_null() || total.is_null() {
            return CUDA_ERROR_INVALID_VALUE;
        }
        let Some(genuine) = (unsafe { self.genuine::<FnCuMemGetInfo>(EntryPoint::CuMemGetInfo) })
        else {
            return self.unresolved_cuda(EntryPoint::CuMemGetInfo);
        };

        let res = unsafe { genuine(free, total) };
        if res != CUDA_SUCCESS {
            return res;
        }

        let genuine_triple =
            unsafe { CapacityTriple::from_free_total(*free as u64, *total as u64) };
        let adjusted = self.policy.adjust(genuine_triple);
        debug!(
            "cuMemGetInfo_v2 free {} -> {}, total {} -> {}",
            genuine_triple.free, adjusted.free, genuine_triple.total, adjusted.total
        );
        unsafe {
            *free = adjusted.free as usize;
            *total = adjusted.total as usize;
        }
        CUDA_SUCCESS
    }

    /// Adjusted capacity of the current context's device, straight from the
    /// genuine `cuMemGetInfo_v2`.
    pub fn adjusted_capacity(&self) -> Result<CapacityTriple, CUresult> {
        let Some(genuine) = (unsafe { self.genuine::<FnCuMemGetInfo>(EntryPoint::CuMemGetInfo) })
        else {
            return Err(self.unresolved_cuda(EntryPoint::CuMemGetInfo));
        };

        let (mut free, mut total) = (0usize, 0usize);
        let res = unsafe { genuine(&mut free, &mut total) };
        if res != CUDA_SUCCESS {
            return Err(res);
        }
        Ok(self
            .policy
            .adjust(CapacityTriple::from_free_total(free as u64, total as u64)))
    }

    /// # Safety
    /// `memory` must be null or point to a writable `nvmlMemory_t`.
    pub unsafe fn nvml_memory_info(
        &self,
        device: nvmlDevice_t,
        memory: *mut nvmlMemory_t,
    ) -> nvmlReturn_t {
        if memory.is_null() {
            return NVML_ERROR_INVALID_ARGUMENT;
        }
        let Some(genuine) = (unsafe {
            self.genuine::<FnNvmlDeviceGetMemoryInfo>(EntryPoint::NvmlDeviceGetMemoryInfo)
        }) else {
            return self.unresolved_nvml(EntryPoint::NvmlDeviceGetMemoryInfo);
        };

        let res = unsafe { genuine(device, memory) };
        if res != NVML_SUCCESS {
            return res;
        }

        let memory = unsafe { &mut *memory };
        let adjusted = self
            .policy
            .adjust(CapacityTriple::from_free_total(memory.free, memory.total));
        debug!(
            "nvmlDeviceGetMemoryInfo total {} -> {}, free {} -> {}",
            memory.total, adjusted.total, memory.free, adjusted.free
        );
        memory.total = adjusted.total;
        memory.free = adjusted.free;
        memory.used = adjusted.used;
        NVML_SUCCESS
    }

    /// # Safety
    /// `memory` must be null or point to a writable `nvmlMemory_v2_t`.
    pub unsafe fn nvml_memory_info_v2(
        &self,
        device: nvmlDevice_t,
        memory: *mut nvmlMemory_v2_t,
    ) -> nvmlReturn_t {
        if memory.is_null() {
            return NVML_ERROR_INVALID_ARGUMENT;
        }
        let Some(genuine) = (unsafe {
            self.genuine::<FnNvmlDeviceGetMemoryInfoV2>(EntryPoint::NvmlDeviceGetMemoryInfoV2)
        }) else {
            return self.unresolved_nvml(EntryPoint::NvmlDeviceGetMemoryInfoV2);
        };

        let res = unsafe { genuine(device, memory) };
        if res != NVML_SUCCESS {
            return res;
        }

        let memory = unsafe { &mut *memory };
        let adjusted = self
            .policy
            .adjust(CapacityTriple::from_free_total(memory.free, memory.total));
        debug!(
            "nvmlDeviceGetMemoryInfo_v2 total {} -> {}, free {} -> {}",
            memory.total, adjusted.total, memory.free, adjusted.free
        );
        memory.total = adjusted.total;
        memory.free = adjusted.free;
        // v2 reports driver-reserved memory separately from used memory.
        memory.used = adjusted
            .total
            .saturating_sub(memory.reserved)
            .saturating_sub(adjusted.free);
        NVML_SUCCESS
    }

    // ── Memory management ───────────────────────────────────────────

    /// # Safety
    /// Same contract as `cuMemAlloc_v2`.
    pub unsafe fn mem_alloc(&self, dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult {
        let Some(genuine) = (unsafe { self.genuine::<FnCuMemAlloc>(EntryPoint::CuMemAlloc) })
        else {
            return self.unresolved_cuda(EntryPoint::CuMemAlloc);
        };

        if self.policy.enforcement() == crate::policy::Enforcement::Strict {
            let adjusted = match self.adjusted_capacity() {
                Ok(adjusted) => adjusted,
                Err(code) => return code,
            };
            if !self.policy.admits(bytesize as u64, &adjusted) {
                debug!(
                    "cuMemAlloc_v2({} bytes) rejected, {} bytes free under quota",
                    bytesize, adjusted.free
                );
                return CUDA_ERROR_OUT_OF_MEMORY;
            }
        }

        self.trace_context("cuMemAlloc_v2", false);
        let res = unsafe { genuine(dptr, bytesize) };
        debug!("cuMemAlloc_v2({} bytes) -> {}", bytesize, res);
        res
    }

    /// # Safety
    /// Same contract as `cuMemFree_v2`.
    pub unsafe fn mem_free(&self, dptr: CUdeviceptr) -> CUresult {
        match unsafe { self.genuine::<FnCuMemFree>(EntryPoint::CuMemFree) } {
            Some(genuine) => unsafe { genuine(dptr) },
            None => self.unresolved_cuda(EntryPoint::CuMemFree),
        }
    }

    /// # Safety
    /// Same contract as `cuMemcpyHtoD_v2`.
    pub unsafe fn memcpy_htod(
        &self,
        dst: CUdeviceptr,
        src: *const c_void,
        byte_count: usize,
    ) -> CUresult {
        let Some(genuine) = (unsafe { self.genuine::<FnCuMemcpyHtoD>(EntryPoint::CuMemcpyHtoD) })
        else {
            return self.unresolved_cuda(EntryPoint::CuMemcpyHtoD);
        };
        self.trace_context("cuMemcpyHtoD_v2", true);
        unsafe { genuine(dst, src, byte_count) }
    }

    /// # Safety
    /// Same contract as `cuMemcpyDtoH_v2`.
    pub unsafe fn memcpy_dtoh(
        &self,
        dst: *mut c_void,
        src: CUdeviceptr,
        byte_count: usize,
    ) -> CUresult {
        let Some(genuine) = (unsafe { self.genuine::<FnCuMemcpyDtoH>(EntryPoint::CuMemcpyDtoH) })
        else {
            return self.unresolved_cuda(EntryPoint::CuMemcpyDtoH);
        };
        self.trace_context("cuMemcpyDtoH_v2", false);
        unsafe { genuine(dst, src, byte_count) }
    }

    // ── Context and execution ───────────────────────────────────────

    /// # Safety
    /// Same contract as `cuCtxCreate_v2`.
    pub unsafe fn ctx_create(&self, pctx: *mut CUcontext, flags: c_uint, dev: CUdevice) -> CUresult {
        match unsafe { self.genuine::<FnCuCtxCreate>(EntryPoint::CuCtxCreate) } {
            Some(genuine) => unsafe { genuine(pctx, flags, dev) },
            None => self.unresolved_cuda(EntryPoint::CuCtxCreate),
        }
    }

    /// # Safety
    /// Same contract as `cuLaunchKernel`.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn launch_kernel(
        &self,
        f: CUfunction,
        grid_dim: [c_uint; 3],
        block_dim: [c_uint; 3],
        shared_mem_bytes: c_uint,
        hstream: CUstream,
        kernel_params: *mut *mut c_void,
        extra: *mut *mut c_void,
    ) -> CUresult {
        let Some(genuine) =
            (unsafe { self.genuine::<FnCuLaunchKernel>(EntryPoint::CuLaunchKernel) })
        else {
            return self.unresolved_cuda(EntryPoint::CuLaunchKernel);
        };

        debug!(
            "cuLaunchKernel(grid=[{}x{}x{}], block=[{}x{}x{}], shared={})",
            grid_dim[0], grid_dim[1], grid_dim[2], block_dim[0], block_dim[1], block_dim[2],
            shared_mem_bytes
        );
        unsafe {
            genuine(
                f,
                grid_dim[0],
                grid_dim[1],
                grid_dim[2],
                block_dim[0],
                block_dim[1],
                block_dim[2],
                shared_mem_bytes,
                hstream,
                kernel_params,
                extra,
            )
        }
    }

    /// Log the calling thread's current context (and optionally its device
    /// name). Only the genuine query functions are called, and only when debug
    /// logging is on; results of the traced call are unaffected.
    fn trace_context(&self, call: &str, with_device_name: bool) {
        if !tracing::enabled!(Level::DEBUG) {
            return;
        }
        let Some(get_current) =
            (unsafe { self.genuine::<FnCuCtxGetCurrent>(EntryPoint::CuCtxGetCurrent) })
        else {
            return;
        };

        let mut ctx: CUcontext = ptr::null_mut();
        if unsafe { get_current(&mut ctx) } != CUDA_SUCCESS {
            return;
        }
        if !with_device_name {
            debug!("{}: context {:p}", call, ctx);
            return;
        }

        match self.current_device_name() {
            Some((device, name)) => {
                debug!("{}: context {:p}, device {} [{}]", call, ctx, name, device)
            }
            None => debug!("{}: context {:p}", call, ctx),
        }
    }

    fn current_device_name(&self) -> Option<(CUdevice, String)> {
        let get_device =
            unsafe { self.genuine::<FnCuCtxGetDevice>(EntryPoint::CuCtxGetDevice) }?;
        let get_name =
            unsafe { self.genuine::<FnCuDeviceGetName>(EntryPoint::CuDeviceGetName) }?;

        let mut device: CUdevice = 0;
        if unsafe { get_device(&mut device) } != CUDA_SUCCESS {
            return None;
        }
        let mut buf = [0u8; DEVICE_NAME_LEN];
        let res = unsafe {
            get_name(buf.as_mut_ptr() as *mut c_char, DEVICE_NAME_LEN as c_int, device)
        };
        if res != CUDA_SUCCESS {
            return None;
        }
        buf[DEVICE_NAME_LEN - 1] = 0;
        let name = CStr::from_bytes_until_nul(&buf).ok()?;
        Some((device, name.to_string_lossy().into_owned()))
    }

    // ── Symbol lookup redirection ───────────────────────────────────

    /// Post-process a genuine `dlsym` result.
    ///
    /// Names in `table` get this layer's replacement, and the genuine address
    /// completes the entry's binding if it is still empty. Anything else, or a
    /// failed lookup, passes through.
    pub fn redirect_symbol(
        &self,
        table: &RedirectTable,
        symbol: &CStr,
        genuine: *mut c_void,
    ) -> *mut c_void {
        if genuine.is_null() {
            return genuine;
        }
        let Some(redirect) = table.by_symbol(symbol) else {
            return genuine;
        };
        // A lookup through the global scope finds this library first.
        if table.is_replacement(genuine) {
            return genuine;
        }

        let slot = self.bindings.slot(redirect.entry);
        let was_bound = slot.is_resolved();
        if slot.complete(genuine) && !was_bound {
            debug!("{} bound through dlsym", redirect.entry.name());
        }
        trace!("dlsym({}) redirected", redirect.entry.name());
        redirect.replacement()
    }

    /// Post-process a successful genuine `cuGetProcAddress` result.
    ///
    /// A name can map to several ABI versions (`cuGetProcAddress` answers
    /// with either lookup entry point). The address is swapped for the
    /// replacement of the version it actually is: either a bound genuine
    /// address, or (for an empty binding) an address the resolver identifies
    /// as exactly that symbol. Versions this layer does not wrap pass through.
    pub fn redirect_proc_address(
        &self,
        table: &RedirectTable,
        symbol: &CStr,
        resolved: *mut c_void,
    ) -> *mut c_void {
        if resolved.is_null() || table.is_replacement(resolved) {
            return resolved;
        }
        let candidates = table.by_proc_name(symbol);
        if candidates.is_empty() {
            return resolved;
        }

        let bound = candidates.iter().find(|redirect| {
            self.bindings
                .slot(redirect.entry)
                .get()
                .is_some_and(|addr| addr.as_ptr() == resolved)
        });
        let redirect = bound.or_else(|| {
            let identified = self.resolver.symbol_at(resolved);
            candidates.iter().find(|redirect| {
                let slot = self.bindings.slot(redirect.entry);
                !slot.is_resolved()
                    && identified.as_deref() == Some(redirect.entry.symbol())
                    && slot.complete(resolved)
            })
        });

        match redirect {
            Some(redirect) => {
                trace!(
                    "cuGetProcAddress({}) redirected to {}",
                    symbol.to_string_lossy(),
                    redirect.entry.name()
                );
                redirect.replacement()
            }
            None => resolved,
        }
    }

    /// # Safety
    /// Same contract as `cuGetProcAddress`.
    pub unsafe fn get_proc_address(
        &self,
        table: &RedirectTable,
        symbol: *const c_char,
        pfn: *mut *mut c_void,
        cuda_version: c_int,
        flags: u64,
    ) -> CUresult {
        let Some(genuine) =
            (unsafe { self.genuine::<FnCuGetProcAddress>(EntryPoint::CuGetProcAddress) })
        else {
            return self.unresolved_cuda(EntryPoint::CuGetProcAddress);
        };
        let res = unsafe { genuine(symbol, pfn, cuda_version, flags) };
        unsafe { self.finish_proc_address(table, res, symbol, pfn) }
    }

    /// # Safety
    /// Same contract as `cuGetProcAddress_v2`.
    pub unsafe fn get_proc_address_v2(
        &self,
        table: &RedirectTable,
        symbol: *const c_char,
        pfn: *mut *mut c_void,
        cuda_version: c_int,
        flags: u64,
        symbol_status: *mut c_int,
    ) -> CUresult {
        let Some(genuine) =
            (unsafe { self.genuine::<FnCuGetProcAddressV2>(EntryPoint::CuGetProcAddressV2) })
        else {
            return self.unresolved_cuda(EntryPoint::CuGetProcAddressV2);
        };
        let res = unsafe { genuine(symbol, pfn, cuda_version, flags, symbol_status) };
        unsafe { self.finish_proc_address(table, res, symbol, pfn) }
    }

    unsafe fn finish_proc_address(
        &self,
        table: &RedirectTable,
        res: CUresult,
        symbol: *const c_char,
        pfn: *mut *mut c_void,
    ) -> CUresult {
        if res == CUDA_SUCCESS && !symbol.is_null() && !pfn.is_null() {
            let name = unsafe { CStr::from_ptr(symbol) };
            unsafe { *pfn = self.redirect_proc_address(table, name, *pfn) };
        }
        res
    }

    /// Fail-fast code for an entry point whose binding is missing.
    pub fn unresolved_code(entry: EntryPoint) -> c_int {
        match entry.library() {
            Library::Cuda => CUDA_ERROR_SHARED_OBJECT_SYMBOL_NOT_FOUND,
            Library::Nvml => NVML_ERROR_FUNCTION_NOT_FOUND as c_int,
        }
    }
}
