//! Symbol-lookup hooks: `dlsym` and `cuGetProcAddress`.
//!
//! Applications and CUDA runtimes that `dlopen` the driver and look entry
//! points up by name never go through the preload path. Both hooks consult one
//! name-keyed table and hand back this library's replacement for intercepted
//! names.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::ptr;
use std::sync::OnceLock;

use vramcap_core::ffi::CUresult;
use vramcap_core::{EntryPoint, RedirectTable};

use crate::{interceptor, loader, nvml};

/// Address of this library's replacement for `entry`.
fn replacement(entry: EntryPoint) -> Option<*mut c_void> {
    let addr = match entry {
        EntryPoint::CuDeviceTotalMem => crate::cuDeviceTotalMem_v2 as *mut c_void,
        EntryPoint::CuCtxCreate => crate::cuCtxCreate_v2 as *mut c_void,
        EntryPoint::CuMemAlloc => crate::cuMemAlloc_v2 as *mut c_void,
        EntryPoint::CuMemFree => crate::cuMemFree_v2 as *mut c_void,
        EntryPoint::CuMemcpyHtoD => crate::cuMemcpyHtoD_v2 as *mut c_void,
        EntryPoint::CuMemcpyDtoH => crate::cuMemcpyDtoH_v2 as *mut c_void,
        EntryPoint::CuLaunchKernel => crate::cuLaunchKernel as *mut c_void,
        EntryPoint::CuMemGetInfo => crate::cuMemGetInfo_v2 as *mut c_void,
        EntryPoint::CuGetProcAddress => cuGetProcAddress as *mut c_void,
        EntryPoint::CuGetProcAddressV2 => cuGetProcAddress_v2 as *mut c_void,
        EntryPoint::NvmlDeviceGetMemoryInfo => nvml::nvmlDeviceGetMemoryInfo as *mut c_void,
        EntryPoint::NvmlDeviceGetMemoryInfoV2 => nvml::nvmlDeviceGetMemoryInfo_v2 as *mut c_void,
        EntryPoint::CuCtxGetCurrent | EntryPoint::CuCtxGetDevice | EntryPoint::CuDeviceGetName => {
            return None
        }
    };
    Some(addr)
}

fn redirect_table() -> &'static RedirectTable {
    static TABLE: OnceLock<RedirectTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = RedirectTable::new();
        for entry in EntryPoint::ALL.into_iter().filter(|e| e.is_intercepted()) {
            if let Some(addr) = replacement(entry) {
                table.insert(entry, addr);
            }
        }
        table
    })
}

/// Replacement for the loader's `dlsym`.
///
/// The fast path only touches the redirect table, never the interceptor, so
/// lookups made while the interceptor is being built cannot re-enter it.
#[no_mangle]
pub unsafe extern "C" fn dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void {
    let Some(real_dlsym) = loader::real_dlsym() else {
        return ptr::null_mut();
    };
    let genuine = unsafe { real_dlsym(handle, symbol) };
    if symbol.is_null() || genuine.is_null() {
        return genuine;
    }

    let name = unsafe { CStr::from_ptr(symbol) };
    let table = redirect_table();
    if table.by_symbol(name).is_none() {
        return genuine;
    }
    interceptor().redirect_symbol(table, name, genuine)
}

#[no_mangle]
pub unsafe extern "C" fn cuGetProcAddress(
    symbol: *const c_char,
    pfn: *mut *mut c_void,
    cuda_version: c_int,
    flags: u64,
) -> CUresult {
    unsafe { interceptor().get_proc_address(redirect_table(), symbol, pfn, cuda_version, flags) }
}

#[no_mangle]
pub unsafe extern "C" fn cuGetProcAddress_v2(
    symbol: *const c_char,
    pfn: *mut *mut c_void,
    cuda_version: c_int,
    flags: u64,
    symbol_status: *mut c_int,
) -> CUresult {
    unsafe {
        interceptor().get_proc_address_v2(
            redirect_table(),
            symbol,
            pfn,
            cuda_version,
            flags,
            symbol_status,
        )
    }
}
