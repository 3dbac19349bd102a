//! GPU memory quota interposition library.
//!
//! This cdylib is preloaded ahead of the CUDA driver (libcuda.so) and NVML
//! (libnvidia-ml.so). It exports replacements for the memory-reporting and
//! memory-management entry points, forwards each call to the genuine driver
//! function, and rewrites the reported capacities so that a fixed fraction of
//! device memory is hidden from the application.
//!
//! Usage:
//! - Linux: LD_PRELOAD=libvramcap_interpose.so <application>
//! - or: vramcap run --fraction 0.5 -- <application>

#![allow(non_snake_case)]

mod loader;
pub mod nvml;
pub mod proc_address;

use std::ffi::{c_uint, c_void};

use tracing::warn;

use vramcap_core::ffi::{CUcontext, CUdevice, CUdeviceptr, CUfunction, CUresult, CUstream};
use vramcap_core::{Bootstrap, Interceptor, QuotaPolicy, VramcapConfig};

static BOOTSTRAP: Bootstrap = Bootstrap::new();

/// The process-wide interceptor, bootstrapping it on first use.
///
/// The load-time constructor normally gets here first; every exported
/// function calls this again in case a loader ran us out of order.
pub(crate) fn interceptor() -> &'static Interceptor {
    BOOTSTRAP.initialize(|| {
        vramcap_common::init_preload_logging();
        Interceptor::new(load_policy(), Box::new(loader::NextInSearchOrder))
    })
}

/// Read the policy from config file and environment. A preloaded library must
/// not abort its host, so an invalid configuration falls back to defaults.
fn load_policy() -> QuotaPolicy {
    match VramcapConfig::from_environment().and_then(|config| config.policy()) {
        Ok(policy) => policy,
        Err(e) => {
            let policy = QuotaPolicy::default();
            warn!(
                "invalid vramcap configuration ({}), using reserved_fraction={}",
                e,
                policy.reserved_fraction()
            );
            policy
        }
    }
}

#[ctor::ctor]
fn init_bindings() {
    interceptor();
}

// ── Capacity Queries ────────────────────────────────────────────────

#[no_mangle]
pub unsafe extern "C" fn cuDeviceTotalMem_v2(bytes: *mut usize, dev: CUdevice) -> CUresult {
    unsafe { interceptor().device_total_mem(bytes, dev) }
}

#[no_mangle]
pub unsafe extern "C" fn cuMemGetInfo_v2(free: *mut usize, total: *mut usize) -> CUresult {
    unsafe { interceptor().mem_get_info(free, total) }
}

// ── Memory Management ───────────────────────────────────────────────

#[no_mangle]
pub unsafe extern "C" fn cuMemAlloc_v2(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult {
    unsafe { interceptor().mem_alloc(dptr, bytesize) }
}

#[no_mangle]
pub unsafe extern "C" fn cuMemFree_v2(dptr: CUdeviceptr) -> CUresult {
    unsafe { interceptor().mem_free(dptr) }
}

#[no_mangle]
pub unsafe extern "C" fn cuMemcpyHtoD_v2(
    dst_device: CUdeviceptr,
    src_host: *const c_void,
    byte_count: usize,
) -> CUresult {
    unsafe { interceptor().memcpy_htod(dst_device, src_host, byte_count) }
}

#[no_mangle]
pub unsafe extern "C" fn cuMemcpyDtoH_v2(
    dst_host: *mut c_void,
    src_device: CUdeviceptr,
    byte_count: usize,
) -> CUresult {
    unsafe { interceptor().memcpy_dtoh(dst_host, src_device, byte_count) }
}

// ── Context Management ──────────────────────────────────────────────

#[no_mangle]
pub unsafe extern "C" fn cuCtxCreate_v2(
    pctx: *mut CUcontext,
    flags: c_uint,
    dev: CUdevice,
) -> CUresult {
    unsafe { interceptor().ctx_create(pctx, flags, dev) }
}

// ── Execution Control ───────────────────────────────────────────────

#[no_mangle]
pub unsafe extern "C" fn cuLaunchKernel(
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
    unsafe {
        interceptor().launch_kernel(
            f,
            [grid_dim_x, grid_dim_y, grid_dim_z],
            [block_dim_x, block_dim_y, block_dim_z],
            shared_mem_bytes,
            hstream,
            kernel_params,
            extra,
        )
    }
}
