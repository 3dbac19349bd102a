//! `vramcap probe`: ask the driver how much memory this process can see.
//!
//! Loads the CUDA driver (and NVML if present) with `libloading` and queries
//! one device through all three memory-reporting calls. Under `vramcap run`
//! the lookups go through the preloaded library's `dlsym`, so the adjusted
//! figures are what gets reported.

use std::ffi::{c_char, c_int, c_uint, CStr};
use std::ptr;

use anyhow::{bail, Context};
use libloading::{Library, Symbol};
use serde::Serialize;
use tracing::debug;

use vramcap_common::platform;
use vramcap_core::ffi::*;
use vramcap_core::CapacityTriple;

type FnCuInit = unsafe extern "C" fn(flags: c_uint) -> CUresult;
type FnCuDeviceGet = unsafe extern "C" fn(device: *mut CUdevice, ordinal: c_int) -> CUresult;
type FnCuCtxDestroy = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type FnNvmlInit = unsafe extern "C" fn() -> nvmlReturn_t;
type FnNvmlShutdown = unsafe extern "C" fn() -> nvmlReturn_t;
type FnNvmlDeviceGetHandleByIndex =
    unsafe extern "C" fn(index: c_uint, device: *mut nvmlDevice_t) -> nvmlReturn_t;

#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub device: i32,
    pub name: String,
    /// `cuDeviceTotalMem_v2`
    pub device_total_mem: u64,
    /// `cuMemGetInfo_v2`
    pub mem_get_info: CapacityTriple,
    /// `nvmlDeviceGetMemoryInfo`, when NVML is available
    pub nvml: Option<CapacityTriple>,
}

impl ProbeReport {
    /// Whether every query that answered agrees on the total, allowing one
    /// byte of rounding.
    pub fn is_consistent(&self) -> bool {
        let reference = self.device_total_mem;
        std::iter::once(self.mem_get_info.total)
            .chain(self.nvml.map(|nvml| nvml.total))
            .all(|total| total.abs_diff(reference) <= 1)
    }
}

/// Dynamically loaded CUDA driver, reduced to the calls the probe needs.
struct CudaDriver {
    _lib: Library,
    cu_init: FnCuInit,
    cu_device_get: FnCuDeviceGet,
    cu_device_get_name: FnCuDeviceGetName,
    cu_device_total_mem: FnCuDeviceTotalMem,
    cu_ctx_create: FnCuCtxCreate,
    cu_ctx_destroy: FnCuCtxDestroy,
    cu_mem_get_info: FnCuMemGetInfo,
}

impl CudaDriver {
    fn load() -> anyhow::Result<Self> {
        let lib = load_library(platform::cuda_driver_names())?;
        unsafe {
            Ok(Self {
                cu_init: load_fn(&lib, "cuInit")?,
                cu_device_get: load_fn(&lib, "cuDeviceGet")?,
                cu_device_get_name: load_fn(&lib, "cuDeviceGetName")?,
                cu_device_total_mem: load_fn(&lib, "cuDeviceTotalMem_v2")?,
                cu_ctx_create: load_fn(&lib, "cuCtxCreate_v2")?,
                cu_ctx_destroy: load_fn(&lib, "cuCtxDestroy_v2")?,
                cu_mem_get_info: load_fn(&lib, "cuMemGetInfo_v2")?,
                _lib: lib,
            })
        }
    }
}

fn load_library(names: &[&str]) -> anyhow::Result<Library> {
    let mut last_err = String::new();
    for name in names {
        match unsafe { Library::new(name) } {
            Ok(lib) => {
                debug!("loaded {}", name);
                return Ok(lib);
            }
            Err(e) => {
                last_err = format!("{}: {}", name, e);
                debug!("failed to load {}: {}", name, e);
            }
        }
    }
    bail!("failed to load any of {:?} ({})", names, last_err)
}

unsafe fn load_fn<F: Copy>(lib: &Library, name: &str) -> anyhow::Result<F> {
    let sym: Symbol<F> = unsafe { lib.get(name.as_bytes()) }
        .with_context(|| format!("failed to load {}", name))?;
    Ok(*sym)
}

fn check(res: CUresult, call: &str) -> anyhow::Result<()> {
    if res == CUDA_SUCCESS {
        Ok(())
    } else {
        bail!("{} failed with CUDA error {}", call, res)
    }
}

/// Query device `ordinal` through the CUDA driver and, if available, NVML.
pub fn probe(ordinal: i32) -> anyhow::Result<ProbeReport> {
    let cuda = CudaDriver::load()?;

    let mut device: CUdevice = 0;
    let mut name_buf = [0u8; 256];
    let mut device_total: usize = 0;
    let (mut free, mut total) = (0usize, 0usize);
    unsafe {
        check((cuda.cu_init)(0), "cuInit")?;
        check((cuda.cu_device_get)(&mut device, ordinal), "cuDeviceGet")?;
        check(
            (cuda.cu_device_get_name)(
                name_buf.as_mut_ptr() as *mut c_char,
                name_buf.len() as c_int,
                device,
            ),
            "cuDeviceGetName",
        )?;
        check(
            (cuda.cu_device_total_mem)(&mut device_total, device),
            "cuDeviceTotalMem_v2",
        )?;

        let mut ctx: CUcontext = ptr::null_mut();
        check((cuda.cu_ctx_create)(&mut ctx, 0, device), "cuCtxCreate_v2")?;
        let res = (cuda.cu_mem_get_info)(&mut free, &mut total);
        (cuda.cu_ctx_destroy)(ctx);
        check(res, "cuMemGetInfo_v2")?;
    }

    let name = CStr::from_bytes_until_nul(&name_buf)
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let nvml = match probe_nvml(ordinal as c_uint) {
        Ok(triple) => Some(triple),
        Err(e) => {
            debug!("NVML unavailable: {:#}", e);
            None
        }
    };

    Ok(ProbeReport {
        device: ordinal,
        name,
        device_total_mem: device_total as u64,
        mem_get_info: CapacityTriple::from_free_total(free as u64, total as u64),
        nvml,
    })
}

fn probe_nvml(index: c_uint) -> anyhow::Result<CapacityTriple> {
    let lib = load_library(platform::nvml_names())?;
    unsafe {
        let init: FnNvmlInit = load_fn(&lib, "nvmlInit_v2")?;
        let shutdown: FnNvmlShutdown = load_fn(&lib, "nvmlShutdown")?;
        let get_handle: FnNvmlDeviceGetHandleByIndex =
            load_fn(&lib, "nvmlDeviceGetHandleByIndex_v2")?;
        let get_memory: FnNvmlDeviceGetMemoryInfo = load_fn(&lib, "nvmlDeviceGetMemoryInfo")?;

        let res = init();
        if res != NVML_SUCCESS {
            bail!("nvmlInit_v2 failed with NVML error {}", res);
        }

        let mut device: nvmlDevice_t = ptr::null_mut();
        let mut memory = nvmlMemory_t::default();
        let mut res = get_handle(index, &mut device);
        if res == NVML_SUCCESS {
            res = get_memory(device, &mut memory);
        }
        shutdown();
        if res != NVML_SUCCESS {
            bail!("NVML memory query failed with NVML error {}", res);
        }

        Ok(CapacityTriple {
            free: memory.free,
            used: memory.used,
            total: memory.total,
        })
    }
}
