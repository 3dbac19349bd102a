//! NVML memory-info replacements.
//!
//! NVML is usually loaded late and its entry points looked up by name, so
//! these bindings are often completed by the `dlsym` hook rather than the
//! bootstrap pass.

use vramcap_core::ffi::{nvmlDevice_t, nvmlMemory_t, nvmlMemory_v2_t, nvmlReturn_t};

use crate::interceptor;

#[no_mangle]
pub unsafe extern "C" fn nvmlDeviceGetMemoryInfo(
    device: nvmlDevice_t,
    memory: *mut nvmlMemory_t,
) -> nvmlReturn_t {
    unsafe { interceptor().nvml_memory_info(device, memory) }
}

#[no_mangle]
pub unsafe extern "C" fn nvmlDeviceGetMemoryInfo_v2(
    device: nvmlDevice_t,
    memory: *mut nvmlMemory_v2_t,
) -> nvmlReturn_t {
    unsafe { interceptor().nvml_memory_info_v2(device, memory) }
}
