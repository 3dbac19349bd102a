//! Genuine symbol lookup.
//!
//! This library exports its own `dlsym`, and inside a preloaded object every
//! call to `libc::dlsym` binds to that export. All internal lookups therefore
//! go through the genuine `dlsym`, fetched with `dlvsym`, which is not
//! overridden.

use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr;
use std::sync::OnceLock;

use tracing::error;
use vramcap_core::SymbolResolver;

pub type FnDlsym = unsafe extern "C" fn(handle: *mut c_void, symbol: *const c_char) -> *mut c_void;

extern "C" {
    fn dlvsym(handle: *mut c_void, symbol: *const c_char, version: *const c_char) -> *mut c_void;
}

/// Symbol versions glibc has published `dlsym` under, newest first.
/// 2.34 moved libdl into libc; the rest are the per-architecture baselines.
const DLSYM_VERSIONS: [&CStr; 4] = [c"GLIBC_2.34", c"GLIBC_2.2.5", c"GLIBC_2.17", c"GLIBC_2.0"];

/// The genuine `dlsym`, or `None` if no known version could be found.
pub fn real_dlsym() -> Option<FnDlsym> {
    static REAL_DLSYM: OnceLock<Option<FnDlsym>> = OnceLock::new();
    *REAL_DLSYM.get_or_init(|| {
        let found = DLSYM_VERSIONS.iter().find_map(|version| {
            let addr = unsafe { dlvsym(libc::RTLD_NEXT, c"dlsym".as_ptr(), version.as_ptr()) };
            (!addr.is_null())
                .then(|| unsafe { std::mem::transmute::<*mut c_void, FnDlsym>(addr) })
        });
        if found.is_none() {
            error!("failed to locate the genuine dlsym; every binding will stay unresolved");
        }
        found
    })
}

/// Resolves names starting strictly after this library in the loader's search
/// order (`RTLD_NEXT`), so the driver's export is found rather than ours.
///
/// `RTLD_NEXT` is relative to the object that calls `dlsym`; the call below is
/// compiled into this library, which keeps that true.
pub struct NextInSearchOrder;

impl SymbolResolver for NextInSearchOrder {
    fn lookup(&self, symbol: &CStr) -> *mut c_void {
        match real_dlsym() {
            Some(dlsym) => unsafe { dlsym(libc::RTLD_NEXT, symbol.as_ptr()) },
            None => ptr::null_mut(),
        }
    }

    fn symbol_at(&self, addr: *mut c_void) -> Option<CString> {
        let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
        if unsafe { libc::dladdr(addr as *const c_void, &mut info) } == 0 {
            return None;
        }
        if info.dli_sname.is_null() || info.dli_saddr != addr {
            return None;
        }
        Some(unsafe { CStr::from_ptr(info.dli_sname) }.to_owned())
    }

    fn last_error(&self) -> Option<String> {
        let err = unsafe { libc::dlerror() };
        if err.is_null() {
            None
        } else {
            Some(unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned())
        }
    }
}
