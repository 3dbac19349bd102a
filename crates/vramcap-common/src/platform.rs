/// Environment variable the dynamic loader reads for preloaded libraries.
pub const PRELOAD_ENV: &str = "LD_PRELOAD";

/// File name of the interposition library produced by `vramcap-interpose`.
pub const INTERPOSE_LIBRARY: &str = "libvramcap_interpose.so";

/// Candidate file names of the CUDA driver library.
pub fn cuda_driver_names() -> &'static [&'static str] {
    &["libcuda.so.1", "libcuda.so"]
}

/// Candidate file names of the NVML management library.
pub fn nvml_names() -> &'static [&'static str] {
    &["libnvidia-ml.so.1", "libnvidia-ml.so"]
}

/// Directories searched for the interposition library, in order.
///
/// The directory of the running executable comes first so a freshly built
/// `target/<profile>/` tree works without installation.
pub fn interpose_search_dirs() -> Vec<std::path::PathBuf> {
    let mut dirs = Vec::new();
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.to_path_buf()))
    {
        dirs.push(dir);
    }
    dirs.push(std::path::PathBuf::from("/usr/lib/vramcap"));
    dirs.push(std::path::PathBuf::from("/usr/local/lib/vramcap"));
    dirs
}
