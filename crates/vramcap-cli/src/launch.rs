//! `vramcap run`: start a command with the interposition library preloaded.

use std::convert::Infallible;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context};
use tracing::debug;

use vramcap_common::platform::{self, INTERPOSE_LIBRARY, PRELOAD_ENV};
use vramcap_core::config::{CONFIG_ENV, ENFORCEMENT_ENV, FRACTION_ENV};
use vramcap_core::QuotaPolicy;

/// Find the interposition library: the explicit path if given, otherwise the
/// first hit in the platform search directories.
pub fn locate_library(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        bail!("interpose library not found at {}", path.display());
    }

    platform::interpose_search_dirs()
        .into_iter()
        .map(|dir| dir.join(INTERPOSE_LIBRARY))
        .find(|candidate| candidate.is_file())
        .with_context(|| format!("{} not found; pass --library", INTERPOSE_LIBRARY))
}

/// `LD_PRELOAD` value with `library` appended after the existing entries.
/// Earlier copies of the same path are dropped so nested launches do not
/// stack it.
///
/// The `dlsym` hook resolves `RTLD_NEXT` relative to this library, so it must
/// come last: objects preloaded after it would get their own wrappers back.
pub fn preload_value(library: &Path, existing: Option<&str>) -> String {
    let library = library.to_string_lossy().into_owned();
    let mut entries: Vec<String> = existing
        .unwrap_or_default()
        .split([':', ' '])
        .filter(|entry| !entry.is_empty() && *entry != library)
        .map(str::to_string)
        .collect();
    entries.push(library);
    entries.join(":")
}

/// Environment variables the child needs so the preloaded library sees the
/// same policy the launcher validated.
pub fn child_env(
    library: &Path,
    policy: &QuotaPolicy,
    config: Option<&Path>,
    existing_preload: Option<&str>,
) -> Vec<(String, String)> {
    let mut env = vec![
        (PRELOAD_ENV.to_string(), preload_value(library, existing_preload)),
        (FRACTION_ENV.to_string(), policy.reserved_fraction().to_string()),
        (ENFORCEMENT_ENV.to_string(), policy.enforcement().to_string()),
    ];
    if let Some(config) = config {
        env.push((CONFIG_ENV.to_string(), config.to_string_lossy().into_owned()));
    }
    env
}

/// Replace the current process with `command`. Only returns on failure.
pub fn exec(command: &[String], env: &[(String, String)]) -> anyhow::Result<Infallible> {
    let (program, args) = command.split_first().context("no command given")?;
    debug!("exec {} {:?}", program, args);

    let err = Command::new(program)
        .args(args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .exec();
    Err(err).with_context(|| format!("failed to execute {}", program))
}
