//! Locating the `cryptsetup` binary on the host.

use fastluks_core::config::FastluksConfig;
use fastluks_core::error::{LuksError, LuksResult};
use log::debug;
use std::env;
use std::path::{Path, PathBuf};

/// Default locations probed for a `cryptsetup` binary.
pub const DEFAULT_CRYPTSETUP_PATHS: &[&str] = &[
    "/sbin/cryptsetup",
    "/usr/sbin/cryptsetup",
    "/usr/local/sbin/cryptsetup",
    "/bin/cryptsetup",
    "/usr/bin/cryptsetup",
];

/// Resolve the binary named in the configuration, or search the default
/// locations and then `$PATH`.
pub fn discover_cryptsetup(configured: Option<&str>) -> LuksResult<PathBuf> {
    if let Some(path) = configured {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(path);
        }
        return Err(LuksError::InvalidConfig(format!(
            "cryptsetup not found at {}",
            path.display()
        )));
    }

    let path_dirs = env::var_os("PATH")
        .map(|value| env::split_paths(&value).collect::<Vec<_>>())
        .unwrap_or_default();
    let candidates = DEFAULT_CRYPTSETUP_PATHS
        .iter()
        .map(PathBuf::from)
        .chain(path_dirs.into_iter().map(|dir| dir.join("cryptsetup")));

    for candidate in candidates {
        if candidate.is_file() {
            debug!("using cryptsetup at {}", candidate.display());
            return Ok(candidate);
        }
    }
    Err(LuksError::InvalidConfig(format!(
        "unable to locate cryptsetup; install it or set binaries.cryptsetup (tried {:?} and $PATH)",
        DEFAULT_CRYPTSETUP_PATHS
    )))
}

/// Copy of `config` with `binaries.cryptsetup` pinned to a binary that exists.
pub fn with_discovered_binaries(config: &FastluksConfig) -> LuksResult<FastluksConfig> {
    let path = discover_cryptsetup(config.binaries.cryptsetup.as_deref())?;
    let mut resolved = config.clone();
    resolved.binaries.cryptsetup = Some(path_string(&path));
    Ok(resolved)
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
