//! Shared library discovery.
//!
//! Expands glob patterns for a vendor management library, follows symlinks
//! to the real file and drops duplicates, so each physical library is tried
//! at most once by the binder.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::gpu::backend::BackendKind;

/// Maximum number of symlinks followed for a single match.
pub const MAX_LINK_HOPS: usize = 32;

const NVML_LINUX_GLOBS: &[&str] = &[
    "/usr/local/cuda/lib64/libnvidia-ml.so*",
    "/usr/lib/x86_64-linux-gnu/nvidia/current/libnvidia-ml.so*",
    "/usr/lib/x86_64-linux-gnu/libnvidia-ml.so*",
    "/usr/lib/wsl/lib/libnvidia-ml.so*",
    "/usr/lib/wsl/drivers/*/libnvidia-ml.so*",
    "/opt/cuda/lib64/libnvidia-ml.so*",
    "/usr/lib*/libnvidia-ml.so*",
    "/usr/lib/aarch64-linux-gnu/nvidia/current/libnvidia-ml.so*",
    "/usr/lib/aarch64-linux-gnu/libnvidia-ml.so*",
    "/usr/local/lib*/libnvidia-ml.so*",
    "/opt/cuda/targets/x86_64-linux/lib/stubs/libnvidia-ml.so*",
];

const NVML_WINDOWS_GLOBS: &[&str] = &["c:\\Windows\\System32\\nvml.dll"];

const CUDART_LINUX_GLOBS: &[&str] = &[
    "/usr/local/cuda/lib64/libcudart.so*",
    "/usr/lib/x86_64-linux-gnu/nvidia/current/libcudart.so*",
    "/usr/lib/x86_64-linux-gnu/libcudart.so*",
    "/usr/lib/wsl/lib/libcudart.so*",
    "/usr/lib/wsl/drivers/*/libcudart.so*",
    "/opt/cuda/lib64/libcudart.so*",
    "/usr/local/cuda*/targets/aarch64-linux/lib/libcudart.so*",
    "/usr/lib/aarch64-linux-gnu/nvidia/current/libcudart.so*",
    "/usr/lib/aarch64-linux-gnu/libcudart.so*",
    "/usr/local/cuda/lib*/libcudart.so*",
    "/usr/lib*/libcudart.so*",
    "/usr/local/lib*/libcudart.so*",
];

const ROCM_LINUX_GLOBS: &[&str] = &["/opt/rocm*/lib*/librocm_smi64.so*"];

/// Target platform for library naming and default install locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Windows,
    Other,
}

impl Platform {
    /// The platform this binary was compiled for.
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else {
            Platform::Other
        }
    }

    /// Environment variable holding the dynamic library search path.
    pub fn search_path_var(&self) -> Option<&'static str> {
        match self {
            Platform::Linux => Some("LD_LIBRARY_PATH"),
            Platform::Windows => Some("PATH"),
            Platform::Other => None,
        }
    }

    /// File name prefix of the management library for `kind`, if the
    /// backend is supported on this platform.
    pub fn library_name(&self, kind: BackendKind) -> Option<&'static str> {
        match (self, kind) {
            (Platform::Linux, BackendKind::Nvml) => Some("libnvidia-ml.so"),
            (Platform::Linux, BackendKind::Cudart) => Some("libcudart.so"),
            (Platform::Linux, BackendKind::Rocm) => Some("librocm_smi64.so"),
            (Platform::Windows, BackendKind::Nvml) => Some("nvml.dll"),
            _ => None,
        }
    }

    /// Default install-location globs for `kind`.
    pub fn default_globs(&self, kind: BackendKind) -> &'static [&'static str] {
        match (self, kind) {
            (Platform::Linux, BackendKind::Nvml) => NVML_LINUX_GLOBS,
            (Platform::Linux, BackendKind::Cudart) => CUDART_LINUX_GLOBS,
            (Platform::Linux, BackendKind::Rocm) => ROCM_LINUX_GLOBS,
            (Platform::Windows, BackendKind::Nvml) => NVML_WINDOWS_GLOBS,
            _ => &[],
        }
    }
}

/// Build the full pattern list for a backend: platform defaults first, then
/// one `<dir>/<base_name>*` pattern per entry of the library search path.
///
/// `search_path` is the raw value of `LD_LIBRARY_PATH` (or `PATH` on
/// Windows). Empty entries are skipped and relative entries are resolved
/// against the working directory.
pub fn search_patterns(
    base_name: &str,
    defaults: &[&str],
    search_path: Option<&OsStr>,
) -> Vec<String> {
    let mut patterns: Vec<String> = defaults.iter().map(|p| p.to_string()).collect();

    if let Some(search_path) = search_path {
        for dir in std::env::split_paths(search_path) {
            if dir.as_os_str().is_empty() {
                continue;
            }
            let dir = if dir.is_absolute() {
                dir
            } else {
                match std::env::current_dir() {
                    Ok(cwd) => cwd.join(dir),
                    Err(_) => continue,
                }
            };
            let escaped = glob::Pattern::escape(&dir.to_string_lossy());
            let pattern = Path::new(&escaped).join(format!("{base_name}*"));
            patterns.push(pattern.to_string_lossy().into_owned());
        }
    }

    patterns
}

/// Find candidate library files for `base_name`.
///
/// Returns resolved paths in pattern order, then match order, without
/// duplicates. An empty result means the library is not installed; glob
/// errors only skip the offending pattern or entry.
pub fn find_libraries(base_name: &str, patterns: &[String]) -> Vec<PathBuf> {
    info!(library = base_name, "Searching for GPU management library");
    debug!(?patterns, "GPU management search paths");

    let mut seen = HashSet::new();
    let mut found = Vec::new();

    for pattern in patterns {
        let matches = match glob::glob(pattern) {
            Ok(matches) => matches,
            Err(e) => {
                debug!(pattern = %pattern, error = %e, "Skipping malformed search pattern");
                continue;
            }
        };

        for entry in matches.flatten() {
            let Some(resolved) = resolve_links(&entry) else {
                debug!(path = %entry.display(), "Symlink chain too long, skipping");
                continue;
            };
            if seen.insert(resolved.clone()) {
                found.push(resolved);
            }
        }
    }

    info!(library = base_name, paths = ?found, "Discovered GPU libraries");
    found
}

/// Follow `path` through symlinks until a non-link is reached, then
/// canonicalize it so directory symlinks (`/lib -> usr/lib`) collapse too.
///
/// Relative link targets are joined to the directory of the link that holds
/// them. Returns `None` when the chain is longer than [`MAX_LINK_HOPS`],
/// which covers link cycles. A path that cannot be canonicalized (dangling
/// target) is returned as resolved by the hop loop.
pub fn resolve_links(path: &Path) -> Option<PathBuf> {
    let mut current = path.to_path_buf();

    for _ in 0..=MAX_LINK_HOPS {
        let target = match fs::read_link(&current) {
            Ok(target) => target,
            Err(_) => return Some(fs::canonicalize(&current).unwrap_or(current)),
        };
        current = if target.is_absolute() {
            target
        } else {
            match current.parent() {
                Some(dir) => dir.join(target),
                None => target,
            }
        };
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_names() {
        assert_eq!(
            Platform::Linux.library_name(BackendKind::Nvml),
            Some("libnvidia-ml.so")
        );
        assert_eq!(Platform::Windows.library_name(BackendKind::Rocm), None);
        assert!(Platform::Other.default_globs(BackendKind::Cudart).is_empty());
    }

    #[test]
    fn test_search_patterns_skip_empty_entries() {
        let patterns = search_patterns(
            "libcudart.so",
            &["/opt/cuda/lib64/libcudart.so*"],
            Some(OsStr::new("")),
        );
        assert_eq!(patterns, vec!["/opt/cuda/lib64/libcudart.so*".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_search_patterns_append_search_path() {
        let patterns = search_patterns("libnvidia-ml.so", &[], Some(OsStr::new("/a/lib::/b")));
        assert_eq!(
            patterns,
            vec![
                "/a/lib/libnvidia-ml.so*".to_string(),
                "/b/libnvidia-ml.so*".to_string(),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_search_patterns_escape_metacharacters() {
        let patterns = search_patterns("librocm_smi64.so", &[], Some(OsStr::new("/opt/[x]")));
        assert_eq!(patterns, vec!["/opt/[[]x[]]/librocm_smi64.so*".to_string()]);
    }

    #[test]
    fn test_malformed_pattern_is_ignored() {
        let found = find_libraries("libnvidia-ml.so", &["/tmp/[".to_string()]);
        assert!(found.is_empty());
    }
}
