//! AMD GPU facts read from sysfs.
//!
//! ROCm SMI does not report the GPU generation, so it is taken from the KFD
//! topology instead: every node directory has a `properties` file with a
//! `gfx_target_version` line (0 for CPU nodes).

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default KFD topology directory.
pub const KFD_TOPOLOGY: &str = "/sys/class/kfd/kfd/topology/nodes";

/// Default amdgpu kernel module version file.
pub const AMDGPU_VERSION_FILE: &str = "/sys/module/amdgpu/version";

/// A GPU ISA version such as gfx1030.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GfxVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl GfxVersion {
    /// Decode a KFD `gfx_target_version` value (`major*10000 + minor*100 + patch`).
    pub fn from_target_version(value: u32) -> Self {
        Self {
            major: value / 10000,
            minor: (value / 100) % 100,
            patch: value % 100,
        }
    }
}

impl fmt::Display for GfxVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gfx{}{}{:x}", self.major, self.minor, self.patch)
    }
}

/// Parse the `gfx_target_version` out of one node's properties file.
///
/// Returns `None` for CPU nodes and for files without the property.
pub fn parse_node_properties(contents: &str) -> Option<GfxVersion> {
    contents.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if parts.next()? != "gfx_target_version" {
            return None;
        }
        let value: u32 = parts.next()?.parse().ok()?;
        (value != 0).then(|| GfxVersion::from_target_version(value))
    })
}

/// GFX versions of every GPU node under `topology`, in node order.
///
/// A missing or unreadable topology yields an empty list.
pub fn gfx_versions(topology: &Path) -> Vec<GfxVersion> {
    let entries = match fs::read_dir(topology) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(path = %topology.display(), error = %e, "KFD topology not readable");
            return Vec::new();
        }
    };

    let mut nodes: Vec<(u32, GfxVersion)> = entries
        .flatten()
        .filter_map(|entry| {
            let node: u32 = entry.file_name().to_str()?.parse().ok()?;
            let contents = fs::read_to_string(entry.path().join("properties")).ok()?;
            Some((node, parse_node_properties(&contents)?))
        })
        .collect();
    nodes.sort_by_key(|(node, _)| *node);

    nodes.into_iter().map(|(_, gfx)| gfx).collect()
}

/// Version of the loaded amdgpu kernel driver, if the module exposes one.
pub fn driver_version(version_file: &Path) -> Option<String> {
    let version = fs::read_to_string(version_file).ok()?;
    let version = version.trim();
    (!version.is_empty()).then(|| version.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_target_version() {
        assert_eq!(
            GfxVersion::from_target_version(90008),
            GfxVersion {
                major: 9,
                minor: 0,
                patch: 8
            }
        );
        assert_eq!(GfxVersion::from_target_version(100300).to_string(), "gfx1030");
        assert_eq!(GfxVersion::from_target_version(90010).to_string(), "gfx90a");
    }

    #[test]
    fn test_parse_properties() {
        let gpu = "cpu_cores_count 0\nsimd_count 256\ngfx_target_version 110000\n";
        assert_eq!(
            parse_node_properties(gpu),
            Some(GfxVersion::from_target_version(110000))
        );

        let cpu = "cpu_cores_count 16\ngfx_target_version 0\n";
        assert_eq!(parse_node_properties(cpu), None);
        assert_eq!(parse_node_properties("simd_count 4\n"), None);
    }

    #[test]
    fn test_gfx_versions_sorted_by_node() {
        let dir = tempfile::tempdir().unwrap();
        for (node, props) in [
            ("10", "gfx_target_version 90008\n"),
            ("0", "gfx_target_version 0\n"),
            ("2", "gfx_target_version 100300\n"),
        ] {
            let node_dir = dir.path().join(node);
            fs::create_dir(&node_dir).unwrap();
            fs::write(node_dir.join("properties"), props).unwrap();
        }

        let versions = gfx_versions(dir.path());
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].to_string(), "gfx1030");
        assert_eq!(versions[1].to_string(), "gfx908");
    }

    #[test]
    fn test_missing_topology() {
        assert!(gfx_versions(Path::new("/nonexistent/kfd/topology")).is_empty());
        assert_eq!(driver_version(Path::new("/nonexistent/amdgpu/version")), None);
    }
}
