//! The normalized GPU report handed to callers.
//!
//! Whatever backend was selected (or none), callers only ever see a
//! [`GpuInfo`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::gpu::backend::{BackendKind, ComputeCapability};
use crate::gpu::probe::MemoryInfo;

/// Which library produced a [`GpuInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuLibrary {
    /// No usable GPU; figures describe system memory.
    Cpu,
    /// NVIDIA GPU found through NVML.
    #[serde(rename = "cuda")]
    Nvml,
    /// NVIDIA GPU found through the CUDA runtime.
    Cudart,
    /// AMD GPU found through ROCm SMI.
    Rocm,
}

impl GpuLibrary {
    /// Tag reported to callers (`"cpu"`, `"cuda"`, `"cudart"`, `"rocm"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            GpuLibrary::Cpu => "cpu",
            GpuLibrary::Nvml => "cuda",
            GpuLibrary::Cudart => "cudart",
            GpuLibrary::Rocm => "rocm",
        }
    }

    /// Environment variable the runtime of this library reads to restrict
    /// which devices it uses.
    pub fn visible_devices_var(&self) -> Option<&'static str> {
        match self {
            GpuLibrary::Cpu => None,
            GpuLibrary::Nvml | GpuLibrary::Cudart => Some("CUDA_VISIBLE_DEVICES"),
            GpuLibrary::Rocm => Some("ROCR_VISIBLE_DEVICES"),
        }
    }
}

impl From<BackendKind> for GpuLibrary {
    fn from(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Nvml => GpuLibrary::Nvml,
            BackendKind::Cudart => GpuLibrary::Cudart,
            BackendKind::Rocm => GpuLibrary::Rocm,
        }
    }
}

impl fmt::Display for GpuLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    /// Selected library, or `cpu`.
    pub library: GpuLibrary,

    /// CPU ISA variant for `cpu`, ROCm major version (`v6`) for `rocm`,
    /// empty otherwise.
    pub variant: String,

    /// Number of enumerated devices, excluded ones included.
    pub device_count: u32,

    /// Free bytes across all counted devices.
    pub free_memory: u64,

    /// Total bytes across all counted devices.
    pub total_memory: u64,

    /// Device indices that must not be used for compute (integrated GPUs).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_devices: Vec<u32>,

    /// Lowest compute capability across devices. `None` for `cpu`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_capability: Option<ComputeCapability>,
}

impl GpuInfo {
    /// Report for the CPU fallback.
    pub fn cpu(variant: impl Into<String>, memory: MemoryInfo) -> Self {
        Self {
            library: GpuLibrary::Cpu,
            variant: variant.into(),
            device_count: memory.count,
            free_memory: memory.free,
            total_memory: memory.total,
            excluded_devices: Vec::new(),
            compute_capability: None,
        }
    }

    /// Report for a selected GPU backend.
    pub fn gpu(
        kind: BackendKind,
        variant: String,
        memory: MemoryInfo,
        compute_capability: ComputeCapability,
    ) -> Self {
        Self {
            library: kind.into(),
            variant,
            device_count: memory.count,
            free_memory: memory.free,
            total_memory: memory.total,
            excluded_devices: memory.integrated_gpu.into_iter().collect(),
            compute_capability: Some(compute_capability),
        }
    }

    pub fn is_gpu(&self) -> bool {
        self.library != GpuLibrary::Cpu
    }

    /// Device indices that may be used for compute.
    pub fn usable_devices(&self) -> Vec<u32> {
        (0..self.device_count)
            .filter(|i| !self.excluded_devices.contains(i))
            .collect()
    }

    /// Visibility setting a launcher should pass to GPU worker processes.
    ///
    /// Returns the variable name and a comma-separated list of usable
    /// devices when some devices were excluded. A non-empty `user_value`
    /// always wins and yields `None`.
    pub fn visible_devices_env(&self, user_value: Option<&str>) -> Option<(&'static str, String)> {
        if self.excluded_devices.is_empty() {
            return None;
        }
        if user_value.is_some_and(|v| !v.is_empty()) {
            return None;
        }
        let var = self.library.visible_devices_var()?;
        let list = self
            .usable_devices()
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        Some((var, list))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rocm_with_igpu() -> GpuInfo {
        GpuInfo::gpu(
            BackendKind::Rocm,
            "v6".to_string(),
            MemoryInfo {
                count: 3,
                total: 48,
                free: 40,
                integrated_gpu: Some(1),
            },
            ComputeCapability::new(11, 0),
        )
    }

    #[test]
    fn test_library_tags() {
        assert_eq!(GpuLibrary::from(BackendKind::Nvml).as_str(), "cuda");
        assert_eq!(GpuLibrary::from(BackendKind::Cudart).to_string(), "cudart");
        assert_eq!(serde_json::to_string(&GpuLibrary::Nvml).unwrap(), "\"cuda\"");
        assert_eq!(serde_json::to_string(&GpuLibrary::Rocm).unwrap(), "\"rocm\"");
    }

    #[test]
    fn test_cpu_report() {
        let info = GpuInfo::cpu(
            "avx2",
            MemoryInfo {
                count: 1,
                total: 64,
                free: 32,
                integrated_gpu: None,
            },
        );
        assert!(!info.is_gpu());
        assert_eq!(info.device_count, 1);
        assert_eq!(info.variant, "avx2");
        assert_eq!(info.visible_devices_env(None), None);
    }

    #[test]
    fn test_visible_devices_skips_excluded() {
        let info = rocm_with_igpu();
        assert_eq!(info.excluded_devices, vec![1]);
        assert_eq!(info.usable_devices(), vec![0, 2]);
        assert_eq!(
            info.visible_devices_env(None),
            Some(("ROCR_VISIBLE_DEVICES", "0,2".to_string()))
        );
        assert_eq!(
            info.visible_devices_env(Some("")),
            Some(("ROCR_VISIBLE_DEVICES", "0,2".to_string()))
        );
    }

    #[test]
    fn test_user_visibility_setting_wins() {
        let info = rocm_with_igpu();
        assert_eq!(info.visible_devices_env(Some("2")), None);
    }
}
