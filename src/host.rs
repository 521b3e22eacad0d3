//! Host CPU facts: ISA variant and system memory.
//!
//! The detector consumes these through [`HostProbe`] so tests can supply a
//! fake host.

use sysinfo::System;
use tracing::debug;

use crate::gpu::backend::QueryError;
use crate::gpu::probe::MemoryInfo;

/// CPU-side collaborators of the detector.
pub trait HostProbe: Send + Sync {
    /// Best supported CPU variant. Empty means no usable SIMD extension.
    fn cpu_variant(&self) -> String;

    /// System memory, reported as a single device.
    fn cpu_memory(&self) -> Result<MemoryInfo, QueryError>;

    /// Whether an empty [`cpu_variant`](HostProbe::cpu_variant) disables
    /// GPU use.
    fn gpu_requires_avx(&self) -> bool {
        gpu_requires_avx()
    }
}

/// The machine this process runs on.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl HostProbe for SystemHost {
    fn cpu_variant(&self) -> String {
        cpu_variant()
    }

    fn cpu_memory(&self) -> Result<MemoryInfo, QueryError> {
        let mut sys = System::new();
        sys.refresh_memory();

        let total = sys.total_memory();
        if total == 0 {
            return Err(QueryError::Host("system memory size unavailable".to_string()));
        }
        let free = sys.available_memory().min(total);
        debug!(total, free, "CPU memory");

        Ok(MemoryInfo {
            count: 1,
            total,
            free,
            integrated_gpu: None,
        })
    }
}

/// `"avx2"`, `"avx"` or `""` on x86_64; always `""` elsewhere.
pub fn cpu_variant() -> String {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") {
            return "avx2".to_string();
        }
        if is_x86_feature_detected!("avx") {
            return "avx".to_string();
        }
    }
    String::new()
}

/// Whether GPU inference needs AVX on this architecture.
pub fn gpu_requires_avx() -> bool {
    cfg!(target_arch = "x86_64")
}
