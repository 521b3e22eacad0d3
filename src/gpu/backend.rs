//! Backend abstraction shared by the vendor bindings.
//!
//! A [`Backend`] is a bound, initialized vendor library. The probes in
//! [`crate::gpu::probe`] only talk to this trait, so the NVML, CUDA runtime
//! and ROCm SMI handles all go through the same aggregation code.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which vendor management library a handle is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// NVIDIA Management Library (`libnvidia-ml`, `nvml.dll`).
    Nvml,
    /// CUDA runtime (`libcudart`), used on hosts without NVML such as Jetson.
    Cudart,
    /// AMD ROCm System Management Interface (`librocm_smi64`).
    Rocm,
}

impl BackendKind {
    /// Probe order. Earlier backends win.
    pub const PRIORITY: [BackendKind; 3] =
        [BackendKind::Nvml, BackendKind::Cudart, BackendKind::Rocm];

    /// Slot index in the detector cache.
    pub fn index(&self) -> usize {
        match self {
            BackendKind::Nvml => 0,
            BackendKind::Cudart => 1,
            BackendKind::Rocm => 2,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Nvml => write!(f, "nvml"),
            BackendKind::Cudart => write!(f, "cudart"),
            BackendKind::Rocm => write!(f, "rocm"),
        }
    }
}

/// A vendor-defined {major, minor} feature level.
///
/// Ordering is lexicographic (major first), so `6.1 < 6.9 < 7.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComputeCapability {
    pub major: u32,
    pub minor: u32,
}

impl ComputeCapability {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ComputeCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Memory reported by a single device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceMemory {
    /// Free bytes.
    pub free: u64,
    /// Total bytes.
    pub total: u64,
    /// The device shares system memory with the CPU. Its reported VRAM is
    /// not meaningful and is left out of the totals.
    pub integrated: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("unable to get device count: {call} returned {status}")]
    DeviceCount { call: &'static str, status: i32 },

    #[error("device {index} query failure: {call} returned {status}")]
    Device {
        index: u32,
        call: &'static str,
        status: i32,
    },

    #[error("device {index}: {reason}")]
    DeviceInfo { index: u32, reason: String },

    #[error("no devices reported")]
    NoDevices,

    #[error("host memory query failed: {0}")]
    Host(String),
}

/// A bound and initialized vendor management library.
///
/// Implementations are only constructed after every required symbol
/// resolved and the backend's init call succeeded.
pub trait Backend: Send {
    /// The library this handle is bound to.
    fn kind(&self) -> BackendKind;

    /// Number of devices visible to the library.
    fn device_count(&self) -> Result<u32, QueryError>;

    /// Memory of device `index`.
    fn device_memory(&self, index: u32) -> Result<DeviceMemory, QueryError>;

    /// Compute capability of device `index`.
    fn device_capability(&self, index: u32) -> Result<ComputeCapability, QueryError>;

    /// Log descriptive details about device `index` (name, serial, ...).
    ///
    /// Only called in verbose mode. Must never fail.
    fn log_device_details(&self, _index: u32) {}

    /// Backend-specific variant string reported to callers (e.g. the ROCm
    /// major version). Empty when not applicable.
    fn variant(&self) -> String {
        String::new()
    }
}
