//! GPU backend selection and VRAM accounting.
//!
//! - [`backend`]: the trait every vendor binding implements
//! - [`probe`]: memory and compute capability aggregation over a backend
//! - [`detector`]: priority selection, capability floors and the handle cache
//! - [`device`]: the normalized [`GpuInfo`] report
//! - [`policy`]: VRAM overhead reserve
//!
//! [`probe()`] and [`available_vram()`] go through one detector shared by
//! the whole process. Vendor libraries are bound at most once.

pub mod backend;
pub mod detector;
pub mod device;
pub mod policy;
pub mod probe;

use std::sync::OnceLock;

use tracing::warn;

use crate::config::ProbeConfig;

pub use backend::{Backend, BackendKind, ComputeCapability, QueryError};
pub use detector::{BackendLoader, Detector, VramError};
pub use device::{GpuInfo, GpuLibrary};
pub use policy::OverheadPolicy;

static DETECTOR: OnceLock<Detector> = OnceLock::new();

/// Install the process-wide detector built from `config`.
///
/// Only the first call (or the first query) decides the configuration.
pub fn init(config: ProbeConfig) -> &'static Detector {
    let mut installed = false;
    let detector = DETECTOR.get_or_init(|| {
        installed = true;
        Detector::from_config(config)
    });
    if !installed {
        warn!("GPU detector already initialized, ignoring new configuration");
    }
    detector
}

/// The process-wide detector, configured from the environment on first use.
pub fn detector() -> &'static Detector {
    DETECTOR.get_or_init(|| Detector::from_config(ProbeConfig::from_env()))
}

/// Detect the best usable GPU backend, falling back to the CPU.
pub fn probe() -> GpuInfo {
    detector().probe()
}

/// Usable VRAM in bytes, or why there is none.
pub fn available_vram() -> Result<u64, VramError> {
    detector().available_vram()
}
