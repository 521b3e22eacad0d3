//! Backend selection and the process-lifetime handle cache.
//!
//! Backends are tried in [`BackendKind::PRIORITY`] order. Each one is
//! located and bound the first time a query reaches it and the outcome is
//! kept for the life of the [`Detector`]: a bound handle, an absent library
//! or a rejection by the capability floor. All vendor calls happen with the
//! state lock held.

use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ProbeConfig};
use crate::ffi::LibraryLoader;
use crate::gpu::backend::{Backend, BackendKind, ComputeCapability};
use crate::gpu::device::GpuInfo;
use crate::gpu::policy::OverheadPolicy;
use crate::gpu::probe::{self, MemoryInfo};
use crate::host::{HostProbe, SystemHost};

/// Locates and binds a backend library.
pub trait BackendLoader: Send + Sync {
    /// Bind `kind`, or `None` when no candidate library could be bound.
    fn load(&self, kind: BackendKind) -> Option<Box<dyn Backend>>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VramError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no GPU detected")]
    NoGpu,
}

enum Slot {
    Unprobed,
    Absent,
    Bound(Box<dyn Backend>),
    Rejected,
}

#[derive(Clone)]
struct CpuGate {
    variant: String,
    gpu_allowed: bool,
}

struct DetectorState {
    cpu: Option<CpuGate>,
    slots: [Slot; 3],
}

/// What a bound backend's queries decided.
enum Verdict {
    Select(GpuInfo),
    Skip,
    Reject,
}

/// GPU detector with its own backend cache.
///
/// Most callers use the process-wide instance through [`crate::gpu::probe`]
/// and [`crate::gpu::available_vram`].
pub struct Detector {
    config: ProbeConfig,
    host: Box<dyn HostProbe>,
    loader: Box<dyn BackendLoader>,
    state: Mutex<DetectorState>,
}

impl Detector {
    pub fn new(
        config: ProbeConfig,
        host: Box<dyn HostProbe>,
        loader: Box<dyn BackendLoader>,
    ) -> Self {
        Self {
            config,
            host,
            loader,
            state: Mutex::new(DetectorState {
                cpu: None,
                slots: [Slot::Unprobed, Slot::Unprobed, Slot::Unprobed],
            }),
        }
    }

    /// Detector for this machine, loading vendor libraries from disk.
    pub fn from_config(config: ProbeConfig) -> Self {
        let loader = LibraryLoader::new(&config);
        Self::new(config, Box::new(SystemHost), Box::new(loader))
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, DetectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Detect the best usable GPU backend, falling back to the CPU.
    pub fn probe(&self) -> GpuInfo {
        let mut state = self.lock();

        let gate = self.cpu_gate(&mut state);
        if gate.gpu_allowed {
            for kind in BackendKind::PRIORITY {
                match self.probe_backend(&mut state, kind) {
                    Some(Verdict::Select(info)) => return info,
                    Some(Verdict::Reject) => break,
                    Some(Verdict::Skip) | None => continue,
                }
            }
        }

        self.cpu_info(gate.variant)
    }

    /// Usable VRAM in bytes after the overhead reserve.
    ///
    /// A user override is returned as-is without probing. A GPU reporting
    /// no free memory counts as no GPU.
    pub fn available_vram(&self) -> Result<u64, VramError> {
        if let Some(limit) = self.config.max_vram_override()? {
            info!(limit, "Using VRAM override");
            return Ok(limit);
        }

        let info = self.probe();
        if !info.is_gpu() {
            return Err(VramError::NoGpu);
        }
        if info.free_memory == 0 {
            info!(library = %info.library, "GPU reports no free memory");
            return Err(VramError::NoGpu);
        }

        let policy = OverheadPolicy::from_config(&self.config);
        let reserved = policy.reserved_overhead(info.free_memory, info.device_count);
        let usable = info.free_memory.saturating_sub(reserved);
        debug!(
            library = %info.library,
            free = info.free_memory,
            reserved,
            usable,
            "Usable VRAM"
        );
        Ok(usable)
    }

    fn cpu_gate(&self, state: &mut DetectorState) -> CpuGate {
        state
            .cpu
            .get_or_insert_with(|| {
                let variant = self.host.cpu_variant();
                let gpu_allowed = !self.host.gpu_requires_avx() || !variant.is_empty();
                if !gpu_allowed {
                    warn!("CPU does not have AVX or AVX2, disabling GPU support");
                }
                CpuGate {
                    variant,
                    gpu_allowed,
                }
            })
            .clone()
    }

    /// Query `kind`, binding it first if no query has reached it yet.
    /// Returns `None` when the library is absent.
    fn probe_backend(&self, state: &mut DetectorState, kind: BackendKind) -> Option<Verdict> {
        let slot = &mut state.slots[kind.index()];

        if matches!(slot, Slot::Unprobed) {
            *slot = match self.loader.load(kind) {
                Some(backend) => Slot::Bound(backend),
                None => {
                    debug!(backend = %kind, "No usable library found");
                    Slot::Absent
                }
            };
        }

        let verdict = match slot {
            Slot::Unprobed | Slot::Absent => return None,
            Slot::Rejected => return Some(Verdict::Reject),
            Slot::Bound(backend) => self.evaluate(&**backend),
        };

        if matches!(verdict, Verdict::Reject) {
            // Dropping the handle shuts the library down.
            *slot = Slot::Rejected;
        }
        Some(verdict)
    }

    fn evaluate(&self, backend: &dyn Backend) -> Verdict {
        let kind = backend.kind();

        let memory = match probe::memory(backend, self.config.verbose) {
            Ok(memory) if memory.count > 0 => memory,
            Ok(_) => {
                info!(backend = %kind, "No devices reported");
                return Verdict::Skip;
            }
            Err(e) => {
                info!(backend = %kind, error = %e, "Memory query failed");
                return Verdict::Skip;
            }
        };

        if kind == BackendKind::Rocm && memory.count == 1 && memory.integrated_gpu.is_some() {
            info!("Only an integrated AMD GPU was found, which is not supported");
            return Verdict::Skip;
        }

        let cc = match probe::compute_capability(backend) {
            Ok(cc) => cc,
            Err(e) => {
                info!(backend = %kind, error = %e, "Compute capability query failed");
                return Verdict::Skip;
            }
        };

        if !self.meets_floor(kind, cc) {
            return Verdict::Reject;
        }

        let info = GpuInfo::gpu(kind, backend.variant(), memory, cc);
        info!(
            library = %info.library,
            variant = %info.variant,
            devices = info.device_count,
            total = info.total_memory,
            free = info.free_memory,
            compute = %cc,
            "GPU detected"
        );
        if !info.excluded_devices.is_empty() {
            info!(excluded = ?info.excluded_devices, "Excluding integrated GPU from compute");
        }
        Verdict::Select(info)
    }

    fn meets_floor(&self, kind: BackendKind, cc: ComputeCapability) -> bool {
        if cc < self.config.compute_min {
            warn!(
                backend = %kind,
                detected = %cc,
                minimum = %self.config.compute_min,
                "GPU compute capability too old, falling back to CPU"
            );
            return false;
        }
        if kind == BackendKind::Rocm && cc.major < self.config.rocm_gfx_min_major {
            warn!(
                detected = %cc,
                minimum_major = self.config.rocm_gfx_min_major,
                "AMD GPU too old, falling back to CPU"
            );
            return false;
        }
        true
    }

    fn cpu_info(&self, variant: String) -> GpuInfo {
        let memory = match self.host.cpu_memory() {
            Ok(memory) => memory,
            Err(e) => {
                warn!(error = %e, "Error looking up CPU memory");
                MemoryInfo::default()
            }
        };
        info!(
            variant = %variant,
            total = memory.total,
            free = memory.free,
            "No GPU detected, using CPU"
        );
        GpuInfo::cpu(variant, memory)
    }
}
