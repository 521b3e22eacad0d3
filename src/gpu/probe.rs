//! Device enumeration over a bound backend.
//!
//! Both probes walk devices `0..count` sequentially. A failure on any device
//! aborts the whole query: totals are all-or-nothing.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::gpu::backend::{Backend, ComputeCapability, QueryError};

/// Aggregate memory snapshot across all devices of one backend (or the CPU).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemoryInfo {
    /// Number of devices enumerated, integrated GPUs included.
    pub count: u32,
    /// Total bytes.
    pub total: u64,
    /// Free bytes.
    pub free: u64,
    /// Index of an integrated GPU, if one was seen.
    pub integrated_gpu: Option<u32>,
}

impl MemoryInfo {
    /// Bytes in use (driver overhead included).
    pub fn used(&self) -> u64 {
        self.total.saturating_sub(self.free)
    }
}

/// Sum free and total memory across every device of `backend`.
pub fn memory(backend: &dyn Backend, verbose: bool) -> Result<MemoryInfo, QueryError> {
    let count = backend.device_count()?;
    let mut info = MemoryInfo {
        count,
        ..Default::default()
    };

    for index in 0..count {
        let mem = backend.device_memory(index)?;

        if verbose {
            backend.log_device_details(index);
        }

        if mem.integrated {
            debug!(backend = %backend.kind(), index, "Integrated GPU, excluding its memory");
            info.integrated_gpu = Some(index);
            continue;
        }

        debug!(
            backend = %backend.kind(),
            index,
            total = mem.total,
            free = mem.free,
            "Device memory"
        );
        info.total += mem.total;
        info.free += mem.free;
    }

    Ok(info)
}

/// Lowest compute capability across every device of `backend`.
///
/// The weakest device gates the whole backend.
pub fn compute_capability(backend: &dyn Backend) -> Result<ComputeCapability, QueryError> {
    let count = backend.device_count()?;
    let mut lowest: Option<ComputeCapability> = None;

    for index in 0..count {
        let cc = backend.device_capability(index)?;
        lowest = Some(match lowest {
            Some(current) => current.min(cc),
            None => cc,
        });
    }

    lowest.ok_or(QueryError::NoDevices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::backend::{BackendKind, DeviceMemory};

    type FakeDevice = Result<(DeviceMemory, ComputeCapability), i32>;

    struct FakeBackend {
        devices: Vec<FakeDevice>,
    }

    impl Backend for FakeBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Nvml
        }

        fn device_count(&self) -> Result<u32, QueryError> {
            Ok(self.devices.len() as u32)
        }

        fn device_memory(&self, index: u32) -> Result<DeviceMemory, QueryError> {
            match &self.devices[index as usize] {
                Ok((mem, _)) => Ok(*mem),
                Err(status) => Err(QueryError::Device {
                    index,
                    call: "fakeMemory",
                    status: *status,
                }),
            }
        }

        fn device_capability(&self, index: u32) -> Result<ComputeCapability, QueryError> {
            match &self.devices[index as usize] {
                Ok((_, cc)) => Ok(*cc),
                Err(status) => Err(QueryError::Device {
                    index,
                    call: "fakeCapability",
                    status: *status,
                }),
            }
        }
    }

    fn device(free: u64, total: u64, major: u32, minor: u32) -> FakeDevice {
        Ok((
            DeviceMemory {
                free,
                total,
                integrated: false,
            },
            ComputeCapability::new(major, minor),
        ))
    }

    #[test]
    fn test_memory_is_summed() {
        let backend = FakeBackend {
            devices: vec![device(1, 10, 7, 5), device(2, 20, 6, 1), device(3, 30, 7, 0)],
        };
        let info = memory(&backend, false).unwrap();
        assert_eq!(info.count, 3);
        assert_eq!(info.free, 6);
        assert_eq!(info.total, 60);
        assert_eq!(info.used(), 54);
        assert_eq!(info.integrated_gpu, None);
    }

    #[test]
    fn test_memory_failure_is_all_or_nothing() {
        let backend = FakeBackend {
            devices: vec![device(1, 10, 7, 5), Err(999), device(3, 30, 7, 0)],
        };
        let err = memory(&backend, true).unwrap_err();
        assert_eq!(
            err,
            QueryError::Device {
                index: 1,
                call: "fakeMemory",
                status: 999
            }
        );
    }

    #[test]
    fn test_integrated_gpu_is_counted_but_not_summed() {
        let backend = FakeBackend {
            devices: vec![
                device(8, 16, 9, 0),
                Ok((
                    DeviceMemory {
                        free: 512,
                        total: 512,
                        integrated: true,
                    },
                    ComputeCapability::new(10, 3),
                )),
            ],
        };
        let info = memory(&backend, false).unwrap();
        assert_eq!(info.count, 2);
        assert_eq!(info.total, 16);
        assert_eq!(info.integrated_gpu, Some(1));
    }

    #[test]
    fn test_minimum_capability() {
        let backend = FakeBackend {
            devices: vec![device(1, 1, 7, 5), device(1, 1, 6, 1), device(1, 1, 7, 0)],
        };
        assert_eq!(compute_capability(&backend).unwrap(), ComputeCapability::new(6, 1));

        let backend = FakeBackend {
            devices: vec![device(1, 1, 6, 9), device(1, 1, 6, 1)],
        };
        assert_eq!(compute_capability(&backend).unwrap(), ComputeCapability::new(6, 1));
    }

    #[test]
    fn test_capability_failure_names_device() {
        let backend = FakeBackend {
            devices: vec![device(1, 1, 8, 6), Err(3)],
        };
        match compute_capability(&backend) {
            Err(QueryError::Device { index, status, .. }) => {
                assert_eq!(index, 1);
                assert_eq!(status, 3);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_capability_without_devices() {
        let backend = FakeBackend { devices: vec![] };
        assert_eq!(compute_capability(&backend), Err(QueryError::NoDevices));
    }
}
