//! CUDA runtime binding.
//!
//! Fallback for NVIDIA hosts that ship `libcudart` but no NVML, such as
//! Jetson boards.

use std::ffi::c_int;
use std::path::Path;

use libloading::Library;
use tracing::debug;

use super::{open_library, BindError};
use crate::gpu::backend::{Backend, BackendKind, ComputeCapability, DeviceMemory, QueryError};

type CudaError = c_int;

const CUDA_SUCCESS: CudaError = 0;
const CUDA_DEV_ATTR_COMPUTE_CAPABILITY_MAJOR: c_int = 75;
const CUDA_DEV_ATTR_COMPUTE_CAPABILITY_MINOR: c_int = 76;

symbol_table! {
    struct CudartApi {
        set_device: "cudaSetDevice" => unsafe extern "C" fn(c_int) -> CudaError,
        device_reset: "cudaDeviceReset" => unsafe extern "C" fn() -> CudaError,
        mem_get_info: "cudaMemGetInfo" => unsafe extern "C" fn(*mut usize, *mut usize) -> CudaError,
        get_device_count: "cudaGetDeviceCount" => unsafe extern "C" fn(*mut c_int) -> CudaError,
        device_get_attribute: "cudaDeviceGetAttribute"
            => unsafe extern "C" fn(*mut c_int, c_int, c_int) -> CudaError,
        driver_get_version: "cudaDriverGetVersion" => unsafe extern "C" fn(*mut c_int) -> CudaError,
    }
}

/// Split a CUDA driver version (`1000 * major + 10 * minor`) into its parts.
pub fn decode_driver_version(version: i32) -> (i32, i32) {
    let major = version / 1000;
    let minor = (version - major * 1000) / 10;
    (major, minor)
}

/// A bound CUDA runtime with device 0 selected.
pub struct CudartHandle {
    api: CudartApi,
    // Keeps the function pointers in `api` valid.
    _library: Library,
}

impl CudartHandle {
    /// Open `path`, resolve the runtime symbol table and select device 0.
    pub fn bind(path: &Path, verbose: bool) -> Result<Self, BindError> {
        let library = open_library(path)?;
        debug!(path = %path.display(), "Wiring CUDA runtime library functions");

        // SAFETY: signatures follow cuda_runtime_api.h; `api` is stored next
        // to `library`.
        let api = unsafe { CudartApi::resolve(&library)? };

        // SAFETY: plain integer argument.
        let status = unsafe { (api.set_device)(0) };
        if status != CUDA_SUCCESS {
            debug!(status, "cudaSetDevice failed");
            return Err(BindError::Init {
                call: "cudaSetDevice",
                status,
            });
        }

        let handle = Self {
            api,
            _library: library,
        };
        if verbose {
            handle.log_driver_version();
        }
        Ok(handle)
    }

    fn log_driver_version(&self) {
        let mut version: c_int = 0;
        // SAFETY: `version` is a valid out pointer.
        let status = unsafe { (self.api.driver_get_version)(&mut version) };
        if status != CUDA_SUCCESS {
            debug!(status, "cudaDriverGetVersion failed");
            return;
        }
        let (major, minor) = decode_driver_version(version);
        debug!("CUDA driver version: {major}-{minor}");
    }

    fn select(&self, index: u32) -> Result<c_int, QueryError> {
        let device = c_int::try_from(index).map_err(|_| QueryError::DeviceInfo {
            index,
            reason: "device index out of range".to_string(),
        })?;
        // SAFETY: plain integer argument.
        let status = unsafe { (self.api.set_device)(device) };
        if status != CUDA_SUCCESS {
            return Err(QueryError::Device {
                index,
                call: "cudaSetDevice",
                status,
            });
        }
        Ok(device)
    }

    fn attribute(&self, index: u32, device: c_int, attribute: c_int) -> Result<u32, QueryError> {
        let mut value: c_int = 0;
        // SAFETY: `value` is a valid out pointer.
        let status = unsafe { (self.api.device_get_attribute)(&mut value, attribute, device) };
        if status != CUDA_SUCCESS {
            return Err(QueryError::Device {
                index,
                call: "cudaDeviceGetAttribute",
                status,
            });
        }
        Ok(value.max(0) as u32)
    }
}

impl Backend for CudartHandle {
    fn kind(&self) -> BackendKind {
        BackendKind::Cudart
    }

    fn device_count(&self) -> Result<u32, QueryError> {
        let mut count: c_int = 0;
        // SAFETY: `count` is a valid out pointer.
        let status = unsafe { (self.api.get_device_count)(&mut count) };
        if status != CUDA_SUCCESS {
            return Err(QueryError::DeviceCount {
                call: "cudaGetDeviceCount",
                status,
            });
        }
        Ok(count.max(0) as u32)
    }

    fn device_memory(&self, index: u32) -> Result<DeviceMemory, QueryError> {
        self.select(index)?;
        let (mut free, mut total) = (0usize, 0usize);
        // SAFETY: both out pointers are valid.
        let status = unsafe { (self.api.mem_get_info)(&mut free, &mut total) };
        if status != CUDA_SUCCESS {
            return Err(QueryError::Device {
                index,
                call: "cudaMemGetInfo",
                status,
            });
        }
        Ok(DeviceMemory {
            free: free as u64,
            total: total as u64,
            integrated: false,
        })
    }

    fn device_capability(&self, index: u32) -> Result<ComputeCapability, QueryError> {
        let device = self.select(index)?;
        let major = self.attribute(index, device, CUDA_DEV_ATTR_COMPUTE_CAPABILITY_MAJOR)?;
        let minor = self.attribute(index, device, CUDA_DEV_ATTR_COMPUTE_CAPABILITY_MINOR)?;
        Ok(ComputeCapability::new(major, minor))
    }
}

impl Drop for CudartHandle {
    fn drop(&mut self) {
        // Releases the primary context created by cudaSetDevice.
        // SAFETY: no arguments.
        let status = unsafe { (self.api.device_reset)() };
        if status != CUDA_SUCCESS {
            debug!(status, "cudaDeviceReset failed");
        }
    }
}
