//! NVIDIA Management Library binding.
//!
//! Preferred NVIDIA backend: NVML reports memory without creating a CUDA
//! context on the device.

use std::ffi::{c_char, c_int, c_uint, c_ulonglong, c_void};
use std::path::Path;

use libloading::Library;
use tracing::debug;

use super::{open_library, string_from_buffer, BindError, STRING_BUFFER_LEN};
use crate::gpu::backend::{Backend, BackendKind, ComputeCapability, DeviceMemory, QueryError};

type NvmlReturn = c_int;
type NvmlDevice = *mut c_void;

const NVML_SUCCESS: NvmlReturn = 0;

#[repr(C)]
#[derive(Debug, Default)]
struct NvmlMemory {
    total: c_ulonglong,
    free: c_ulonglong,
    used: c_ulonglong,
}

symbol_table! {
    struct NvmlApi {
        init: "nvmlInit_v2" => unsafe extern "C" fn() -> NvmlReturn,
        shutdown: "nvmlShutdown" => unsafe extern "C" fn() -> NvmlReturn,
        device_get_handle_by_index: "nvmlDeviceGetHandleByIndex"
            => unsafe extern "C" fn(c_uint, *mut NvmlDevice) -> NvmlReturn,
        device_get_memory_info: "nvmlDeviceGetMemoryInfo"
            => unsafe extern "C" fn(NvmlDevice, *mut NvmlMemory) -> NvmlReturn,
        device_get_count: "nvmlDeviceGetCount_v2"
            => unsafe extern "C" fn(*mut c_uint) -> NvmlReturn,
        device_get_cuda_compute_capability: "nvmlDeviceGetCudaComputeCapability"
            => unsafe extern "C" fn(NvmlDevice, *mut c_int, *mut c_int) -> NvmlReturn,
        system_get_driver_version: "nvmlSystemGetDriverVersion"
            => unsafe extern "C" fn(*mut c_char, c_uint) -> NvmlReturn,
        device_get_name: "nvmlDeviceGetName"
            => unsafe extern "C" fn(NvmlDevice, *mut c_char, c_uint) -> NvmlReturn,
        device_get_serial: "nvmlDeviceGetSerial"
            => unsafe extern "C" fn(NvmlDevice, *mut c_char, c_uint) -> NvmlReturn,
        device_get_vbios_version: "nvmlDeviceGetVbiosVersion"
            => unsafe extern "C" fn(NvmlDevice, *mut c_char, c_uint) -> NvmlReturn,
        device_get_board_part_number: "nvmlDeviceGetBoardPartNumber"
            => unsafe extern "C" fn(NvmlDevice, *mut c_char, c_uint) -> NvmlReturn,
        device_get_brand: "nvmlDeviceGetBrand"
            => unsafe extern "C" fn(NvmlDevice, *mut c_int) -> NvmlReturn,
    }
}

/// A bound and initialized NVML library.
pub struct NvmlHandle {
    api: NvmlApi,
    verbose: bool,
    // Keeps the function pointers in `api` valid.
    _library: Library,
}

impl NvmlHandle {
    /// Open `path`, resolve the NVML symbol table and call `nvmlInit_v2`.
    pub fn bind(path: &Path, verbose: bool) -> Result<Self, BindError> {
        let library = open_library(path)?;
        debug!(path = %path.display(), "Wiring NVML management library functions");

        // SAFETY: signatures follow nvml.h; `api` is stored next to `library`.
        let api = unsafe { NvmlApi::resolve(&library)? };

        // SAFETY: nvmlInit_v2 takes no arguments.
        let status = unsafe { (api.init)() };
        if status != NVML_SUCCESS {
            debug!(status, "nvmlInit_v2 failed");
            return Err(BindError::Init {
                call: "nvmlInit_v2",
                status,
            });
        }

        let handle = Self {
            api,
            verbose,
            _library: library,
        };
        if verbose {
            handle.log_driver_version();
        }
        Ok(handle)
    }

    fn log_driver_version(&self) {
        let mut buf = [0u8; STRING_BUFFER_LEN];
        // SAFETY: the buffer length passed matches the buffer.
        let status = unsafe {
            (self.api.system_get_driver_version)(buf.as_mut_ptr().cast(), buf.len() as c_uint)
        };
        if status == NVML_SUCCESS {
            debug!(version = %string_from_buffer(&buf), "CUDA driver version");
        } else {
            debug!(status, "nvmlSystemGetDriverVersion failed");
        }
    }

    fn device(&self, index: u32) -> Result<NvmlDevice, QueryError> {
        let mut device: NvmlDevice = std::ptr::null_mut();
        // SAFETY: `device` is a valid out pointer.
        let status = unsafe { (self.api.device_get_handle_by_index)(index, &mut device) };
        if status != NVML_SUCCESS {
            return Err(QueryError::Device {
                index,
                call: "nvmlDeviceGetHandleByIndex",
                status,
            });
        }
        Ok(device)
    }

    fn device_string(
        &self,
        device: NvmlDevice,
        query: unsafe extern "C" fn(NvmlDevice, *mut c_char, c_uint) -> NvmlReturn,
    ) -> Result<String, NvmlReturn> {
        let mut buf = [0u8; STRING_BUFFER_LEN];
        // SAFETY: the buffer length passed matches the buffer.
        let status = unsafe { query(device, buf.as_mut_ptr().cast(), buf.len() as c_uint) };
        if status == NVML_SUCCESS {
            Ok(string_from_buffer(&buf))
        } else {
            Err(status)
        }
    }
}

impl Backend for NvmlHandle {
    fn kind(&self) -> BackendKind {
        BackendKind::Nvml
    }

    fn device_count(&self) -> Result<u32, QueryError> {
        let mut count: c_uint = 0;
        // SAFETY: `count` is a valid out pointer.
        let status = unsafe { (self.api.device_get_count)(&mut count) };
        if status != NVML_SUCCESS {
            return Err(QueryError::DeviceCount {
                call: "nvmlDeviceGetCount_v2",
                status,
            });
        }
        Ok(count)
    }

    fn device_memory(&self, index: u32) -> Result<DeviceMemory, QueryError> {
        let device = self.device(index)?;
        let mut memory = NvmlMemory::default();
        // SAFETY: `device` came from nvmlDeviceGetHandleByIndex.
        let status = unsafe { (self.api.device_get_memory_info)(device, &mut memory) };
        if status != NVML_SUCCESS {
            return Err(QueryError::Device {
                index,
                call: "nvmlDeviceGetMemoryInfo",
                status,
            });
        }
        debug!(index, used = memory.used, "NVML device memory in use");
        Ok(DeviceMemory {
            free: memory.free,
            total: memory.total,
            integrated: false,
        })
    }

    fn device_capability(&self, index: u32) -> Result<ComputeCapability, QueryError> {
        let device = self.device(index)?;
        let (mut major, mut minor): (c_int, c_int) = (0, 0);
        // SAFETY: both out pointers are valid.
        let status = unsafe {
            (self.api.device_get_cuda_compute_capability)(device, &mut major, &mut minor)
        };
        if status != NVML_SUCCESS {
            return Err(QueryError::Device {
                index,
                call: "nvmlDeviceGetCudaComputeCapability",
                status,
            });
        }
        Ok(ComputeCapability::new(
            major.max(0) as u32,
            minor.max(0) as u32,
        ))
    }

    fn log_device_details(&self, index: u32) {
        if !self.verbose {
            return;
        }
        let device = match self.device(index) {
            Ok(device) => device,
            Err(e) => {
                debug!(error = %e, "Skipping device details");
                return;
            }
        };

        let queries = [
            ("name", self.api.device_get_name),
            ("part number", self.api.device_get_board_part_number),
            ("serial", self.api.device_get_serial),
            ("vbios version", self.api.device_get_vbios_version),
        ];
        for (field, query) in queries {
            match self.device_string(device, query) {
                Ok(value) => debug!(index, %value, "CUDA device {field}"),
                Err(status) => debug!(index, status, "NVML {field} lookup failed"),
            }
        }

        let mut brand: c_int = 0;
        // SAFETY: `brand` is a valid out pointer.
        let status = unsafe { (self.api.device_get_brand)(device, &mut brand) };
        if status == NVML_SUCCESS {
            debug!(index, brand, "CUDA device brand");
        } else {
            debug!(index, status, "nvmlDeviceGetBrand failed");
        }
    }
}

impl Drop for NvmlHandle {
    fn drop(&mut self) {
        // SAFETY: nvmlInit_v2 succeeded when this handle was created.
        let status = unsafe { (self.api.shutdown)() };
        if status != NVML_SUCCESS {
            debug!(status, "nvmlShutdown failed");
        }
    }
}
