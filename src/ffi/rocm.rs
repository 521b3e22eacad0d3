//! AMD ROCm SMI binding.

use std::ffi::{c_char, c_int, CStr};
use std::path::Path;

use libloading::Library;
use tracing::{debug, info, warn};

use super::{open_library, string_from_buffer, BindError, STRING_BUFFER_LEN};
use crate::discovery::amdgpu::{self, GfxVersion};
use crate::gpu::backend::{Backend, BackendKind, ComputeCapability, DeviceMemory, QueryError};

type RsmiStatus = c_int;

const RSMI_STATUS_SUCCESS: RsmiStatus = 0;
const RSMI_MEM_TYPE_VRAM: c_int = 0;

/// Devices reporting less VRAM than this are integrated GPUs carving out a
/// small window of system memory.
const INTEGRATED_VRAM_LIMIT: u64 = 1024 * 1024 * 1024;

#[repr(C)]
struct RsmiVersion {
    major: u32,
    minor: u32,
    patch: u32,
    build: *const c_char,
}

impl Default for RsmiVersion {
    fn default() -> Self {
        Self {
            major: 0,
            minor: 0,
            patch: 0,
            build: std::ptr::null(),
        }
    }
}

type DeviceStringFn = unsafe extern "C" fn(u32, *mut c_char, u32) -> RsmiStatus;
type DeviceStringSizeFn = unsafe extern "C" fn(u32, *mut c_char, usize) -> RsmiStatus;

symbol_table! {
    struct RocmApi {
        init: "rsmi_init" => unsafe extern "C" fn(u64) -> RsmiStatus,
        shut_down: "rsmi_shut_down" => unsafe extern "C" fn() -> RsmiStatus,
        dev_memory_total_get: "rsmi_dev_memory_total_get"
            => unsafe extern "C" fn(u32, c_int, *mut u64) -> RsmiStatus,
        dev_memory_usage_get: "rsmi_dev_memory_usage_get"
            => unsafe extern "C" fn(u32, c_int, *mut u64) -> RsmiStatus,
        version_get: "rsmi_version_get" => unsafe extern "C" fn(*mut RsmiVersion) -> RsmiStatus,
        num_monitor_devices: "rsmi_num_monitor_devices"
            => unsafe extern "C" fn(*mut u32) -> RsmiStatus,
        dev_id_get: "rsmi_dev_id_get" => unsafe extern "C" fn(u32, *mut u16) -> RsmiStatus,
        dev_name_get: "rsmi_dev_name_get" => DeviceStringSizeFn,
        dev_brand_get: "rsmi_dev_brand_get" => DeviceStringFn,
        dev_vendor_name_get: "rsmi_dev_vendor_name_get" => DeviceStringSizeFn,
        dev_vram_vendor_get: "rsmi_dev_vram_vendor_get" => DeviceStringFn,
        dev_serial_number_get: "rsmi_dev_serial_number_get" => DeviceStringFn,
        dev_subsystem_name_get: "rsmi_dev_subsystem_name_get" => DeviceStringSizeFn,
        dev_vbios_version_get: "rsmi_dev_vbios_version_get" => DeviceStringFn,
    }
}

/// A bound and initialized ROCm SMI library.
pub struct RocmHandle {
    api: RocmApi,
    verbose: bool,
    gfx: Vec<GfxVersion>,
    variant: String,
    // Keeps the function pointers in `api` valid.
    _library: Library,
}

impl RocmHandle {
    /// Open `path`, resolve the ROCm SMI symbol table and call `rsmi_init`.
    ///
    /// GPU generations are read from the KFD `topology` directory and the
    /// amdgpu driver version from `driver_version_file`.
    pub fn bind(
        path: &Path,
        verbose: bool,
        topology: &Path,
        driver_version_file: &Path,
    ) -> Result<Self, BindError> {
        let library = open_library(path)?;
        debug!(path = %path.display(), "Wiring ROCm management library functions");

        // SAFETY: signatures follow rocm_smi.h; `api` is stored next to
        // `library`.
        let api = unsafe { RocmApi::resolve(&library)? };

        // SAFETY: plain integer flags argument.
        let status = unsafe { (api.init)(0) };
        if status != RSMI_STATUS_SUCCESS {
            debug!(status, "rsmi_init failed");
            return Err(BindError::Init {
                call: "rsmi_init",
                status,
            });
        }

        match amdgpu::driver_version(driver_version_file) {
            Some(version) => info!(%version, "AMD driver"),
            None => warn!(
                "amdgpu kernel driver version not found, the AMD Linux driver is recommended"
            ),
        }

        let gfx = amdgpu::gfx_versions(topology);
        debug!(?gfx, "AMD GPU generations");

        let mut handle = Self {
            api,
            verbose,
            gfx,
            variant: String::new(),
            _library: library,
        };
        handle.variant = handle.rocm_variant();
        Ok(handle)
    }

    /// `v<major>` of the installed ROCm SMI, or empty when unknown.
    fn rocm_variant(&self) -> String {
        let mut version = RsmiVersion::default();
        // SAFETY: `version` is a valid out pointer.
        let status = unsafe { (self.api.version_get)(&mut version) };
        if status != RSMI_STATUS_SUCCESS {
            info!(status, "Failed to look up ROCm version");
            return String::new();
        }
        if self.verbose {
            let build = if version.build.is_null() {
                String::new()
            } else {
                // SAFETY: rsmi_version_get points `build` at a static
                // NUL-terminated string.
                unsafe { CStr::from_ptr(version.build) }
                    .to_string_lossy()
                    .into_owned()
            };
            debug!(
                %build,
                "ROCm SMI version {}.{}.{}",
                version.major, version.minor, version.patch
            );
        }
        format!("v{}", version.major)
    }

    fn memory_query(
        &self,
        index: u32,
        call: &'static str,
        query: unsafe extern "C" fn(u32, c_int, *mut u64) -> RsmiStatus,
    ) -> Result<u64, QueryError> {
        let mut value = 0u64;
        // SAFETY: `value` is a valid out pointer.
        let status = unsafe { query(index, RSMI_MEM_TYPE_VRAM, &mut value) };
        if status != RSMI_STATUS_SUCCESS {
            return Err(QueryError::Device {
                index,
                call,
                status,
            });
        }
        Ok(value)
    }

    fn log_string(&self, index: u32, field: &str, result: Result<String, RsmiStatus>) {
        match result {
            Ok(value) => debug!(index, %value, "ROCm device {field}"),
            Err(status) => debug!(index, status, "ROCm {field} lookup failed"),
        }
    }
}

fn device_string(index: u32, query: DeviceStringFn) -> Result<String, RsmiStatus> {
    let mut buf = [0u8; STRING_BUFFER_LEN];
    // SAFETY: the buffer length passed matches the buffer.
    let status = unsafe { query(index, buf.as_mut_ptr().cast(), buf.len() as u32) };
    if status == RSMI_STATUS_SUCCESS {
        Ok(string_from_buffer(&buf))
    } else {
        Err(status)
    }
}

fn device_string_sized(index: u32, query: DeviceStringSizeFn) -> Result<String, RsmiStatus> {
    let mut buf = [0u8; STRING_BUFFER_LEN];
    // SAFETY: the buffer length passed matches the buffer.
    let status = unsafe { query(index, buf.as_mut_ptr().cast(), buf.len()) };
    if status == RSMI_STATUS_SUCCESS {
        Ok(string_from_buffer(&buf))
    } else {
        Err(status)
    }
}

impl Backend for RocmHandle {
    fn kind(&self) -> BackendKind {
        BackendKind::Rocm
    }

    fn device_count(&self) -> Result<u32, QueryError> {
        let mut count = 0u32;
        // SAFETY: `count` is a valid out pointer.
        let status = unsafe { (self.api.num_monitor_devices)(&mut count) };
        if status != RSMI_STATUS_SUCCESS {
            return Err(QueryError::DeviceCount {
                call: "rsmi_num_monitor_devices",
                status,
            });
        }
        Ok(count)
    }

    fn device_memory(&self, index: u32) -> Result<DeviceMemory, QueryError> {
        let total =
            self.memory_query(index, "rsmi_dev_memory_total_get", self.api.dev_memory_total_get)?;
        let used =
            self.memory_query(index, "rsmi_dev_memory_usage_get", self.api.dev_memory_usage_get)?;
        Ok(DeviceMemory {
            free: total.saturating_sub(used),
            total,
            integrated: total < INTEGRATED_VRAM_LIMIT,
        })
    }

    fn device_capability(&self, index: u32) -> Result<ComputeCapability, QueryError> {
        let gfx = self
            .gfx
            .get(index as usize)
            .ok_or_else(|| QueryError::DeviceInfo {
                index,
                reason: "no gfx_target_version in KFD topology".to_string(),
            })?;
        Ok(ComputeCapability::new(gfx.major, gfx.minor))
    }

    fn log_device_details(&self, index: u32) {
        if !self.verbose {
            return;
        }

        let mut id = 0u16;
        // SAFETY: `id` is a valid out pointer.
        let status = unsafe { (self.api.dev_id_get)(index, &mut id) };
        if status == RSMI_STATUS_SUCCESS {
            debug!(index, "ROCm device id: {id:#06x}");
        } else {
            debug!(index, status, "rsmi_dev_id_get failed");
        }

        self.log_string(index, "name", device_string_sized(index, self.api.dev_name_get));
        self.log_string(index, "brand", device_string(index, self.api.dev_brand_get));
        self.log_string(
            index,
            "vendor",
            device_string_sized(index, self.api.dev_vendor_name_get),
        );
        self.log_string(
            index,
            "VRAM vendor",
            device_string(index, self.api.dev_vram_vendor_get),
        );
        self.log_string(
            index,
            "S/N",
            device_string(index, self.api.dev_serial_number_get),
        );
        self.log_string(
            index,
            "subsystem name",
            device_string_sized(index, self.api.dev_subsystem_name_get),
        );
        self.log_string(
            index,
            "vbios version",
            device_string(index, self.api.dev_vbios_version_get),
        );
    }

    fn variant(&self) -> String {
        self.variant.clone()
    }
}

impl Drop for RocmHandle {
    fn drop(&mut self) {
        // SAFETY: rsmi_init succeeded when this handle was created.
        let status = unsafe { (self.api.shut_down)() };
        if status != RSMI_STATUS_SUCCESS {
            debug!(status, "rsmi_shut_down failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_table() {
        assert_eq!(RocmApi::SYMBOLS.len(), 14);
        assert_eq!(RocmApi::SYMBOLS[0], "rsmi_init");
        assert!(RocmApi::SYMBOLS.contains(&"rsmi_dev_memory_usage_get"));
    }

    #[test]
    fn test_bind_missing_library() {
        let err = RocmHandle::bind(
            Path::new("/nonexistent/librocm_smi64.so.6"),
            false,
            Path::new(amdgpu::KFD_TOPOLOGY),
            Path::new(amdgpu::AMDGPU_VERSION_FILE),
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("librocm_smi64.so.6"));
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn test_bind_library_without_rocm_symbols() {
        let err = RocmHandle::bind(
            Path::new("libc.so.6"),
            false,
            Path::new(amdgpu::KFD_TOPOLOGY),
            Path::new(amdgpu::AMDGPU_VERSION_FILE),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            BindError::SymbolMissing {
                symbol: "rsmi_init",
                ..
            }
        ));
        assert!(err.to_string().contains("rsmi_init"));
    }
}
