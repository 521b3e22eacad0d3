//! gpu-probe: runtime discovery of GPU management libraries.
//!
//! Finds the NVIDIA (NVML, CUDA runtime) and AMD (ROCm SMI) libraries
//! installed on the host, binds them with `dlopen`, and reports the usable
//! devices, their memory and the weakest compute capability. Without a
//! usable GPU the report describes system memory instead.
//!
//! ```no_run
//! let info = gpu_probe::gpu::probe();
//! println!("{} devices via {}", info.device_count, info.library);
//! ```

pub mod config;
pub mod discovery;
pub mod ffi;
pub mod gpu;
pub mod host;
