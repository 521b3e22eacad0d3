//! Dynamic bindings to vendor GPU management libraries.
//!
//! Nothing here links against a vendor SDK. Each backend declares its symbol
//! table with [`symbol_table!`], opens a candidate library with
//! `libloading`, resolves every symbol by name and runs one init call. Any
//! failure drops the `Library`, which closes it again.
//!
//! - [`nvml`]: NVIDIA Management Library
//! - [`cudart`]: CUDA runtime
//! - [`rocm`]: AMD ROCm SMI

use std::ffi::{CStr, OsString};
use std::path::{Path, PathBuf};

use libloading::Library;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ProbeConfig;
use crate::discovery::locator::{find_libraries, search_patterns, Platform};
use crate::gpu::backend::{Backend, BackendKind};
use crate::gpu::detector::BackendLoader;

/// Declare a fixed-shape table of C function pointers resolved by name.
///
/// Generates the struct, a `SYMBOLS` list in resolution order and an
/// `unsafe fn resolve(&Library)` that stops at the first missing symbol.
macro_rules! symbol_table {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $field:ident: $symbol:literal => $ty:ty, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy)]
        $vis struct $name {
            $( $field: $ty, )+
        }

        impl $name {
            /// Symbol names in resolution order.
            #[allow(dead_code)]
            pub const SYMBOLS: &'static [&'static str] = &[$( $symbol ),+];

            /// Resolve every symbol of the table from `lib`.
            ///
            /// # Safety
            ///
            /// The declared signatures must match the library's exports, and
            /// the returned pointers must not outlive `lib`.
            unsafe fn resolve(lib: &::libloading::Library) -> Result<Self, $crate::ffi::BindError> {
                Ok(Self {
                    $( $field: unsafe { $crate::ffi::resolve_symbol::<$ty>(lib, $symbol)? }, )+
                })
            }
        }
    };
}

pub mod cudart;
pub mod nvml;
pub mod rocm;

pub use cudart::CudartHandle;
pub use nvml::NvmlHandle;
pub use rocm::RocmHandle;

/// Size of the scratch buffers handed to string queries.
const STRING_BUFFER_LEN: usize = 256;

/// Why a candidate library could not be bound.
#[derive(Error, Debug)]
pub enum BindError {
    #[error("unable to load {}: {source}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("symbol lookup for {symbol} failed: {source}")]
    SymbolMissing {
        symbol: &'static str,
        #[source]
        source: libloading::Error,
    },

    #[error("{call} failed with status {status}")]
    Init { call: &'static str, status: i32 },
}

/// Open the shared library at `path`.
fn open_library(path: &Path) -> Result<Library, BindError> {
    // SAFETY: vendor management libraries have no load-time initializers
    // with preconditions on the caller.
    unsafe { Library::new(path) }.map_err(|source| BindError::Load {
        path: path.to_path_buf(),
        source,
    })
}

/// Look up `name` in `lib` and copy out the function pointer.
///
/// # Safety
///
/// `T` must be the function pointer type of the exported symbol.
pub(crate) unsafe fn resolve_symbol<T: Copy>(
    lib: &Library,
    name: &'static str,
) -> Result<T, BindError> {
    debug!(symbol = name, "dlsym");
    let symbol = unsafe { lib.get::<T>(name.as_bytes()) }
        .map_err(|source| BindError::SymbolMissing { symbol: name, source })?;
    Ok(*symbol)
}

/// Decode a NUL-terminated string written into `buf` by a C call.
fn string_from_buffer(buf: &[u8]) -> String {
    match CStr::from_bytes_until_nul(buf) {
        Ok(s) => s.to_string_lossy().into_owned(),
        Err(_) => String::from_utf8_lossy(buf).into_owned(),
    }
}

/// Try `bind` on each candidate in order. The first success wins and the
/// remaining candidates are left untouched.
pub fn bind_first<T>(
    kind: BackendKind,
    paths: &[PathBuf],
    mut bind: impl FnMut(&Path) -> Result<T, BindError>,
) -> Option<T> {
    for path in paths {
        match bind(path) {
            Ok(handle) => {
                info!(backend = %kind, path = %path.display(), "GPU management library bound");
                return Some(handle);
            }
            Err(e) => {
                info!(
                    backend = %kind,
                    path = %path.display(),
                    error = %e,
                    "Unable to load GPU management library"
                );
            }
        }
    }
    None
}

/// Locates and binds vendor libraries installed on this host.
pub struct LibraryLoader {
    platform: Platform,
    search_path: Option<OsString>,
    default_locations: bool,
    verbose: bool,
    kfd_topology: PathBuf,
    amdgpu_version_file: PathBuf,
}

impl LibraryLoader {
    /// Loader for the current platform, searching the default install
    /// locations plus the process's library search path.
    pub fn new(config: &ProbeConfig) -> Self {
        let platform = Platform::current();
        let search_path = platform.search_path_var().and_then(std::env::var_os);

        Self {
            platform,
            search_path,
            default_locations: true,
            verbose: config.verbose,
            kfd_topology: config.kfd_topology.clone(),
            amdgpu_version_file: config.amdgpu_version_file.clone(),
        }
    }

    /// Override the platform used for library names and default globs.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Replace the library search path (`LD_LIBRARY_PATH` / `PATH` value).
    pub fn with_search_path(mut self, search_path: Option<OsString>) -> Self {
        self.search_path = search_path;
        self
    }

    /// Only search the library search path, skipping vendor install
    /// locations.
    pub fn without_default_locations(mut self) -> Self {
        self.default_locations = false;
        self
    }

    /// Candidate library paths for `kind`, best first.
    pub fn candidates(&self, kind: BackendKind) -> Vec<PathBuf> {
        let Some(base_name) = self.platform.library_name(kind) else {
            debug!(backend = %kind, "Backend not supported on this platform");
            return Vec::new();
        };
        let defaults: &[&str] = if self.default_locations {
            self.platform.default_globs(kind)
        } else {
            &[]
        };
        let patterns = search_patterns(base_name, defaults, self.search_path.as_deref());
        find_libraries(base_name, &patterns)
    }
}

impl BackendLoader for LibraryLoader {
    fn load(&self, kind: BackendKind) -> Option<Box<dyn Backend>> {
        let paths = self.candidates(kind);
        if paths.is_empty() {
            return None;
        }

        let backend: Box<dyn Backend> = match kind {
            BackendKind::Nvml => Box::new(bind_first(kind, &paths, |path| {
                NvmlHandle::bind(path, self.verbose)
            })?),
            BackendKind::Cudart => Box::new(bind_first(kind, &paths, |path| {
                CudartHandle::bind(path, self.verbose)
            })?),
            BackendKind::Rocm => Box::new(bind_first(kind, &paths, |path| {
                RocmHandle::bind(
                    path,
                    self.verbose,
                    &self.kfd_topology,
                    &self.amdgpu_version_file,
                )
            })?),
        };
        Some(backend)
    }
}
