//! Runtime configuration for gpu-probe.
//!
//! Configuration can be loaded from a JSON file or constructed
//! programmatically; environment variables are layered on top. All
//! detection policy knobs (capability floors, VRAM overhead) live here.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::discovery::amdgpu::{AMDGPU_VERSION_FILE, KFD_TOPOLOGY};
use crate::gpu::backend::ComputeCapability;

/// User override for the usable VRAM, in bytes.
pub const MAX_VRAM_ENV: &str = "OLLAMA_MAX_VRAM";

/// Any non-empty value enables verbose detection logging.
pub const DEBUG_ENV: &str = "OLLAMA_DEBUG";

/// Set on Jetson boards to the installed JetPack version.
pub const JETPACK_ENV: &str = "JETSON_JETPACK";

/// Device visibility list honoured by the ROCm runtime.
pub const ROCR_VISIBLE_DEVICES_ENV: &str = "ROCR_VISIBLE_DEVICES";

const GIB: u64 = 1024 * 1024 * 1024;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "gpu-probe", about = "Detect the usable GPU backend and VRAM")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging and per-device detail queries.
    #[arg(short, long)]
    pub verbose: bool,

    /// Print the report as JSON.
    #[arg(long)]
    pub json: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid OLLAMA_MAX_VRAM setting {value}: {reason}")]
    InvalidMaxVram { value: String, reason: String },
}

/// Detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Log driver versions and per-device details.
    pub verbose: bool,

    /// Raw `OLLAMA_MAX_VRAM` value. Parsed on use so that a malformed value
    /// reaches the caller as an error.
    pub max_vram: Option<String>,

    /// JetPack version on Jetson boards (unified memory, no overhead).
    pub jetpack: Option<String>,

    /// `ROCR_VISIBLE_DEVICES` as set by the user. Never overridden.
    pub rocr_visible_devices: Option<String>,

    /// Minimum CUDA compute capability.
    pub compute_min: ComputeCapability,

    /// Minimum AMD gfx major version.
    pub rocm_gfx_min_major: u32,

    /// VRAM reserved per GPU regardless of its size.
    pub overhead_floor_per_device: u64,

    /// Reserve at least `free / overhead_fraction_divisor` bytes.
    pub overhead_fraction_divisor: u64,

    /// KFD topology directory used to read AMD GPU generations.
    pub kfd_topology: PathBuf,

    /// amdgpu kernel module version file.
    pub amdgpu_version_file: PathBuf,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            max_vram: None,
            jetpack: None,
            rocr_visible_devices: None,
            compute_min: ComputeCapability::new(5, 0),
            rocm_gfx_min_major: 9,
            overhead_floor_per_device: GIB,
            overhead_fraction_divisor: 10,
            kfd_topology: PathBuf::from(KFD_TOPOLOGY),
            amdgpu_version_file: PathBuf::from(AMDGPU_VERSION_FILE),
        }
    }
}

impl ProbeConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        config.apply_env(lookup);
        config
    }

    /// Load configuration from a JSON file, falling back to defaults for
    /// missing fields, then apply the process environment.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Overlay environment values. Empty values count as unset.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if get(DEBUG_ENV).is_some() {
            self.verbose = true;
        }
        if let Some(value) = get(MAX_VRAM_ENV) {
            self.max_vram = Some(value);
        }
        if let Some(value) = get(JETPACK_ENV) {
            self.jetpack = Some(value);
        }
        if let Some(value) = get(ROCR_VISIBLE_DEVICES_ENV) {
            self.rocr_visible_devices = Some(value);
        }
    }

    /// The user's VRAM limit, if one is set.
    pub fn max_vram_override(&self) -> Result<Option<u64>, ConfigError> {
        let Some(raw) = self.max_vram.as_deref() else {
            return Ok(None);
        };
        let invalid = |reason: String| ConfigError::InvalidMaxVram {
            value: raw.to_string(),
            reason,
        };

        let value: i64 = raw
            .parse()
            .map_err(|e: std::num::ParseIntError| invalid(e.to_string()))?;
        let value =
            u64::try_from(value).map_err(|_| invalid("must not be negative".to_string()))?;
        Ok(Some(value))
    }

    /// Whether the GPU shares OS-managed memory with the CPU.
    pub fn unified_memory(&self) -> bool {
        self.jetpack.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let cfg = ProbeConfig::default();
        assert_eq!(cfg.compute_min, ComputeCapability::new(5, 0));
        assert_eq!(cfg.overhead_floor_per_device, 1024 * 1024 * 1024);
        assert!(!cfg.verbose);
        assert!(!cfg.unified_memory());
    }

    #[test]
    fn test_env_overlay() {
        let cfg = ProbeConfig::from_lookup(lookup(&[
            ("OLLAMA_DEBUG", "1"),
            ("JETSON_JETPACK", "5.1.2"),
            ("ROCR_VISIBLE_DEVICES", "1"),
            ("OLLAMA_MAX_VRAM", ""),
        ]));
        assert!(cfg.verbose);
        assert!(cfg.unified_memory());
        assert_eq!(cfg.rocr_visible_devices.as_deref(), Some("1"));
        assert_eq!(cfg.max_vram, None);
    }

    #[test]
    fn test_max_vram_override() {
        let cfg = ProbeConfig::from_lookup(lookup(&[("OLLAMA_MAX_VRAM", "1073741824")]));
        assert_eq!(cfg.max_vram_override(), Ok(Some(1073741824)));

        let cfg = ProbeConfig::from_lookup(lookup(&[]));
        assert_eq!(cfg.max_vram_override(), Ok(None));
    }

    #[test]
    fn test_invalid_max_vram() {
        let cfg = ProbeConfig::from_lookup(lookup(&[("OLLAMA_MAX_VRAM", "not-a-number")]));
        let err = cfg.max_vram_override().unwrap_err();
        assert!(err.to_string().starts_with("Invalid OLLAMA_MAX_VRAM setting not-a-number"));

        let cfg = ProbeConfig::from_lookup(lookup(&[("OLLAMA_MAX_VRAM", "-5")]));
        assert!(cfg.max_vram_override().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: ProbeConfig = serde_json::from_str(r#"{"rocm_gfx_min_major": 10}"#).unwrap();
        assert_eq!(cfg.rocm_gfx_min_major, 10);
        assert_eq!(cfg.overhead_fraction_divisor, 10);
    }
}
