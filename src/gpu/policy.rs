//! VRAM overhead policy.

use crate::config::ProbeConfig;

pub const GIB: u64 = 1024 * 1024 * 1024;

/// How much VRAM to hold back from the reported free memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverheadPolicy {
    /// Reserve at least `free / fraction_divisor`.
    pub fraction_divisor: u64,
    /// Reserve at least this much per device.
    pub floor_per_device: u64,
    /// The GPU uses OS-managed system memory; nothing is reserved.
    pub unified_memory: bool,
}

impl Default for OverheadPolicy {
    fn default() -> Self {
        Self {
            fraction_divisor: 10,
            floor_per_device: GIB,
            unified_memory: false,
        }
    }
}

impl OverheadPolicy {
    pub fn from_config(config: &ProbeConfig) -> Self {
        Self {
            fraction_divisor: config.overhead_fraction_divisor,
            floor_per_device: config.overhead_floor_per_device,
            unified_memory: config.unified_memory(),
        }
    }

    /// Bytes reserved for driver and runtime bookkeeping.
    pub fn reserved_overhead(&self, free: u64, device_count: u32) -> u64 {
        if self.unified_memory {
            return 0;
        }
        let fraction = free.checked_div(self.fraction_divisor).unwrap_or(0);
        let floor = self.floor_per_device.saturating_mul(u64::from(device_count));
        fraction.max(floor)
    }

    /// Free memory left after the overhead reserve.
    pub fn usable_vram(&self, free: u64, device_count: u32) -> u64 {
        free.saturating_sub(self.reserved_overhead(free, device_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fraction_dominates_with_one_device() {
        let policy = OverheadPolicy::default();
        assert_eq!(policy.reserved_overhead(100 * GIB, 1), 10 * GIB);
        assert_eq!(policy.usable_vram(100 * GIB, 1), 90 * GIB);
    }

    #[test]
    fn test_floor_dominates_with_many_devices() {
        let policy = OverheadPolicy::default();
        assert_eq!(policy.reserved_overhead(100 * GIB, 20), 20 * GIB);
        assert_eq!(policy.usable_vram(100 * GIB, 20), 80 * GIB);
    }

    #[test]
    fn test_unified_memory_reserves_nothing() {
        let policy = OverheadPolicy {
            unified_memory: true,
            ..Default::default()
        };
        assert_eq!(policy.usable_vram(100 * GIB, 20), 100 * GIB);
    }

    #[test]
    fn test_usable_vram_saturates() {
        let policy = OverheadPolicy::default();
        assert_eq!(policy.usable_vram(GIB / 2, 1), 0);
    }

    #[test]
    fn test_policy_from_config() {
        let config = ProbeConfig {
            jetpack: Some("5.1".to_string()),
            ..Default::default()
        };
        assert!(OverheadPolicy::from_config(&config).unified_memory);
        assert_eq!(
            OverheadPolicy::from_config(&ProbeConfig::default()),
            OverheadPolicy::default()
        );
    }
}
