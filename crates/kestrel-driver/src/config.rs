//! Device configuration
//!
//! Mirrors the tunables the kernel module used to take as module
//! parameters: queue size, firmware log severity, profiling state.

use crate::error::{KestrelError, Result};
use kestrel_chip::fw::{LogSeverity, MAX_HW_COUNTERS};

/// Smallest supported mailbox queue capacity. Must leave room for at least
/// one maximum-interest message (header + inference request) plus the
/// reserved slot.
pub const MIN_QUEUE_CAPACITY: u32 = 64;

/// Device-wide configuration, fixed at bring-up.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Capacity in bytes of each mailbox queue direction. Power of two.
    pub queue_capacity: u32,

    /// Log severity threshold negotiated with the firmware. The firmware
    /// does not emit text messages above this level.
    pub log_severity: LogSeverity,

    /// Profiling state applied to every core at bring-up and restored
    /// after every core reset.
    pub profiling: ProfilingConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 65536,
            log_severity: LogSeverity::Info,
            profiling: ProfilingConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `KestrelError::Config` if the queue capacity is not a power
    /// of two, is below [`MIN_QUEUE_CAPACITY`], or the profiling
    /// configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if !self.queue_capacity.is_power_of_two() {
            return Err(KestrelError::config(format!(
                "queue capacity {} is not a power of two",
                self.queue_capacity
            )));
        }

        if self.queue_capacity < MIN_QUEUE_CAPACITY {
            return Err(KestrelError::config(format!(
                "queue capacity {} below minimum {MIN_QUEUE_CAPACITY}",
                self.queue_capacity
            )));
        }

        self.profiling.validate()
    }
}

/// Firmware profiling configuration.
///
/// Committed to a core only after the firmware acknowledges the matching
/// reconfiguration message; see the profiling module.
#[derive(Debug, Clone, Default)]
pub struct ProfilingConfig {
    /// Whether the firmware should emit profiling entries.
    pub enabled: bool,

    /// Capacity of the firmware-written profiling ring, in entries.
    /// Ignored when disabled.
    pub buffer_entries: u32,

    /// Hardware counter ids to sample, at most [`MAX_HW_COUNTERS`].
    pub hw_counters: Vec<u32>,
}

impl ProfilingConfig {
    /// Validate the profiling configuration.
    ///
    /// # Errors
    ///
    /// Returns `KestrelError::Config` if too many hardware counters are
    /// selected or profiling is enabled with a zero-entry buffer.
    pub fn validate(&self) -> Result<()> {
        if self.hw_counters.len() > MAX_HW_COUNTERS {
            return Err(KestrelError::config(format!(
                "{} hardware counters selected, maximum is {MAX_HW_COUNTERS}",
                self.hw_counters.len()
            )));
        }

        if self.enabled && self.buffer_entries == 0 {
            return Err(KestrelError::config(
                "profiling enabled with an empty buffer",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(DeviceConfig::default().validate().is_ok());
    }

    #[test]
    fn non_power_of_two_capacity_rejected() {
        let cfg = DeviceConfig {
            queue_capacity: 1000,
            ..DeviceConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(KestrelError::Config { .. })
        ));
    }

    #[test]
    fn tiny_capacity_rejected() {
        let cfg = DeviceConfig {
            queue_capacity: 32,
            ..DeviceConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn too_many_hw_counters_rejected() {
        let cfg = ProfilingConfig {
            enabled: true,
            buffer_entries: 64,
            hw_counters: vec![0; MAX_HW_COUNTERS + 1],
        };
        assert!(cfg.validate().is_err());
    }
}
