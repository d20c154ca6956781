//! Tuning options for the synchronization engine.

use crate::error::ConfigError;
use std::time::Duration;

/// Recognized engine options with their defaults.
///
/// Thresholds are in milliseconds of media drift; intervals and delays are in
/// milliseconds of wall-clock time.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Probe round trips per clock sync round
    pub sample_count: u32,
    /// Pause between consecutive probes
    pub inter_sample_delay_ms: u64,
    /// Per-probe timeout; a timed out probe is dropped
    pub probe_timeout_ms: u64,
    /// Periodic clock resync interval
    pub resync_interval_ms: u64,
    /// Drift check tick interval
    pub check_interval_ms: u64,
    /// Drift below this is considered in sync
    pub tolerance_ms: f64,
    /// Drift at or above this triggers a seek
    pub hard_sync_threshold_ms: f64,
    /// Fractional rate change applied during a soft sync
    pub soft_sync_rate_factor: f64,
    /// Upper bound on how long a soft sync nudge may last
    pub max_soft_sync_duration_ms: f64,
    /// Commands further out than this are put on a timer
    pub schedule_ahead_threshold_ms: i64,
    /// Commands later than this are reported as stale
    pub stale_command_threshold_ms: i64,
    /// Number of drift samples kept for diagnostics
    pub drift_history_len: usize,
    /// Run clock sync on connect and on the resync interval
    pub auto_sync: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sample_count: 5,
            inter_sample_delay_ms: 100,
            probe_timeout_ms: 5_000,
            resync_interval_ms: 30_000,
            check_interval_ms: 1_000,
            tolerance_ms: 250.0,
            hard_sync_threshold_ms: 750.0,
            soft_sync_rate_factor: 0.05,
            max_soft_sync_duration_ms: 3_000.0,
            schedule_ahead_threshold_ms: 50,
            stale_command_threshold_ms: 1_000,
            drift_history_len: 60,
            auto_sync: true,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_count == 0 {
            return Err(ConfigError::NotPositive {
                name: "sample_count",
            });
        }
        if self.probe_timeout_ms == 0 {
            return Err(ConfigError::NotPositive {
                name: "probe_timeout_ms",
            });
        }
        if self.check_interval_ms == 0 {
            return Err(ConfigError::NotPositive {
                name: "check_interval_ms",
            });
        }
        if self.resync_interval_ms == 0 {
            return Err(ConfigError::NotPositive {
                name: "resync_interval_ms",
            });
        }
        if self.tolerance_ms <= 0.0 {
            return Err(ConfigError::NotPositive {
                name: "tolerance_ms",
            });
        }
        if self.max_soft_sync_duration_ms <= 0.0 {
            return Err(ConfigError::NotPositive {
                name: "max_soft_sync_duration_ms",
            });
        }
        if self.tolerance_ms >= self.hard_sync_threshold_ms {
            return Err(ConfigError::ThresholdOrder {
                tolerance_ms: self.tolerance_ms,
                hard_ms: self.hard_sync_threshold_ms,
            });
        }
        if !(self.soft_sync_rate_factor > 0.0 && self.soft_sync_rate_factor < 1.0) {
            return Err(ConfigError::RateFactor(self.soft_sync_rate_factor));
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn inter_sample_delay(&self) -> Duration {
        Duration::from_millis(self.inter_sample_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sample_count, 5);
        assert_eq!(config.inter_sample_delay_ms, 100);
        assert_eq!(config.resync_interval_ms, 30_000);
        assert_eq!(config.check_interval_ms, 1_000);
        assert!(config.auto_sync);
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let config = SyncConfig {
            tolerance_ms: 800.0,
            hard_sync_threshold_ms: 800.0,
            ..SyncConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ThresholdOrder { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_rate_factor() {
        for factor in [0.0, -0.1, 1.0, 2.5] {
            let config = SyncConfig {
                soft_sync_rate_factor: factor,
                ..SyncConfig::default()
            };
            assert_eq!(config.validate(), Err(ConfigError::RateFactor(factor)));
        }
    }

    #[test]
    fn test_rejects_zero_samples() {
        let config = SyncConfig {
            sample_count: 0,
            ..SyncConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::NotPositive {
                name: "sample_count"
            })
        );
    }

    #[test]
    fn test_duration_helpers() {
        let config = SyncConfig::default();
        assert_eq!(config.check_interval(), Duration::from_secs(1));
        assert_eq!(config.resync_interval(), Duration::from_secs(30));
        assert_eq!(config.probe_timeout(), Duration::from_secs(5));
        assert_eq!(config.inter_sample_delay(), Duration::from_millis(100));
    }
}
