//! Drift detection against the playback anchor.
//!
//! Drift is `actual - expected` in media milliseconds, so a positive value
//! means the local player is ahead of the authoritative timeline. Each check
//! is classified from scratch; nothing about the previous tick carries over.

use crate::clock::ClockEstimate;
use crate::config::SyncConfig;
use crate::player::PlayerHandle;
use log::{debug, warn};
use shared::{PlaybackAnchor, TimeSource};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// No valid clock estimate yet, corrections suspended
    NotSynced,
    Synced,
    Syncing,
    Drifted,
    /// The last check failed; clears on the next good tick
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SyncStatus::NotSynced => "not_synced",
            SyncStatus::Synced => "synced",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Drifted => "drifted",
            SyncStatus::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionAction {
    None,
    SoftSync,
    HardSync,
}

impl fmt::Display for CorrectionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CorrectionAction::None => "none",
            CorrectionAction::SoftSync => "soft_sync",
            CorrectionAction::HardSync => "hard_sync",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftReport {
    pub drift_ms: f64,
    pub status: SyncStatus,
    pub action: CorrectionAction,
    pub expected_position_ms: f64,
}

impl DriftReport {
    pub fn not_synced() -> Self {
        Self {
            drift_ms: 0.0,
            status: SyncStatus::NotSynced,
            action: CorrectionAction::None,
            expected_position_ms: 0.0,
        }
    }

    fn error(expected_position_ms: f64) -> Self {
        Self {
            drift_ms: 0.0,
            status: SyncStatus::Error,
            action: CorrectionAction::None,
            expected_position_ms,
        }
    }
}

/// One entry of the diagnostic drift history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftSample {
    pub timestamp_ms: i64,
    pub drift_ms: f64,
    pub status: SyncStatus,
    pub action: CorrectionAction,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftThresholds {
    pub tolerance_ms: f64,
    pub hard_sync_threshold_ms: f64,
}

impl DriftThresholds {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            tolerance_ms: config.tolerance_ms,
            hard_sync_threshold_ms: config.hard_sync_threshold_ms,
        }
    }

    /// Drift exactly at the tolerance still counts as synced; drift exactly
    /// at the hard threshold already needs a seek.
    pub fn classify(&self, drift_ms: f64) -> (SyncStatus, CorrectionAction) {
        let magnitude = drift_ms.abs();
        if magnitude <= self.tolerance_ms {
            (SyncStatus::Synced, CorrectionAction::None)
        } else if magnitude < self.hard_sync_threshold_ms {
            (SyncStatus::Syncing, CorrectionAction::SoftSync)
        } else {
            (SyncStatus::Drifted, CorrectionAction::HardSync)
        }
    }
}

pub struct DriftChecker {
    time: Arc<dyn TimeSource>,
    thresholds: DriftThresholds,
    history: VecDeque<DriftSample>,
    max_history: usize,
}

impl DriftChecker {
    pub fn new(config: &SyncConfig, time: Arc<dyn TimeSource>) -> Self {
        Self {
            time,
            thresholds: DriftThresholds::from_config(config),
            history: VecDeque::with_capacity(config.drift_history_len),
            max_history: config.drift_history_len,
        }
    }

    pub fn thresholds(&self) -> DriftThresholds {
        self.thresholds
    }

    pub fn check_sync(
        &mut self,
        anchor: &PlaybackAnchor,
        player: &dyn PlayerHandle,
        clock: &ClockEstimate,
    ) -> DriftReport {
        let now = self.time.now_ms();
        let server_now = clock.server_time_ms(now);
        let expected = anchor.expected_position_ms(server_now);

        let report = match player.current_time_ms() {
            Ok(actual) if actual.is_finite() => {
                let drift_ms = actual - expected;
                let (status, action) = self.thresholds.classify(drift_ms);
                debug!(
                    "Drift {:+.0}ms (actual {:.0}, expected {:.0}) -> {} / {}",
                    drift_ms, actual, expected, status, action
                );
                DriftReport {
                    drift_ms,
                    status,
                    action,
                    expected_position_ms: expected,
                }
            }
            Ok(actual) => {
                warn!("Drift check failed: player reported position {}", actual);
                DriftReport::error(expected)
            }
            Err(e) => {
                warn!("Drift check failed: {}", e);
                DriftReport::error(expected)
            }
        };

        self.record(now, &report);
        report
    }

    pub fn history(&self) -> impl Iterator<Item = &DriftSample> {
        self.history.iter()
    }

    pub fn last_sample(&self) -> Option<&DriftSample> {
        self.history.back()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    fn record(&mut self, timestamp_ms: i64, report: &DriftReport) {
        if self.max_history == 0 {
            return;
        }
        self.history.push_back(DriftSample {
            timestamp_ms,
            drift_ms: report.drift_ms,
            status: report.status,
            action: report.action,
        });
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
    }
}
