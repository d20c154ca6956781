//! Applies drift corrections to the player.
//!
//! At most one soft sync nudge exists at a time. It lives in a single slot
//! together with its revert deadline, so starting a new nudge always
//! replaces the old one and a hard sync always clears it.

use crate::config::SyncConfig;
use crate::drift::{CorrectionAction, DriftReport};
use crate::player::PlayerHandle;
use log::{debug, info};
use shared::{PlaybackAnchor, TimeSource};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CorrectionState {
    Idle,
    SoftSync {
        rate: f64,
        nominal_rate: f64,
        revert_at_ms: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AppliedCorrection {
    Nothing,
    /// An active nudge was ended and the nominal rate restored
    Reverted,
    SoftSync { rate: f64, duration_ms: i64 },
    /// Soft sync only runs while playing
    SoftSyncSkipped,
    HardSync { target_ms: f64 },
}

pub struct CorrectionApplier {
    time: Arc<dyn TimeSource>,
    rate_factor: f64,
    max_duration_ms: f64,
    state: CorrectionState,
}

impl CorrectionApplier {
    pub fn new(config: &SyncConfig, time: Arc<dyn TimeSource>) -> Self {
        Self {
            time,
            rate_factor: config.soft_sync_rate_factor,
            max_duration_ms: config.max_soft_sync_duration_ms,
            state: CorrectionState::Idle,
        }
    }

    pub fn state(&self) -> CorrectionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, CorrectionState::SoftSync { .. })
    }

    pub fn active_rate(&self) -> Option<f64> {
        match self.state {
            CorrectionState::SoftSync { rate, .. } => Some(rate),
            CorrectionState::Idle => None,
        }
    }

    pub fn next_deadline_ms(&self) -> Option<i64> {
        match self.state {
            CorrectionState::SoftSync { revert_at_ms, .. } => Some(revert_at_ms),
            CorrectionState::Idle => None,
        }
    }

    pub fn apply(
        &mut self,
        report: &DriftReport,
        anchor: &PlaybackAnchor,
        player: &mut dyn PlayerHandle,
    ) -> AppliedCorrection {
        match report.action {
            CorrectionAction::None => {
                if self.revert(player) {
                    AppliedCorrection::Reverted
                } else {
                    AppliedCorrection::Nothing
                }
            }
            CorrectionAction::SoftSync => self.soft_sync(report.drift_ms, anchor, player),
            CorrectionAction::HardSync => {
                let target_ms = report.expected_position_ms;
                info!(
                    "Hard sync: drift {:+.0}ms, seeking to {:.0}ms",
                    report.drift_ms, target_ms
                );
                self.state = CorrectionState::Idle;
                player.seek(target_ms);
                player.set_rate(anchor.playback_rate);
                AppliedCorrection::HardSync { target_ms }
            }
        }
    }

    /// Ends the nudge once its deadline has passed. Returns true if it did.
    pub fn poll(&mut self, player: &mut dyn PlayerHandle) -> bool {
        match self.state {
            CorrectionState::SoftSync { revert_at_ms, .. }
                if self.time.now_ms() >= revert_at_ms =>
            {
                self.revert(player)
            }
            _ => false,
        }
    }

    /// Forgets any active nudge without touching the player. The caller is
    /// expected to set the rate itself, e.g. from a freshly installed anchor.
    pub fn cancel(&mut self) -> bool {
        let was_active = self.is_active();
        self.state = CorrectionState::Idle;
        was_active
    }

    fn soft_sync(
        &mut self,
        drift_ms: f64,
        anchor: &PlaybackAnchor,
        player: &mut dyn PlayerHandle,
    ) -> AppliedCorrection {
        let nominal_rate = anchor.playback_rate;
        if !anchor.is_playing || !player.is_playing() || nominal_rate <= 0.0 {
            self.revert(player);
            return AppliedCorrection::SoftSyncSkipped;
        }

        // Ahead slows down, behind speeds up.
        let rate = if drift_ms > 0.0 {
            nominal_rate * (1.0 - self.rate_factor)
        } else {
            nominal_rate * (1.0 + self.rate_factor)
        };

        let catch_up_ms = drift_ms.abs() / (nominal_rate * self.rate_factor);
        let duration_ms = catch_up_ms.min(self.max_duration_ms).round() as i64;

        debug!(
            "Soft sync: drift {:+.0}ms, rate {:.3} for {}ms",
            drift_ms, rate, duration_ms
        );

        player.set_rate(rate);
        self.state = CorrectionState::SoftSync {
            rate,
            nominal_rate,
            revert_at_ms: self.time.now_ms() + duration_ms,
        };

        AppliedCorrection::SoftSync { rate, duration_ms }
    }

    /// Ends any active nudge right away, restoring the nominal rate.
    pub fn revert(&mut self, player: &mut dyn PlayerHandle) -> bool {
        match self.state {
            CorrectionState::SoftSync { nominal_rate, .. } => {
                debug!("Soft sync finished, restoring rate {:.3}", nominal_rate);
                player.set_rate(nominal_rate);
                self.state = CorrectionState::Idle;
                true
            }
            CorrectionState::Idle => false,
        }
    }
}
