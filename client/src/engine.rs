//! Wiring of the synchronization components around one player.
//!
//! The engine owns the clock synchronizer, the command executor, the drift
//! checker, the correction applier and the current anchor. It is driven from
//! outside: the caller feeds it server messages and calls [`SyncEngine::tick`]
//! and [`SyncEngine::poll_timers`] on its own schedule. The clock estimate is
//! handed to the executor and checker explicitly on every call.

use crate::clock::{ClockEstimate, ClockSynchronizer};
use crate::config::SyncConfig;
use crate::correction::{AppliedCorrection, CorrectionApplier};
use crate::drift::{DriftChecker, DriftReport, DriftSample, SyncStatus};
use crate::error::ConfigError;
use crate::executor::{CommandExecutor, ExecutionOutcome, FiredCommand};
use crate::player::PlayerHandle;
use log::{debug, info, warn};
use shared::{PlaybackAnchor, SyncCommand, TimeSource};
use std::sync::Arc;

/// What a UI needs to show the sync indicator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncStatusView {
    pub status: SyncStatus,
    pub drift_ms: f64,
}

pub struct SyncEngine<P: PlayerHandle> {
    config: SyncConfig,
    time: Arc<dyn TimeSource>,
    clock: ClockSynchronizer,
    executor: CommandExecutor,
    checker: DriftChecker,
    corrector: CorrectionApplier,
    anchor: Option<PlaybackAnchor>,
    player: Option<P>,
    last_report: Option<DriftReport>,
    last_correction: Option<AppliedCorrection>,
}

impl<P: PlayerHandle> SyncEngine<P> {
    pub fn new(config: SyncConfig, time: Arc<dyn TimeSource>) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            clock: ClockSynchronizer::new(&config, Arc::clone(&time)),
            executor: CommandExecutor::new(&config, Arc::clone(&time)),
            checker: DriftChecker::new(&config, Arc::clone(&time)),
            corrector: CorrectionApplier::new(&config, Arc::clone(&time)),
            config,
            time,
            anchor: None,
            player: None,
            last_report: None,
            last_correction: None,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn clock(&self) -> &ClockSynchronizer {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut ClockSynchronizer {
        &mut self.clock
    }

    pub fn clock_estimate(&self) -> ClockEstimate {
        self.clock.estimate()
    }

    pub fn anchor(&self) -> Option<&PlaybackAnchor> {
        self.anchor.as_ref()
    }

    pub fn player(&self) -> Option<&P> {
        self.player.as_ref()
    }

    pub fn player_mut(&mut self) -> Option<&mut P> {
        self.player.as_mut()
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub fn corrector(&self) -> &CorrectionApplier {
        &self.corrector
    }

    pub fn last_correction(&self) -> Option<AppliedCorrection> {
        self.last_correction
    }

    /// Attaches `player`, returning any previously attached one.
    ///
    /// Pending commands and nudges belong to the old player and are dropped.
    pub fn attach_player(&mut self, player: P) -> Option<P> {
        let previous = self.detach_player();
        self.player = Some(player);
        info!("Player attached");
        previous
    }

    pub fn detach_player(&mut self) -> Option<P> {
        self.executor.cancel_all();
        let mut player = self.player.take()?;
        self.corrector.revert(&mut player);
        self.last_report = None;
        info!("Player detached");
        Some(player)
    }

    /// Replaces the anchor wholesale with a server snapshot.
    ///
    /// Every pending command and any soft sync nudge is cancelled, and the
    /// player's play state and rate are brought in line with the new anchor.
    /// Position is left to the next drift check.
    pub fn install_anchor(&mut self, anchor: PlaybackAnchor) {
        if let Some(current) = &self.anchor {
            if anchor.sequence_number < current.sequence_number {
                warn!(
                    "Snapshot #{} is older than current anchor #{}",
                    anchor.sequence_number, current.sequence_number
                );
            }
        }

        let cancelled = self.executor.cancel_all();
        let was_nudging = self.corrector.cancel();
        let previous_rate = self.anchor.map(|a| a.playback_rate);

        if let Some(player) = self.player.as_mut() {
            if anchor.is_playing && !player.is_playing() {
                player.play();
            } else if !anchor.is_playing && player.is_playing() {
                player.pause();
            }
            if was_nudging || previous_rate != Some(anchor.playback_rate) {
                player.set_rate(anchor.playback_rate);
            }
        }

        info!(
            "Anchor #{} installed: {} at {:.0}ms, rate {} ({} pending commands cancelled)",
            anchor.sequence_number,
            if anchor.is_playing { "playing" } else { "paused" },
            anchor.anchor_media_time_ms,
            anchor.playback_rate,
            cancelled
        );

        self.anchor = Some(anchor);
        self.last_report = None;
    }

    /// Leaves the session: the anchor is discarded and nothing stays scheduled.
    pub fn leave(&mut self) {
        self.executor.cancel_all();
        if let Some(player) = self.player.as_mut() {
            self.corrector.revert(player);
        } else {
            self.corrector.cancel();
        }
        self.anchor = None;
        self.last_report = None;
        info!("Left playback session");
    }

    /// Routes one server message: snapshots replace the anchor, everything
    /// else goes to the executor.
    pub fn handle_command(&mut self, command: SyncCommand) -> ExecutionOutcome {
        if let SyncCommand::StateSnapshot(anchor) = command {
            self.install_anchor(anchor);
            return ExecutionOutcome::Ignored;
        }

        let Some(player) = self.player.as_mut() else {
            debug!("No player attached, skipping {}", command.name());
            return ExecutionOutcome::PlayerUnavailable;
        };

        let estimate = self.clock.estimate();
        let outcome = self.executor.execute_command(command, player, &estimate);

        match outcome {
            ExecutionOutcome::Executed(fired) | ExecutionOutcome::ExecutedStale { fired, .. } => {
                self.advance_anchor(&fired);
            }
            ExecutionOutcome::Scheduled { .. }
            | ExecutionOutcome::Ignored
            | ExecutionOutcome::PlayerUnavailable => {}
        }

        outcome
    }

    /// Fires due commands and ends an expired nudge. Returns the fired commands.
    pub fn poll_timers(&mut self) -> Vec<FiredCommand> {
        let Some(player) = self.player.as_mut() else {
            return Vec::new();
        };

        let fired = self.executor.fire_due(player);
        for command in &fired {
            self.advance_anchor(command);
        }

        if let Some(player) = self.player.as_mut() {
            self.corrector.poll(player);
        }
        fired
    }

    /// One drift check plus correction.
    ///
    /// Returns `None` when there is no player or no anchor to check against.
    pub fn tick(&mut self) -> Option<DriftReport> {
        self.poll_timers();

        let anchor = self.anchor?;
        let player = self.player.as_mut()?;
        let estimate = self.clock.estimate();

        if !estimate.synced {
            let report = DriftReport::not_synced();
            self.note_status(report.status);
            self.last_report = Some(report);
            return Some(report);
        }

        let report = self.checker.check_sync(&anchor, &*player, &estimate);

        if report.status != SyncStatus::Error {
            self.last_correction = Some(self.corrector.apply(&report, &anchor, player));
        }

        self.note_status(report.status);
        self.last_report = Some(report);
        Some(report)
    }

    pub fn status(&self) -> SyncStatusView {
        match self.last_report {
            Some(report) => SyncStatusView {
                status: report.status,
                drift_ms: report.drift_ms,
            },
            None => SyncStatusView {
                status: if self.clock.is_synced() && self.anchor.is_some() {
                    SyncStatus::Synced
                } else {
                    SyncStatus::NotSynced
                },
                drift_ms: 0.0,
            },
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &DriftSample> {
        self.checker.history()
    }

    /// Earliest local time at which [`Self::poll_timers`] has work to do.
    pub fn next_deadline_ms(&self) -> Option<i64> {
        match (self.executor.next_deadline_ms(), self.corrector.next_deadline_ms()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Connection lost: the clock estimate is no longer trusted and nothing
    /// scheduled under it may fire.
    pub fn on_disconnect(&mut self) {
        self.clock.invalidate();
        self.executor.cancel_all();
        if let Some(player) = self.player.as_mut() {
            self.corrector.revert(player);
        }
        self.last_report = None;
    }

    /// Tears the engine down and hands the player back.
    pub fn destroy(mut self) -> Option<P> {
        self.anchor = None;
        self.detach_player()
    }

    pub fn now_ms(&self) -> i64 {
        self.time.now_ms()
    }

    /// Reflects a fired command in the anchor. A server rate is absolute, so
    /// a running nudge must not restore the rate it replaced.
    fn advance_anchor(&mut self, fired: &FiredCommand) {
        if let SyncCommand::SetRate { rate, .. } = fired.command {
            if self.corrector.cancel() {
                debug!("Soft sync dropped, server set rate {}", rate);
            }
        }

        match &self.anchor {
            Some(anchor) => {
                self.anchor =
                    Some(anchor.apply_command(&fired.command, fired.effect_server_time_ms));
            }
            None => {
                debug!("No anchor yet, {} not reflected", fired.command.name());
            }
        }
    }

    fn note_status(&self, status: SyncStatus) {
        let previous = self.last_report.map(|r| r.status);
        if previous != Some(status) {
            match status {
                SyncStatus::Error => warn!("Sync status: {}", status),
                _ => info!("Sync status: {}", status),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction::CorrectionState;
    use crate::drift::CorrectionAction;
    use crate::player::{PlayerCall, RecordingPlayer};
    use assert_approx_eq::assert_approx_eq;
    use shared::ManualTimeSource;

    const T0: i64 = 1_700_000_000_000;

    fn scenario_anchor() -> PlaybackAnchor {
        PlaybackAnchor {
            is_playing: true,
            playback_rate: 1.0,
            anchor_server_time_ms: T0 - 5_000,
            anchor_media_time_ms: 0.0,
            sequence_number: 1,
        }
    }

    fn synced_engine(position_ms: f64) -> (Arc<ManualTimeSource>, SyncEngine<RecordingPlayer>) {
        let clock = Arc::new(ManualTimeSource::new(T0));
        let mut engine = SyncEngine::new(SyncConfig::default(), clock.clone()).unwrap();
        let result = engine.clock_mut().begin_round().map(|_| ClockEstimate {
            synced: true,
            last_synced_at: Some(T0),
            ..ClockEstimate::unsynced()
        });
        engine.clock_mut().finish_round(result).unwrap();
        engine.attach_player(RecordingPlayer::new(position_ms, true));
        engine.install_anchor(scenario_anchor());
        engine.player_mut().unwrap().calls.clear();
        (clock, engine)
    }

    #[test]
    fn test_rejects_invalid_config() {
        let clock = Arc::new(ManualTimeSource::new(0));
        let config = SyncConfig {
            tolerance_ms: 1_000.0,
            ..SyncConfig::default()
        };
        assert!(SyncEngine::<RecordingPlayer>::new(config, clock).is_err());
    }

    #[test]
    fn test_scenario_a_synced() {
        let (_, mut engine) = synced_engine(5_000.0);

        let report = engine.tick().unwrap();

        assert_eq!(report.status, SyncStatus::Synced);
        assert_eq!(report.action, CorrectionAction::None);
        assert!(engine.player().unwrap().calls.is_empty());
    }

    #[test]
    fn test_scenario_b_soft_sync() {
        let (_, mut engine) = synced_engine(5_400.0);

        let report = engine.tick().unwrap();

        assert_approx_eq!(report.drift_ms, 400.0, 1e-9);
        assert_eq!(report.status, SyncStatus::Syncing);
        assert_eq!(report.action, CorrectionAction::SoftSync);
        assert!(engine.player().unwrap().rate < 1.0);
        assert_eq!(engine.status().status, SyncStatus::Syncing);
    }

    #[test]
    fn test_scenario_c_hard_sync() {
        let (_, mut engine) = synced_engine(6_000.0);

        let report = engine.tick().unwrap();

        assert_eq!(report.status, SyncStatus::Drifted);
        let player = engine.player().unwrap();
        assert_approx_eq!(player.position_ms, 5_000.0, 1e-9);
        assert_eq!(player.rate, 1.0);
    }

    #[test]
    fn test_scenario_d_snapshot_cancels_nudge() {
        let (clock, mut engine) = synced_engine(5_400.0);
        engine.tick();
        assert!(engine.corrector().is_active());

        let new_anchor = PlaybackAnchor {
            anchor_server_time_ms: T0,
            anchor_media_time_ms: 5_400.0,
            sequence_number: 2,
            ..scenario_anchor()
        };
        engine.handle_command(SyncCommand::StateSnapshot(new_anchor));

        assert_eq!(engine.corrector().state(), CorrectionState::Idle);
        assert_eq!(engine.next_deadline_ms(), None);
        assert_eq!(engine.player().unwrap().rate, 1.0);

        // Player keeps up with the new timeline.
        clock.advance(1_000);
        engine.player_mut().unwrap().position_ms = 6_400.0;
        let report = engine.tick().unwrap();
        assert_approx_eq!(report.drift_ms, 0.0, 1e-9);
        assert_eq!(report.status, SyncStatus::Synced);
    }

    #[test]
    fn test_soft_sync_reverts_on_timer() {
        let (clock, mut engine) = synced_engine(5_400.0);
        engine.tick();
        let deadline = engine.next_deadline_ms().unwrap();

        clock.set(deadline);
        engine.poll_timers();

        assert_eq!(engine.player().unwrap().rate, 1.0);
        assert!(!engine.corrector().is_active());
    }

    #[test]
    fn test_hard_sync_mid_soft_sync_leaves_nominal_rate() {
        let (_, mut engine) = synced_engine(5_400.0);
        engine.tick();
        engine.player_mut().unwrap().position_ms = 7_000.0;

        engine.tick();

        let player = engine.player().unwrap();
        assert_eq!(player.rate, 1.0);
        assert_eq!(player.last_seek_call(), Some(5_000.0));
        assert_eq!(engine.next_deadline_ms(), None);
    }

    #[test]
    fn test_immediate_set_rate_survives_nudge_revert() {
        let (clock, mut engine) = synced_engine(5_400.0);
        engine.tick();
        let deadline = engine.next_deadline_ms().unwrap();

        engine.handle_command(SyncCommand::SetRate {
            rate: 2.0,
            at_server_time_ms: None,
            sequence: 2,
        });
        assert!(!engine.corrector().is_active());
        assert_eq!(engine.next_deadline_ms(), None);

        clock.set(deadline);
        engine.poll_timers();
        assert_eq!(engine.player().unwrap().rate, 2.0);
        assert_eq!(engine.anchor().unwrap().playback_rate, 2.0);

        // An in-sync check afterwards has nothing to revert either.
        let calls = engine.player().unwrap().calls.len();
        let expected = engine.anchor().unwrap().expected_position_ms(clock.now_ms());
        engine.player_mut().unwrap().position_ms = expected;
        engine.tick();
        assert_eq!(engine.player().unwrap().calls.len(), calls);
        assert_eq!(engine.player().unwrap().rate, 2.0);
    }

    #[test]
    fn test_scheduled_set_rate_fired_with_expiring_nudge() {
        let (clock, mut engine) = synced_engine(5_400.0);
        engine.tick();
        let deadline = engine.next_deadline_ms().unwrap();

        let outcome = engine.handle_command(SyncCommand::SetRate {
            rate: 1.5,
            at_server_time_ms: Some(deadline),
            sequence: 2,
        });
        assert!(matches!(outcome, ExecutionOutcome::Scheduled { .. }));

        // The command and the revert fall due in the same poll.
        clock.set(deadline);
        let fired = engine.poll_timers();

        assert_eq!(fired.len(), 1);
        assert!(!engine.corrector().is_active());
        assert_eq!(engine.player().unwrap().rate, 1.5);
        assert_eq!(engine.anchor().unwrap().playback_rate, 1.5);
        assert_eq!(
            engine.player().unwrap().calls.last(),
            Some(&PlayerCall::SetRate(1.5))
        );
    }

    #[test]
    fn test_unsynced_clock_suspends_corrections() {
        let clock = Arc::new(ManualTimeSource::new(T0));
        let mut engine = SyncEngine::new(SyncConfig::default(), clock).unwrap();
        engine.attach_player(RecordingPlayer::new(60_000.0, true));
        engine.install_anchor(scenario_anchor());
        engine.player_mut().unwrap().calls.clear();

        let report = engine.tick().unwrap();

        assert_eq!(report.status, SyncStatus::NotSynced);
        assert!(engine.player().unwrap().calls.is_empty());
    }

    #[test]
    fn test_tick_without_player_or_anchor() {
        let clock = Arc::new(ManualTimeSource::new(T0));
        let mut engine: SyncEngine<RecordingPlayer> =
            SyncEngine::new(SyncConfig::default(), clock).unwrap();
        assert!(engine.tick().is_none());
        assert_eq!(
            engine.handle_command(SyncCommand::Play {
                at_server_time_ms: None,
                sequence: 1
            }),
            ExecutionOutcome::PlayerUnavailable
        );

        engine.attach_player(RecordingPlayer::new(0.0, false));
        assert!(engine.tick().is_none());
        assert_eq!(engine.status().status, SyncStatus::NotSynced);
    }

    #[test]
    fn test_checker_fault_self_heals() {
        let (_, mut engine) = synced_engine(5_000.0);
        engine.player_mut().unwrap().fail_reads = true;

        assert_eq!(engine.tick().unwrap().status, SyncStatus::Error);
        assert_eq!(engine.status().status, SyncStatus::Error);

        engine.player_mut().unwrap().fail_reads = false;
        assert_eq!(engine.tick().unwrap().status, SyncStatus::Synced);
    }

    #[test]
    fn test_fired_pause_updates_anchor() {
        let (clock, mut engine) = synced_engine(5_000.0);

        let outcome = engine.handle_command(SyncCommand::Pause {
            at_server_time_ms: Some(T0 + 300),
            sequence: 2,
        });
        assert_eq!(outcome, ExecutionOutcome::Scheduled { delay_ms: 300 });
        assert!(engine.anchor().unwrap().is_playing);

        clock.advance(300);
        let fired = engine.poll_timers();
        assert_eq!(fired.len(), 1);

        let anchor = engine.anchor().unwrap();
        assert!(!anchor.is_playing);
        assert_approx_eq!(anchor.anchor_media_time_ms, 5_300.0, 1e-9);
        assert_eq!(anchor.sequence_number, 2);
        assert_eq!(engine.player().unwrap().calls, vec![PlayerCall::Pause]);
    }

    #[test]
    fn test_snapshot_cancels_pending_commands() {
        let (clock, mut engine) = synced_engine(5_000.0);
        engine.handle_command(SyncCommand::Seek {
            target_media_time_ms: 90_000.0,
            at_server_time_ms: Some(T0 + 2_000),
            sequence: 2,
        });
        assert_eq!(engine.executor().pending_count(), 1);

        engine.install_anchor(PlaybackAnchor {
            sequence_number: 3,
            ..scenario_anchor()
        });

        clock.advance(5_000);
        assert!(engine.poll_timers().is_empty());
        assert_eq!(engine.player().unwrap().last_seek_call(), None);
    }

    #[test]
    fn test_snapshot_aligns_play_state() {
        let (_, mut engine) = synced_engine(5_000.0);

        engine.install_anchor(PlaybackAnchor {
            is_playing: false,
            sequence_number: 2,
            ..scenario_anchor()
        });
        assert_eq!(engine.player().unwrap().calls, vec![PlayerCall::Pause]);

        engine.install_anchor(PlaybackAnchor {
            playback_rate: 1.5,
            sequence_number: 3,
            ..scenario_anchor()
        });
        assert_eq!(
            engine.player().unwrap().calls,
            vec![PlayerCall::Pause, PlayerCall::Play, PlayerCall::SetRate(1.5)]
        );
    }

    #[test]
    fn test_disconnect_invalidates_and_cancels() {
        let (_, mut engine) = synced_engine(5_400.0);
        engine.tick();
        engine.handle_command(SyncCommand::Play {
            at_server_time_ms: Some(T0 + 10_000),
            sequence: 2,
        });

        engine.on_disconnect();

        assert!(!engine.clock().is_synced());
        assert_eq!(engine.next_deadline_ms(), None);
        assert_eq!(engine.player().unwrap().rate, 1.0);
        assert_eq!(engine.status().status, SyncStatus::NotSynced);
    }

    #[test]
    fn test_round_in_flight_at_disconnect_keeps_corrections_off() {
        let (_, mut engine) = synced_engine(6_000.0);
        let round = engine.clock_mut().begin_round().map(|_| ClockEstimate {
            synced: true,
            last_synced_at: Some(T0),
            ..ClockEstimate::unsynced()
        });

        engine.on_disconnect();
        assert!(engine.clock_mut().finish_round(round).is_err());

        let report = engine.tick().unwrap();
        assert_eq!(report.status, SyncStatus::NotSynced);
        assert_eq!(engine.player().unwrap().last_seek_call(), None);
    }

    #[test]
    fn test_leave_and_destroy() {
        let (_, mut engine) = synced_engine(5_000.0);
        engine.handle_command(SyncCommand::Pause {
            at_server_time_ms: Some(T0 + 10_000),
            sequence: 2,
        });

        engine.leave();
        assert!(engine.anchor().is_none());
        assert_eq!(engine.executor().pending_count(), 0);
        assert!(engine.tick().is_none());

        let player = engine.destroy().unwrap();
        assert!(player.calls.is_empty());
    }

    #[test]
    fn test_history_records_ticks() {
        let (clock, mut engine) = synced_engine(5_000.0);
        for _ in 0..3 {
            engine.tick();
            clock.advance(1_000);
            engine.player_mut().unwrap().position_ms += 1_000.0;
        }
        assert_eq!(engine.history().count(), 3);
        assert!(engine.history().all(|s| s.status == SyncStatus::Synced));
    }
}
