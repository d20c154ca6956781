//! Authoritative playback state for one room
//!
//! The room owns the canonical anchor. Operator actions become timed
//! commands that take effect a short lead time in the future, so every
//! client has the chance to receive the command before it is due and all of
//! them switch on the same server instant.

use log::info;
use shared::{PlaybackAnchor, SyncCommand, TimeSource};
use std::sync::Arc;

/// Default delay between issuing a command and its effect time.
pub const DEFAULT_COMMAND_LEAD_MS: i64 = 300;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RoomError {
    #[error("playback rate must be positive and finite, got {0}")]
    InvalidRate(f64),
    #[error("seek target must be a non-negative position, got {0}ms")]
    InvalidPosition(f64),
}

pub struct PlaybackRoom {
    time: Arc<dyn TimeSource>,
    anchor: PlaybackAnchor,
    command_lead_ms: i64,
    next_sequence: u64,
    last_effect_ms: Option<i64>,
}

impl PlaybackRoom {
    /// Creates a room paused at the start of the media.
    pub fn new(time: Arc<dyn TimeSource>, command_lead_ms: i64) -> Self {
        let anchor = PlaybackAnchor::paused_at(time.now_ms(), 0.0);
        Self {
            time,
            anchor,
            command_lead_ms: command_lead_ms.max(0),
            next_sequence: 1,
            last_effect_ms: None,
        }
    }

    pub fn anchor(&self) -> &PlaybackAnchor {
        &self.anchor
    }

    pub fn command_lead_ms(&self) -> i64 {
        self.command_lead_ms
    }

    /// Returns `None` when already playing.
    pub fn play(&mut self) -> Option<SyncCommand> {
        if self.anchor.is_playing {
            return None;
        }
        Some(self.issue(|at, sequence| SyncCommand::Play {
            at_server_time_ms: Some(at),
            sequence,
        }))
    }

    /// Returns `None` when already paused.
    pub fn pause(&mut self) -> Option<SyncCommand> {
        if !self.anchor.is_playing {
            return None;
        }
        Some(self.issue(|at, sequence| SyncCommand::Pause {
            at_server_time_ms: Some(at),
            sequence,
        }))
    }

    pub fn seek(&mut self, target_media_time_ms: f64) -> Result<SyncCommand, RoomError> {
        if !target_media_time_ms.is_finite() || target_media_time_ms < 0.0 {
            return Err(RoomError::InvalidPosition(target_media_time_ms));
        }
        Ok(self.issue(|at, sequence| SyncCommand::Seek {
            target_media_time_ms,
            at_server_time_ms: Some(at),
            sequence,
        }))
    }

    pub fn set_rate(&mut self, rate: f64) -> Result<SyncCommand, RoomError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(RoomError::InvalidRate(rate));
        }
        Ok(self.issue(|at, sequence| SyncCommand::SetRate {
            rate,
            at_server_time_ms: Some(at),
            sequence,
        }))
    }

    /// Current anchor re-expressed at `now`.
    ///
    /// Only meaningful outside the lead window: while a command is pending,
    /// the anchor already describes the timeline from its effect time on.
    pub fn snapshot(&self) -> PlaybackAnchor {
        let now = self.time.now_ms();
        if now >= self.anchor.anchor_server_time_ms {
            self.anchor.rebased(now)
        } else {
            self.anchor
        }
    }

    /// True while the most recent command has not taken effect yet.
    pub fn in_lead_window(&self) -> bool {
        self.lead_window_remaining_ms() > 0
    }

    pub fn lead_window_remaining_ms(&self) -> i64 {
        match self.last_effect_ms {
            Some(effect) => (effect - self.time.now_ms()).max(0),
            None => 0,
        }
    }

    pub fn status_line(&self) -> String {
        let now = self.time.now_ms();
        format!(
            "#{} {} at {:.0}ms, rate {}",
            self.anchor.sequence_number,
            if self.anchor.is_playing {
                "playing"
            } else {
                "paused"
            },
            self.anchor.expected_position_ms(now.max(self.anchor.anchor_server_time_ms)),
            self.anchor.playback_rate
        )
    }

    fn issue(&mut self, build: impl FnOnce(i64, u64) -> SyncCommand) -> SyncCommand {
        let effect = self.time.now_ms() + self.command_lead_ms;
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let command = build(effect, sequence);
        self.anchor = self.anchor.apply_command(&command, effect);
        self.last_effect_ms = Some(effect);

        info!(
            "Issued {} #{} effective at {}",
            command.name(),
            sequence,
            effect
        );
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::ManualTimeSource;

    const T0: i64 = 1_700_000_000_000;

    fn room() -> (Arc<ManualTimeSource>, PlaybackRoom) {
        let clock = Arc::new(ManualTimeSource::new(T0));
        let room = PlaybackRoom::new(clock.clone(), DEFAULT_COMMAND_LEAD_MS);
        (clock, room)
    }

    #[test]
    fn test_room_starts_paused_at_zero() {
        let (clock, room) = room();
        clock.advance(10_000);

        let snapshot = room.snapshot();
        assert!(!snapshot.is_playing);
        assert_approx_eq!(snapshot.anchor_media_time_ms, 0.0, 1e-9);
        assert!(!room.in_lead_window());
    }

    #[test]
    fn test_play_is_scheduled_after_lead() {
        let (clock, mut room) = room();

        let command = room.play().unwrap();
        assert_eq!(command.effect_time_ms(), Some(T0 + 300));
        assert_eq!(command.sequence(), 1);
        assert!(room.in_lead_window());
        assert_eq!(room.lead_window_remaining_ms(), 300);

        clock.advance(1_300);
        assert!(!room.in_lead_window());
        let snapshot = room.snapshot();
        assert!(snapshot.is_playing);
        assert_approx_eq!(snapshot.anchor_media_time_ms, 1_000.0, 1e-9);
        assert_eq!(snapshot.anchor_server_time_ms, T0 + 1_300);
    }

    #[test]
    fn test_redundant_play_and_pause_issue_nothing() {
        let (_, mut room) = room();
        assert!(room.pause().is_none());
        assert!(room.play().is_some());
        assert!(room.play().is_none());
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let (_, mut room) = room();
        let a = room.play().unwrap().sequence();
        let b = room.seek(5_000.0).unwrap().sequence();
        let c = room.set_rate(1.5).unwrap().sequence();
        assert!(a < b && b < c);
        assert_eq!(room.anchor().sequence_number, c);
    }

    #[test]
    fn test_seek_and_rate_validation() {
        let (_, mut room) = room();
        assert_eq!(room.seek(-1.0), Err(RoomError::InvalidPosition(-1.0)));
        assert!(matches!(room.seek(f64::NAN), Err(RoomError::InvalidPosition(_))));
        assert_eq!(room.set_rate(0.0), Err(RoomError::InvalidRate(0.0)));
        assert!(room.set_rate(f64::INFINITY).is_err());
        // Rejected operations consume no sequence number.
        assert_eq!(room.seek(0.0).unwrap().sequence(), 1);
    }

    #[test]
    fn test_seek_while_playing_continues_from_target() {
        let (clock, mut room) = room();
        room.play();
        clock.advance(2_000);
        room.seek(60_000.0).unwrap();
        clock.advance(1_300);

        let snapshot = room.snapshot();
        assert_approx_eq!(snapshot.anchor_media_time_ms, 61_000.0, 1e-9);
    }

    #[test]
    fn test_snapshot_inside_lead_window_is_not_rebased() {
        let (_, mut room) = room();
        room.play();

        let snapshot = room.snapshot();
        assert_eq!(snapshot.anchor_server_time_ms, T0 + 300);
        assert!(snapshot.is_playing);
    }

    #[test]
    fn test_status_line_mentions_state() {
        let (_, mut room) = room();
        assert!(room.status_line().contains("paused"));
        room.play();
        assert!(room.status_line().contains("playing"));
    }
}
