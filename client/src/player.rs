//! Media player capability consumed by the engine.

use crate::error::PlayerError;
use shared::{TimeSource, NOMINAL_PLAYBACK_RATE};
use std::sync::Arc;

/// Operations the engine needs from a media player.
///
/// Only the command executor and the correction applier mutate the player,
/// and only one engine should be attached to a given player at a time.
pub trait PlayerHandle {
    fn play(&mut self);
    fn pause(&mut self);
    fn seek(&mut self, position_ms: f64);
    fn set_rate(&mut self, rate: f64);
    fn current_time_ms(&self) -> Result<f64, PlayerError>;
    fn is_playing(&self) -> bool;
}

/// Player whose position advances with a time source.
///
/// `speed_error_ppm` makes the simulated decoder run slightly fast or slow,
/// which is what real players do and what the drift checker exists to fix.
pub struct SimulatedPlayer {
    time: Arc<dyn TimeSource>,
    position_ms: f64,
    last_update_ms: i64,
    rate: f64,
    playing: bool,
    speed_error_ppm: f64,
}

impl SimulatedPlayer {
    pub fn new(time: Arc<dyn TimeSource>) -> Self {
        let now = time.now_ms();
        Self {
            time,
            position_ms: 0.0,
            last_update_ms: now,
            rate: NOMINAL_PLAYBACK_RATE,
            playing: false,
            speed_error_ppm: 0.0,
        }
    }

    pub fn with_speed_error(mut self, ppm: f64) -> Self {
        self.speed_error_ppm = ppm;
        self
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    fn position_at(&self, now_ms: i64) -> f64 {
        if !self.playing {
            return self.position_ms;
        }
        let elapsed = (now_ms - self.last_update_ms) as f64;
        let speed = self.rate * (1.0 + self.speed_error_ppm / 1_000_000.0);
        (self.position_ms + elapsed * speed).max(0.0)
    }

    fn settle(&mut self) {
        let now = self.time.now_ms();
        self.position_ms = self.position_at(now);
        self.last_update_ms = now;
    }
}

impl PlayerHandle for SimulatedPlayer {
    fn play(&mut self) {
        self.settle();
        self.playing = true;
    }

    fn pause(&mut self) {
        self.settle();
        self.playing = false;
    }

    fn seek(&mut self, position_ms: f64) {
        self.settle();
        self.position_ms = position_ms.max(0.0);
    }

    fn set_rate(&mut self, rate: f64) {
        self.settle();
        self.rate = rate;
    }

    fn current_time_ms(&self) -> Result<f64, PlayerError> {
        Ok(self.position_at(self.time.now_ms()))
    }

    fn is_playing(&self) -> bool {
        self.playing
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlayerCall {
    Play,
    Pause,
    Seek(f64),
    SetRate(f64),
}

/// Player with a hand-set position that records every mutation.
///
/// Useful wherever the position must be pinned, such as diagnostics and
/// tests of the correction path.
#[derive(Debug, Clone)]
pub struct RecordingPlayer {
    pub position_ms: f64,
    pub playing: bool,
    pub rate: f64,
    pub calls: Vec<PlayerCall>,
    pub fail_reads: bool,
}

impl RecordingPlayer {
    pub fn new(position_ms: f64, playing: bool) -> Self {
        Self {
            position_ms,
            playing,
            rate: NOMINAL_PLAYBACK_RATE,
            calls: Vec::new(),
            fail_reads: false,
        }
    }

    pub fn last_seek_call(&self) -> Option<f64> {
        self.calls.iter().rev().find_map(|call| match call {
            PlayerCall::Seek(position) => Some(*position),
            _ => None,
        })
    }
}

impl PlayerHandle for RecordingPlayer {
    fn play(&mut self) {
        self.calls.push(PlayerCall::Play);
        self.playing = true;
    }

    fn pause(&mut self) {
        self.calls.push(PlayerCall::Pause);
        self.playing = false;
    }

    fn seek(&mut self, position_ms: f64) {
        self.calls.push(PlayerCall::Seek(position_ms));
        self.position_ms = position_ms;
    }

    fn set_rate(&mut self, rate: f64) {
        self.calls.push(PlayerCall::SetRate(rate));
        self.rate = rate;
    }

    fn current_time_ms(&self) -> Result<f64, PlayerError> {
        if self.fail_reads {
            return Err(PlayerError::Backend("position unavailable".to_string()));
        }
        Ok(self.position_ms)
    }

    fn is_playing(&self) -> bool {
        self.playing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::ManualTimeSource;

    #[test]
    fn test_simulated_player_advances_only_while_playing() {
        let clock = Arc::new(ManualTimeSource::new(0));
        let mut player = SimulatedPlayer::new(clock.clone());

        clock.advance(1_000);
        assert_eq!(player.current_time_ms().unwrap(), 0.0);

        player.play();
        clock.advance(2_000);
        assert_approx_eq!(player.current_time_ms().unwrap(), 2_000.0, 1e-9);

        player.pause();
        clock.advance(5_000);
        assert_approx_eq!(player.current_time_ms().unwrap(), 2_000.0, 1e-9);
    }

    #[test]
    fn test_simulated_player_rate_and_seek() {
        let clock = Arc::new(ManualTimeSource::new(0));
        let mut player = SimulatedPlayer::new(clock.clone());

        player.seek(10_000.0);
        player.play();
        player.set_rate(0.5);
        clock.advance(1_000);
        assert_approx_eq!(player.current_time_ms().unwrap(), 10_500.0, 1e-9);
        assert_eq!(player.rate(), 0.5);
    }

    #[test]
    fn test_simulated_player_speed_error() {
        let clock = Arc::new(ManualTimeSource::new(0));
        let mut player = SimulatedPlayer::new(clock.clone()).with_speed_error(1_000.0);

        player.play();
        clock.advance(10_000);
        assert_approx_eq!(player.current_time_ms().unwrap(), 10_010.0, 1e-6);
    }

    #[test]
    fn test_recording_player_records_calls() {
        let mut player = RecordingPlayer::new(0.0, false);
        player.play();
        player.seek(42.0);
        player.set_rate(1.05);
        player.pause();

        assert_eq!(
            player.calls,
            vec![
                PlayerCall::Play,
                PlayerCall::Seek(42.0),
                PlayerCall::SetRate(1.05),
                PlayerCall::Pause
            ]
        );
        assert_eq!(player.last_seek_call(), Some(42.0));
    }

    #[test]
    fn test_recording_player_fault() {
        let mut player = RecordingPlayer::new(0.0, true);
        player.fail_reads = true;
        assert!(matches!(
            player.current_time_ms(),
            Err(PlayerError::Backend(_))
        ));
    }
}
