use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_PACKET_SIZE: usize = 2048;
pub const NOMINAL_PLAYBACK_RATE: f64 = 1.0;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    Connect {
        client_version: u32,
    },
    TimeProbe {
        client_send_time_ms: i64,
    },
    RequestResync,
    /// Keeps the connection alive between clock syncs
    Heartbeat,
    Disconnect,

    Connected {
        client_id: u32,
    },
    TimeProbeResponse {
        client_send_time_ms: i64,
        server_time_ms: i64,
    },
    Command(SyncCommand),
    StateSnapshot(PlaybackAnchor),
    Disconnected {
        reason: String,
    },
}

/// Last known authoritative playback position.
///
/// Anchors are immutable values: every snapshot or fired command produces a
/// fresh anchor that replaces the previous one wholesale.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct PlaybackAnchor {
    pub is_playing: bool,
    pub playback_rate: f64,
    pub anchor_server_time_ms: i64,
    pub anchor_media_time_ms: f64,
    pub sequence_number: u64,
}

impl PlaybackAnchor {
    pub fn paused_at(server_time_ms: i64, media_time_ms: f64) -> Self {
        Self {
            is_playing: false,
            playback_rate: NOMINAL_PLAYBACK_RATE,
            anchor_server_time_ms: server_time_ms,
            anchor_media_time_ms: media_time_ms,
            sequence_number: 0,
        }
    }

    /// Media position implied by this anchor at `server_now_ms`.
    pub fn expected_position_ms(&self, server_now_ms: i64) -> f64 {
        if !self.is_playing {
            return self.anchor_media_time_ms;
        }

        let elapsed = (server_now_ms - self.anchor_server_time_ms) as f64;
        (self.anchor_media_time_ms + elapsed * self.playback_rate).max(0.0)
    }

    /// Same timeline, re-expressed relative to `server_now_ms`.
    pub fn rebased(&self, server_now_ms: i64) -> Self {
        Self {
            anchor_server_time_ms: server_now_ms,
            anchor_media_time_ms: self.expected_position_ms(server_now_ms),
            ..*self
        }
    }

    /// Produces the anchor that holds once `command` has taken effect at
    /// `effect_server_time_ms`.
    pub fn apply_command(&self, command: &SyncCommand, effect_server_time_ms: i64) -> Self {
        let position = self.expected_position_ms(effect_server_time_ms);
        let base = Self {
            anchor_server_time_ms: effect_server_time_ms,
            anchor_media_time_ms: position,
            sequence_number: command.sequence(),
            ..*self
        };

        match *command {
            SyncCommand::Play { .. } => Self {
                is_playing: true,
                ..base
            },
            SyncCommand::Pause { .. } => Self {
                is_playing: false,
                ..base
            },
            SyncCommand::Seek {
                target_media_time_ms,
                ..
            } => Self {
                anchor_media_time_ms: target_media_time_ms.max(0.0),
                ..base
            },
            SyncCommand::SetRate { rate, .. } => Self {
                playback_rate: rate,
                ..base
            },
            SyncCommand::StateSnapshot(anchor) => anchor,
        }
    }
}

/// Discrete transport command pushed by the room authority.
///
/// `at_server_time_ms` is the authoritative instant the command takes effect;
/// commands without one take effect on receipt.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub enum SyncCommand {
    Play {
        at_server_time_ms: Option<i64>,
        sequence: u64,
    },
    Pause {
        at_server_time_ms: Option<i64>,
        sequence: u64,
    },
    Seek {
        target_media_time_ms: f64,
        at_server_time_ms: Option<i64>,
        sequence: u64,
    },
    SetRate {
        rate: f64,
        at_server_time_ms: Option<i64>,
        sequence: u64,
    },
    StateSnapshot(PlaybackAnchor),
}

impl SyncCommand {
    pub fn effect_time_ms(&self) -> Option<i64> {
        match *self {
            SyncCommand::Play {
                at_server_time_ms, ..
            }
            | SyncCommand::Pause {
                at_server_time_ms, ..
            }
            | SyncCommand::Seek {
                at_server_time_ms, ..
            }
            | SyncCommand::SetRate {
                at_server_time_ms, ..
            } => at_server_time_ms,
            SyncCommand::StateSnapshot(_) => None,
        }
    }

    pub fn sequence(&self) -> u64 {
        match *self {
            SyncCommand::Play { sequence, .. }
            | SyncCommand::Pause { sequence, .. }
            | SyncCommand::Seek { sequence, .. }
            | SyncCommand::SetRate { sequence, .. } => sequence,
            SyncCommand::StateSnapshot(anchor) => anchor.sequence_number,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SyncCommand::Play { .. } => "play",
            SyncCommand::Pause { .. } => "pause",
            SyncCommand::Seek { .. } => "seek",
            SyncCommand::SetRate { .. } => "set_rate",
            SyncCommand::StateSnapshot(_) => "state_snapshot",
        }
    }
}

/// Source of wall-clock milliseconds.
///
/// Every component reads time through this trait so tests can substitute a
/// manually advanced clock.
pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Real wall clock, optionally shifted by a fixed skew.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource {
    skew_ms: i64,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self { skew_ms: 0 }
    }

    pub fn with_skew(skew_ms: i64) -> Self {
        Self { skew_ms }
    }
}

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> i64 {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_millis();
        (millis.min(i64::MAX as u128) as i64) + self.skew_ms
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now_ms: AtomicI64,
}

impl ManualTimeSource {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
