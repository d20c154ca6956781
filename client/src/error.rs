//! Failure classes of the synchronization engine.
//!
//! None of these escape the periodic loops: the engine turns them into
//! report values and log lines so a single fault never stops checking.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClockSyncError {
    #[error("no time probe succeeded out of {attempted} attempts")]
    NoSamples { attempted: u32 },

    #[error("a clock sync round is already running")]
    AlreadyRunning,

    #[error("time probe channel failed: {0}")]
    Channel(String),

    #[error("clock estimate was invalidated while the round was running")]
    Invalidated,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlayerError {
    #[error("player backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("tolerance ({tolerance_ms}ms) must be below the hard sync threshold ({hard_ms}ms)")]
    ThresholdOrder { tolerance_ms: f64, hard_ms: f64 },

    #[error("soft sync rate factor must be in (0, 1), got {0}")]
    RateFactor(f64),

    #[error("{name} must be greater than zero")]
    NotPositive { name: &'static str },
}
