//! # Playback Sync Client Library
//!
//! This library keeps a local media player in lockstep with an authoritative
//! playback timeline owned by a server. Many clients on different networks
//! watch the same media, and every one of them should show the same frame at
//! the same wall-clock moment.
//!
//! ## Architecture Overview
//!
//! The server never streams positions. It sends a compact *anchor*: at server
//! time `T` the media was at position `M`, playing or paused, at rate `R`.
//! Each client extrapolates from the anchor on its own, which only works if it
//! knows how its clock relates to the server's.
//!
//! ### Clock Synchronization
//! A handful of NTP-style probes estimate the offset between the local clock
//! and the server clock. The median of the samples is kept, so one delayed
//! packet cannot skew the estimate. Probing repeats on an interval because
//! clocks wander.
//!
//! ### Scheduled Commands
//! Play, pause, seek and rate changes carry the server time at which they
//! take effect. The client converts that to local time and fires the command
//! then, so every client switches on the same instant instead of whenever the
//! packet happened to arrive.
//!
//! ### Drift Correction
//! Players drift. A periodic check compares the player position with the
//! position the anchor predicts. Small drift is ignored, moderate drift is
//! absorbed by briefly nudging the playback rate, and large drift is fixed
//! with a seek.
//!
//! ## Module Organization
//!
//! ### Clock Module (`clock`)
//! Offset estimation from probe round trips and the synchronizer that owns the
//! current estimate.
//!
//! ### Executor Module (`executor`)
//! Runs commands immediately or schedules them for their effect time.
//!
//! ### Drift Module (`drift`)
//! Classifies the gap between actual and expected position.
//!
//! ### Correction Module (`correction`)
//! Applies soft and hard sync to the player and reverts rate nudges.
//!
//! ### Engine Module (`engine`)
//! Lifecycle and wiring of the components above around one player.
//!
//! ### Network Module (`network`)
//! UDP transport, probe routing and the client event loop.
//!
//! ### Player Module (`player`)
//! The player capability the engine drives, plus a simulated player.

pub mod clock;
pub mod config;
pub mod correction;
pub mod drift;
pub mod engine;
pub mod error;
pub mod executor;
pub mod network;
pub mod player;
pub mod timers;

pub use clock::{ClockEstimate, ClockSynchronizer, ProbeChannel, ProbeReply};
pub use config::SyncConfig;
pub use drift::{CorrectionAction, DriftReport, SyncStatus};
pub use engine::{SyncEngine, SyncStatusView};
pub use executor::ExecutionOutcome;
pub use player::{PlayerHandle, SimulatedPlayer};
