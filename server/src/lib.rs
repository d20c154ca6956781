//! # Playback Room Server Library
//!
//! This library provides the authoritative side of synchronized playback. The
//! server owns the canonical timeline of one room, answers clock probes and
//! tells every connected client what the media is doing and when.
//!
//! ## Core Responsibilities
//!
//! ### Time Authority
//! Clients estimate their clock offset against this server. Time probes are
//! answered as soon as they arrive, straight from the receive task, so the
//! server side of the round trip stays as short as possible.
//!
//! ### Timed Commands
//! Operator actions (play, pause, seek, rate) are turned into commands that
//! take effect a short lead time in the future. Every client converts the
//! effect time to its own clock and fires the command on the same instant.
//!
//! ### Anchor Snapshots
//! The full playback state is sent on connect, on request and periodically.
//! Snapshots are held back while a command is inside its lead window, because
//! a snapshot would otherwise cancel the command on the client before it
//! fires.
//!
//! ## Module Organization
//!
//! ### Client Manager Module (`client_manager`)
//! Connection tracking, capacity limits and timeout detection.
//!
//! ### Control Module (`control`)
//! Parsing of operator commands typed on the server console.
//!
//! ### Network Module (`network`)
//! UDP socket tasks and the main event loop.
//!
//! ### Room Module (`room`)
//! The authoritative anchor and command sequencing.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{Server, ServerConfig};
//! use shared::SystemTimeSource;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let mut server = Server::new(
//!         "127.0.0.1:8080",
//!         ServerConfig::default(),
//!         Arc::new(SystemTimeSource::new()),
//!     )
//!     .await?;
//!
//!     // Answers probes, relays console commands and broadcasts snapshots
//!     // until shut down.
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod control;
pub mod network;
pub mod room;
