//! Clock offset estimation against the server authority.
//!
//! A sync round sends `sample_count` probes one after another. Each reply
//! carries the echoed client send time and the server's clock reading; the
//! server reading is assumed to sit halfway through the round trip. The
//! final offset is the median of the per-sample offsets, which keeps a
//! single latency spike from dragging the estimate.

use crate::config::SyncConfig;
use crate::error::ClockSyncError;
use log::{debug, info, warn};
use shared::TimeSource;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Current estimate of `server_time - local_time`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockEstimate {
    pub offset_ms: i64,
    pub rtt_ms: i64,
    pub sample_count: u32,
    pub synced: bool,
    pub last_synced_at: Option<i64>,
}

impl ClockEstimate {
    pub fn unsynced() -> Self {
        Self {
            offset_ms: 0,
            rtt_ms: 0,
            sample_count: 0,
            synced: false,
            last_synced_at: None,
        }
    }

    pub fn server_time_ms(&self, local_now_ms: i64) -> i64 {
        local_now_ms + self.offset_ms
    }
}

impl Default for ClockEstimate {
    fn default() -> Self {
        Self::unsynced()
    }
}

/// Server answer to a single time probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReply {
    pub client_send_time_ms: i64,
    pub server_time_ms: i64,
}

/// Offset and round trip measured by one probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeSample {
    pub offset_ms: f64,
    pub rtt_ms: i64,
}

impl ProbeSample {
    pub fn from_reply(reply: ProbeReply, receive_time_ms: i64) -> Self {
        let rtt_ms = receive_time_ms - reply.client_send_time_ms;
        let server_time_at_receive = reply.server_time_ms as f64 + rtt_ms as f64 / 2.0;
        Self {
            offset_ms: server_time_at_receive - receive_time_ms as f64,
            rtt_ms,
        }
    }
}

/// Transport used to exchange time probes with the server.
pub trait ProbeChannel {
    fn probe(
        &mut self,
        client_send_time_ms: i64,
    ) -> impl Future<Output = Result<ProbeReply, ClockSyncError>> + Send;
}

pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// One self-contained sync round, detached from the synchronizer so it can
/// run on its own task while the owner keeps serving other events.
pub struct SyncRound {
    sample_count: u32,
    inter_sample_delay: Duration,
    probe_timeout: Duration,
    time: Arc<dyn TimeSource>,
}

impl SyncRound {
    pub async fn run<C: ProbeChannel>(
        self,
        channel: &mut C,
    ) -> Result<ClockEstimate, ClockSyncError> {
        let mut samples = Vec::with_capacity(self.sample_count as usize);

        for round in 0..self.sample_count {
            if round > 0 && !self.inter_sample_delay.is_zero() {
                sleep(self.inter_sample_delay).await;
            }

            let send_time = self.time.now_ms();
            match timeout(self.probe_timeout, channel.probe(send_time)).await {
                Ok(Ok(reply)) if reply.client_send_time_ms == send_time => {
                    let sample = ProbeSample::from_reply(reply, self.time.now_ms());
                    if sample.rtt_ms < 0 {
                        debug!("Probe {} dropped: negative round trip", round);
                        continue;
                    }
                    debug!(
                        "Probe {}: offset {:.1}ms, rtt {}ms",
                        round, sample.offset_ms, sample.rtt_ms
                    );
                    samples.push(sample);
                }
                Ok(Ok(reply)) => {
                    debug!(
                        "Probe {} dropped: echo {} does not match send time {}",
                        round, reply.client_send_time_ms, send_time
                    );
                }
                Ok(Err(e)) => {
                    debug!("Probe {} failed: {}", round, e);
                }
                Err(_) => {
                    debug!("Probe {} timed out after {:?}", round, self.probe_timeout);
                }
            }
        }

        let mut offsets: Vec<f64> = samples.iter().map(|s| s.offset_ms).collect();
        let mut rtts: Vec<f64> = samples.iter().map(|s| s.rtt_ms as f64).collect();

        match (median(&mut offsets), median(&mut rtts)) {
            (Some(offset), Some(rtt)) => Ok(ClockEstimate {
                offset_ms: offset.round() as i64,
                rtt_ms: rtt.round() as i64,
                sample_count: samples.len() as u32,
                synced: true,
                last_synced_at: Some(self.time.now_ms()),
            }),
            _ => Err(ClockSyncError::NoSamples {
                attempted: self.sample_count,
            }),
        }
    }
}

/// Owns the current clock estimate and guards against overlapping rounds.
pub struct ClockSynchronizer {
    sample_count: u32,
    inter_sample_delay: Duration,
    probe_timeout: Duration,
    time: Arc<dyn TimeSource>,
    estimate: ClockEstimate,
    in_progress: bool,
    /// Set when the estimate is invalidated while a round is out; that
    /// round's result must not be installed.
    round_invalidated: bool,
    last_error: Option<ClockSyncError>,
}

impl ClockSynchronizer {
    pub fn new(config: &SyncConfig, time: Arc<dyn TimeSource>) -> Self {
        Self {
            sample_count: config.sample_count,
            inter_sample_delay: config.inter_sample_delay(),
            probe_timeout: config.probe_timeout(),
            time,
            estimate: ClockEstimate::unsynced(),
            in_progress: false,
            round_invalidated: false,
            last_error: None,
        }
    }

    pub fn estimate(&self) -> ClockEstimate {
        self.estimate
    }

    pub fn offset_ms(&self) -> i64 {
        self.estimate.offset_ms
    }

    pub fn is_synced(&self) -> bool {
        self.estimate.synced
    }

    pub fn is_syncing(&self) -> bool {
        self.in_progress
    }

    pub fn last_error(&self) -> Option<&ClockSyncError> {
        self.last_error.as_ref()
    }

    /// Local wall clock translated onto the server timeline.
    pub fn server_time_ms(&self) -> i64 {
        self.estimate.server_time_ms(self.time.now_ms())
    }

    /// Claims the single sync slot. Must be paired with [`Self::finish_round`].
    pub fn begin_round(&mut self) -> Result<SyncRound, ClockSyncError> {
        if self.in_progress {
            return Err(ClockSyncError::AlreadyRunning);
        }
        self.in_progress = true;

        Ok(SyncRound {
            sample_count: self.sample_count,
            inter_sample_delay: self.inter_sample_delay,
            probe_timeout: self.probe_timeout,
            time: Arc::clone(&self.time),
        })
    }

    /// Releases the sync slot and installs the round's result.
    ///
    /// A failed round keeps whatever estimate was there before. A round that
    /// was running when the estimate got invalidated is discarded.
    pub fn finish_round(
        &mut self,
        result: Result<ClockEstimate, ClockSyncError>,
    ) -> Result<i64, ClockSyncError> {
        self.in_progress = false;

        if std::mem::take(&mut self.round_invalidated) {
            debug!("Discarding clock sync round started before invalidation");
            return Err(ClockSyncError::Invalidated);
        }

        match result {
            Ok(estimate) => {
                info!(
                    "Clock synced: offset {}ms, rtt {}ms ({}/{} samples)",
                    estimate.offset_ms, estimate.rtt_ms, estimate.sample_count, self.sample_count
                );
                self.estimate = estimate;
                self.last_error = None;
                Ok(estimate.offset_ms)
            }
            Err(e) => {
                warn!("Clock sync failed: {}", e);
                self.last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    /// Runs a full sync round inline over `channel`.
    pub async fn sync<C: ProbeChannel>(&mut self, channel: &mut C) -> Result<i64, ClockSyncError> {
        let round = self.begin_round()?;
        let result = round.run(channel).await;
        self.finish_round(result)
    }

    /// Drops the estimate, e.g. when the connection is lost.
    pub fn invalidate(&mut self) {
        if self.estimate.synced {
            info!("Clock estimate invalidated");
        }
        self.estimate.synced = false;
        if self.in_progress {
            self.round_invalidated = true;
        }
    }
}
