//! Client network layer driving the sync engine from a UDP connection

use crate::clock::{ClockEstimate, ProbeChannel, ProbeReply};
use crate::config::SyncConfig;
use crate::engine::SyncEngine;
use crate::error::ClockSyncError;
use crate::player::{PlayerHandle, SimulatedPlayer};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use rand::Rng;
use shared::{Packet, SyncCommand, TimeSource, MAX_PACKET_SIZE, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Interval, MissedTickBehavior};

/// Silence from the server longer than this counts as a lost connection.
const SERVER_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive checks without position progress before a resync is requested.
const STALL_CHECKS: u32 = 2;

/// Artificial one-way delay for exercising the engine on a local network.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencySimulation {
    pub fake_ping_ms: u64,
    pub jitter_ms: u64,
}

impl LatencySimulation {
    pub fn is_enabled(&self) -> bool {
        self.fake_ping_ms > 0 || self.jitter_ms > 0
    }

    pub fn one_way_delay(&self) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(self.fake_ping_ms / 2 + jitter)
    }

    async fn delay(&self) {
        if self.is_enabled() {
            sleep(self.one_way_delay()).await;
        }
    }
}

async fn send_packet_impl(
    socket: &UdpSocket,
    packet: &Packet,
    addr: SocketAddr,
    latency: LatencySimulation,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    latency.delay().await;
    let data = serialize(packet)?;
    socket.send_to(&data, addr).await?;
    Ok(())
}

/// Time probes over the shared socket. Replies are routed here by the
/// client's receive loop.
pub struct UdpProbeChannel {
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    replies: mpsc::UnboundedReceiver<ProbeReply>,
    latency: LatencySimulation,
}

impl ProbeChannel for UdpProbeChannel {
    async fn probe(&mut self, client_send_time_ms: i64) -> Result<ProbeReply, ClockSyncError> {
        let packet = Packet::TimeProbe {
            client_send_time_ms,
        };
        send_packet_impl(&self.socket, &packet, self.server_addr, self.latency)
            .await
            .map_err(|e| ClockSyncError::Channel(e.to_string()))?;

        // Replies to earlier, timed out probes may still be in flight.
        loop {
            let reply = self
                .replies
                .recv()
                .await
                .ok_or_else(|| ClockSyncError::Channel("reply channel closed".to_string()))?;
            if reply.client_send_time_ms == client_send_time_ms {
                return Ok(reply);
            }
            debug!(
                "Discarding late probe reply for {}",
                reply.client_send_time_ms
            );
        }
    }
}

/// Watches for a player that should be moving but is not.
#[derive(Debug, Default)]
struct StallDetector {
    last_position_ms: Option<f64>,
    stalled_checks: u32,
}

impl StallDetector {
    /// Returns true once the stall has lasted long enough to act on.
    fn observe(&mut self, position_ms: f64, should_advance: bool) -> bool {
        let stalled = should_advance
            && self
                .last_position_ms
                .is_some_and(|last| (position_ms - last).abs() < 1.0);
        self.last_position_ms = Some(position_ms);

        if !stalled {
            self.stalled_checks = 0;
            return false;
        }

        self.stalled_checks += 1;
        if self.stalled_checks >= STALL_CHECKS {
            self.stalled_checks = 0;
            return true;
        }
        false
    }
}

pub struct Client {
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    client_id: Option<u32>,
    connected: bool,
    last_server_packet: Instant,

    engine: SyncEngine<SimulatedPlayer>,
    latency: LatencySimulation,
    stall: StallDetector,

    check_interval: Interval,
    resync_interval: Interval,

    probe_tx: Option<mpsc::UnboundedSender<ProbeReply>>,
    sync_tx: mpsc::UnboundedSender<Result<ClockEstimate, ClockSyncError>>,
    sync_rx: mpsc::UnboundedReceiver<Result<ClockEstimate, ClockSyncError>>,
}

impl Client {
    pub async fn new(
        server_addr: &str,
        config: SyncConfig,
        time: Arc<dyn TimeSource>,
        player: SimulatedPlayer,
        latency: LatencySimulation,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        let server_addr: SocketAddr = server_addr.parse()?;

        let mut check_interval = interval(config.check_interval());
        check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut resync_interval = interval(config.resync_interval());
        resync_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut engine = SyncEngine::new(config, time)?;
        engine.attach_player(player);

        let (sync_tx, sync_rx) = mpsc::unbounded_channel();

        Ok(Client {
            socket,
            server_addr,
            client_id: None,
            connected: false,
            last_server_packet: Instant::now(),
            engine,
            latency,
            stall: StallDetector::default(),
            check_interval,
            resync_interval,
            probe_tx: None,
            sync_tx,
            sync_rx,
        })
    }

    pub fn engine(&self) -> &SyncEngine<SimulatedPlayer> {
        &self.engine
    }

    async fn connect(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!("Connecting to server...");

        let packet = Packet::Connect {
            client_version: PROTOCOL_VERSION,
        };
        self.send_packet(&packet).await;
        self.last_server_packet = Instant::now();

        Ok(())
    }

    async fn send_packet(&self, packet: &Packet) {
        if let Err(e) = send_packet_impl(&self.socket, packet, self.server_addr, self.latency).await
        {
            error!("Failed to send packet: {}", e);
        }
    }

    /// Starts a clock sync round on its own task unless one is running.
    fn start_clock_sync(&mut self) {
        let round = match self.engine.clock_mut().begin_round() {
            Ok(round) => round,
            Err(e) => {
                debug!("Clock sync not started: {}", e);
                return;
            }
        };

        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        self.probe_tx = Some(reply_tx);

        let mut channel = UdpProbeChannel {
            socket: Arc::clone(&self.socket),
            server_addr: self.server_addr,
            replies: reply_rx,
            latency: self.latency,
        };
        let result_tx = self.sync_tx.clone();

        tokio::spawn(async move {
            let result = round.run(&mut channel).await;
            if result_tx.send(result).is_err() {
                debug!("Client gone before clock sync finished");
            }
        });
    }

    fn finish_clock_sync(&mut self, result: Result<ClockEstimate, ClockSyncError>) {
        self.probe_tx = None;
        match self.engine.clock_mut().finish_round(result) {
            Ok(_) => {
                self.run_check();
            }
            Err(ClockSyncError::Invalidated) if self.connected => {
                // Reconnected while the old round was out; measure again.
                self.start_clock_sync();
            }
            Err(_) => {}
        }
    }

    /// Asks the server for a fresh snapshot and re-measures the clock.
    pub async fn force_resync(&mut self) {
        info!("Forcing resync");
        self.send_packet(&Packet::RequestResync).await;
        self.start_clock_sync();
    }

    async fn handle_packet(&mut self, packet: Packet) {
        self.last_server_packet = Instant::now();

        match packet {
            Packet::Connected { client_id } => {
                info!("Connected! Client ID: {}", client_id);
                self.client_id = Some(client_id);
                self.connected = true;
                if self.engine.config().auto_sync {
                    self.start_clock_sync();
                }
            }

            Packet::TimeProbeResponse {
                client_send_time_ms,
                server_time_ms,
            } => match &self.probe_tx {
                Some(tx) => {
                    let reply = ProbeReply {
                        client_send_time_ms,
                        server_time_ms,
                    };
                    if tx.send(reply).is_err() {
                        debug!("Probe reply arrived after its round ended");
                    }
                }
                None => debug!("Unsolicited time probe response"),
            },

            Packet::Command(command) => {
                let outcome = self.engine.handle_command(command);
                debug!("{} #{}: {:?}", command.name(), command.sequence(), outcome);
            }

            Packet::StateSnapshot(anchor) => {
                self.engine
                    .handle_command(SyncCommand::StateSnapshot(anchor));
                self.check_interval.reset();
                self.run_check();
            }

            Packet::Disconnected { reason } => {
                warn!("Disconnected: {}", reason);
                self.mark_disconnected();
            }

            _ => {
                warn!("Unexpected packet type");
            }
        }
    }

    fn mark_disconnected(&mut self) {
        self.connected = false;
        self.client_id = None;
        self.probe_tx = None;
        self.engine.on_disconnect();
    }

    /// One drift check. Returns true if a resync should be requested.
    fn run_check(&mut self) -> bool {
        let Some(report) = self.engine.tick() else {
            return false;
        };

        let should_advance = self.engine.anchor().is_some_and(|a| a.is_playing);
        let position = self
            .engine
            .player()
            .and_then(|p| p.current_time_ms().ok());

        debug!(
            "status={} drift={:+.0}ms rate={:?}",
            report.status,
            report.drift_ms,
            self.engine.corrector().active_rate()
        );

        match position {
            Some(position) => self.stall.observe(position, should_advance),
            None => false,
        }
    }

    fn handle_console_line(&self, line: &str) -> Option<ConsoleRequest> {
        match line.trim() {
            "resync" => Some(ConsoleRequest::Resync),
            "status" => {
                let view = self.engine.status();
                let clock = self.engine.clock_estimate();
                println!(
                    "status={} drift={:+.0}ms offset={}ms rtt={}ms clock_synced={}",
                    view.status, view.drift_ms, clock.offset_ms, clock.rtt_ms, clock.synced
                );
                None
            }
            "" => None,
            other => {
                println!("Unknown command '{}', expected 'resync' or 'status'", other);
                None
            }
        }
    }

    fn timer_delay(&self) -> Duration {
        match self.engine.next_deadline_ms() {
            Some(deadline) => {
                let delay = (deadline - self.engine.now_ms()).max(0);
                Duration::from_millis(delay as u64)
            }
            None => Duration::from_secs(3600),
        }
    }

    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.connect().await?;

        let socket = Arc::clone(&self.socket);
        let mut buffer = [0u8; MAX_PACKET_SIZE];
        let mut console = BufReader::new(tokio::io::stdin()).lines();
        let mut console_open = true;

        // The first tick of an interval completes immediately.
        self.resync_interval.tick().await;

        loop {
            let timer_delay = self.timer_delay();

            tokio::select! {
                result = socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, addr)) if addr == self.server_addr => {
                            self.latency.delay().await;
                            match deserialize::<Packet>(&buffer[0..len]) {
                                Ok(packet) => self.handle_packet(packet).await,
                                Err(e) => warn!("Failed to deserialize packet: {}", e),
                            }
                        }
                        Ok((_, addr)) => debug!("Ignoring packet from {}", addr),
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                Some(result) = self.sync_rx.recv() => {
                    self.finish_clock_sync(result);
                },

                _ = sleep(timer_delay) => {
                    self.engine.poll_timers();
                },

                _ = self.check_interval.tick() => {
                    if self.connected && self.last_server_packet.elapsed() > SERVER_TIMEOUT {
                        warn!("Server silent for {:?}, reconnecting", SERVER_TIMEOUT);
                        self.mark_disconnected();
                        self.connect().await?;
                    } else if self.connected {
                        self.send_packet(&Packet::Heartbeat).await;
                    } else if self.last_server_packet.elapsed() > SERVER_TIMEOUT {
                        self.connect().await?;
                    }

                    if self.run_check() {
                        info!("Playback stalled, requesting resync");
                        self.send_packet(&Packet::RequestResync).await;
                    }
                },

                _ = self.resync_interval.tick() => {
                    if self.connected && self.engine.config().auto_sync {
                        self.start_clock_sync();
                    }
                },

                line = console.next_line(), if console_open => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(ConsoleRequest::Resync) = self.handle_console_line(&line) {
                                self.force_resync().await;
                            }
                        }
                        Ok(None) => console_open = false,
                        Err(e) => {
                            warn!("Console read failed: {}", e);
                            console_open = false;
                        }
                    }
                },

                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down");
                    break;
                },
            }
        }

        if self.connected {
            self.send_packet(&Packet::Disconnect).await;
        }
        self.engine.leave();

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsoleRequest {
    Resync,
}
