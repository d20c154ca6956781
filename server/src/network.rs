//! Server network layer handling UDP communications and room coordination

use crate::client_manager::{ClientManager, DEFAULT_CLIENT_TIMEOUT};
use crate::control::{ControlCommand, HELP};
use crate::room::{PlaybackRoom, DEFAULT_COMMAND_LEAD_MS};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{Packet, SyncCommand, TimeSource, MAX_PACKET_SIZE, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, sleep, MissedTickBehavior};

pub type ServerError = Box<dyn std::error::Error + Send + Sync>;

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    ClientTimeout {
        client_id: u32,
    },
    Control(ControlCommand),
    Shutdown,
}

/// Messages sent from the main loop to the sender task
#[derive(Debug)]
pub enum OutboundMessage {
    SendPacket {
        packet: Packet,
        addr: SocketAddr,
    },
    BroadcastPacket {
        packet: Packet,
    },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_clients: usize,
    pub command_lead_ms: i64,
    pub snapshot_interval: Duration,
    pub client_timeout: Duration,
    /// Read operator commands from stdin
    pub read_console: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_clients: 32,
            command_lead_ms: DEFAULT_COMMAND_LEAD_MS,
            snapshot_interval: Duration::from_millis(5_000),
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
            read_console: true,
        }
    }
}

/// Snapshots held back until the pending command has taken effect.
///
/// A snapshot replaces the client's anchor and cancels its pending timers,
/// so sending one inside the lead window would swallow the command.
#[derive(Debug, Default)]
struct DeferredSnapshots {
    broadcast: bool,
    clients: Vec<SocketAddr>,
}

impl DeferredSnapshots {
    fn is_pending(&self) -> bool {
        self.broadcast || !self.clients.is_empty()
    }

    fn add_client(&mut self, addr: SocketAddr) {
        if !self.clients.contains(&addr) {
            self.clients.push(addr);
        }
    }
}

/// Room authority serving one shared playback timeline
pub struct Server {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    clients: Arc<RwLock<ClientManager>>,
    room: PlaybackRoom,
    time: Arc<dyn TimeSource>,
    config: ServerConfig,
    deferred: DeferredSnapshots,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx: Option<mpsc::UnboundedReceiver<OutboundMessage>>,
}

impl Server {
    pub async fn new(
        addr: &str,
        config: ServerConfig,
        time: Arc<dyn TimeSource>,
    ) -> Result<Self, ServerError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        info!("Server listening on {}", local_addr);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            local_addr,
            clients: Arc::new(RwLock::new(ClientManager::new(
                config.max_clients,
                config.client_timeout,
            ))),
            room: PlaybackRoom::new(Arc::clone(&time), config.command_lead_ms),
            time,
            config,
            deferred: DeferredSnapshots::default(),
            server_tx,
            server_rx,
            outbound_tx,
            outbound_rx: Some(outbound_rx),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for feeding operator commands or a shutdown into the main loop.
    pub fn message_sender(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Spawns task that continuously listens for incoming packets
    ///
    /// Time probes are answered right here so queueing in the main loop does
    /// not add to the measured round trip.
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();
        let time = Arc::clone(&self.time);

        tokio::spawn(async move {
            let mut buffer = [0u8; MAX_PACKET_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) else {
                            warn!("Failed to deserialize packet from {}", addr);
                            continue;
                        };

                        if let Packet::TimeProbe {
                            client_send_time_ms,
                        } = packet
                        {
                            let response = Packet::TimeProbeResponse {
                                client_send_time_ms,
                                server_time_ms: time.now_ms(),
                            };
                            if let Err(e) = send_packet_impl(&socket, &response, addr).await {
                                error!("Failed to answer time probe from {}: {}", addr, e);
                            }
                        }

                        if let Err(e) =
                            server_tx.send(ServerMessage::PacketReceived { packet, addr })
                        {
                            error!("Failed to send packet to main loop: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let Some(mut outbound_rx) = self.outbound_rx.take() else {
            return;
        };
        let socket = Arc::clone(&self.socket);
        let clients = Arc::clone(&self.clients);

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                match message {
                    OutboundMessage::SendPacket { packet, addr } => {
                        if let Err(e) = send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    OutboundMessage::BroadcastPacket { packet } => {
                        let client_addrs = {
                            let clients_guard = clients.read().await;
                            clients_guard.get_client_addrs()
                        };

                        for (client_id, addr) in client_addrs {
                            if let Err(e) = send_packet_impl(&socket, &packet, addr).await {
                                error!("Failed to send to client {}: {}", client_id, e);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawns task that monitors client timeouts
    fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts()
                };

                for client_id in timed_out {
                    if let Err(e) = server_tx.send(ServerMessage::ClientTimeout { client_id }) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    /// Spawns task that reads operator commands from stdin
    fn spawn_console_reader(&self) {
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            println!("{}", HELP);

            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<ControlCommand>() {
                    Ok(command) => {
                        if server_tx.send(ServerMessage::Control(command)).is_err() {
                            break;
                        }
                    }
                    Err(e) => println!("{} ({})", e, HELP),
                }
            }
            debug!("Console closed");
        });
    }

    fn send_packet(&self, packet: &Packet, addr: SocketAddr) {
        if let Err(e) = self.outbound_tx.send(OutboundMessage::SendPacket {
            packet: packet.clone(),
            addr,
        }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn broadcast_packet(&self, packet: &Packet) {
        if let Err(e) = self.outbound_tx.send(OutboundMessage::BroadcastPacket {
            packet: packet.clone(),
        }) {
            error!("Failed to queue broadcast packet: {}", e);
        }
    }

    fn send_snapshot_to(&mut self, addr: SocketAddr) {
        if self.room.in_lead_window() {
            debug!("Deferring snapshot for {} until command takes effect", addr);
            self.deferred.add_client(addr);
            return;
        }
        self.send_packet(&Packet::StateSnapshot(self.room.snapshot()), addr);
    }

    async fn broadcast_snapshot(&mut self) {
        if self.clients.read().await.is_empty() {
            return;
        }
        if self.room.in_lead_window() {
            self.deferred.broadcast = true;
            return;
        }
        self.broadcast_packet(&Packet::StateSnapshot(self.room.snapshot()));
    }

    async fn flush_deferred(&mut self) {
        let deferred = std::mem::take(&mut self.deferred);
        if deferred.broadcast {
            self.broadcast_snapshot().await;
            return;
        }
        for addr in deferred.clients {
            self.send_snapshot_to(addr);
        }
    }

    /// Processes incoming packets
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect { client_version } => {
                info!(
                    "Client connecting from {} (version: {})",
                    addr, client_version
                );

                if client_version != PROTOCOL_VERSION {
                    let response = Packet::Disconnected {
                        reason: "Protocol version mismatch".to_string(),
                    };
                    self.send_packet(&response, addr);
                    return;
                }

                // Remove existing connection if present
                let client_id = {
                    let mut clients = self.clients.write().await;
                    if let Some(existing_id) = clients.find_client_by_addr(addr) {
                        info!("Removing existing client {} from {}", existing_id, addr);
                        clients.remove_client(&existing_id);
                    }
                    clients.add_client(addr)
                };

                if let Some(client_id) = client_id {
                    self.send_packet(&Packet::Connected { client_id }, addr);
                    self.send_snapshot_to(addr);
                } else {
                    let response = Packet::Disconnected {
                        reason: "Server full".to_string(),
                    };
                    self.send_packet(&response, addr);
                }
            }

            Packet::TimeProbe { .. } | Packet::Heartbeat => {
                self.clients.write().await.touch_addr(addr);
            }

            Packet::RequestResync => {
                let client_id = {
                    let mut clients = self.clients.write().await;
                    clients
                        .touch_addr(addr)
                        .map(|id| (id, clients.note_resync_request(id)))
                };

                match client_id {
                    Some((client_id, count)) => {
                        info!("Client {} requested resync ({} so far)", client_id, count);
                        self.send_snapshot_to(addr);
                    }
                    None => debug!("Resync request from unknown address {}", addr),
                }
            }

            Packet::Disconnect => {
                let mut clients = self.clients.write().await;
                if let Some(client_id) = clients.find_client_by_addr(addr) {
                    clients.remove_client(&client_id);
                }
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    async fn handle_control(&mut self, command: ControlCommand) {
        let issued: Option<SyncCommand> = match command {
            ControlCommand::Play => {
                let issued = self.room.play();
                if issued.is_none() {
                    println!("Already playing");
                }
                issued
            }
            ControlCommand::Pause => {
                let issued = self.room.pause();
                if issued.is_none() {
                    println!("Already paused");
                }
                issued
            }
            ControlCommand::Seek(target_ms) => match self.room.seek(target_ms) {
                Ok(issued) => Some(issued),
                Err(e) => {
                    println!("{}", e);
                    None
                }
            },
            ControlCommand::Rate(rate) => match self.room.set_rate(rate) {
                Ok(issued) => Some(issued),
                Err(e) => {
                    println!("{}", e);
                    None
                }
            },
            ControlCommand::Status => {
                let client_count = self.clients.read().await.len();
                println!("{} | {} clients", self.room.status_line(), client_count);
                None
            }
        };

        if let Some(command) = issued {
            self.broadcast_packet(&Packet::Command(command));
        }
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), ServerError> {
        // Initialize concurrent tasks
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();
        if self.config.read_console {
            self.spawn_console_reader();
        }

        let mut snapshot_interval = interval(self.config.snapshot_interval);
        snapshot_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Skip the first tick since it fires immediately
        snapshot_interval.tick().await;

        info!("Server started successfully");

        loop {
            let lead_remaining =
                Duration::from_millis(self.room.lead_window_remaining_ms() as u64);

            tokio::select! {
                // Handle network events
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(ServerMessage::ClientTimeout { client_id }) => {
                            debug!("Client {} timed out", client_id);
                        },
                        Some(ServerMessage::Control(command)) => {
                            self.handle_control(command).await;
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            let packet = Packet::Disconnected {
                                reason: "Server shutting down".to_string(),
                            };
                            self.broadcast_packet(&packet);
                            break;
                        }
                    }
                },

                _ = snapshot_interval.tick() => {
                    self.broadcast_snapshot().await;
                },

                _ = sleep(lead_remaining), if self.deferred.is_pending() => {
                    self.flush_deferred().await;
                },
            }
        }

        Ok(())
    }
}

async fn send_packet_impl(
    socket: &UdpSocket,
    packet: &Packet,
    addr: SocketAddr,
) -> Result<(), ServerError> {
    let data = serialize(packet)?;
    socket.send_to(&data, addr).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::SystemTimeSource;
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    async fn start_server(
        config: ServerConfig,
    ) -> (SocketAddr, mpsc::UnboundedSender<ServerMessage>) {
        let time: Arc<dyn TimeSource> = Arc::new(SystemTimeSource::new());
        let mut server = Server::new("127.0.0.1:0", config, time).await.unwrap();
        let addr = server.local_addr();
        let control = server.message_sender();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        (addr, control)
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            read_console: false,
            ..ServerConfig::default()
        }
    }

    async fn send(socket: &UdpSocket, packet: &Packet, addr: SocketAddr) {
        socket.send_to(&serialize(packet).unwrap(), addr).await.unwrap();
    }

    async fn recv(socket: &UdpSocket) -> Packet {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for packet")
            .unwrap();
        deserialize(&buf[..len]).unwrap()
    }

    async fn connect(server: SocketAddr) -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let connect = Packet::Connect {
            client_version: PROTOCOL_VERSION,
        };
        send(&socket, &connect, server).await;
        assert!(matches!(recv(&socket).await, Packet::Connected { .. }));
        assert!(matches!(recv(&socket).await, Packet::StateSnapshot(_)));
        socket
    }

    #[test]
    fn test_deferred_snapshots_dedupe_clients() {
        let mut deferred = DeferredSnapshots::default();
        assert!(!deferred.is_pending());

        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        deferred.add_client(addr);
        deferred.add_client(addr);
        assert_eq!(deferred.clients.len(), 1);
        assert!(deferred.is_pending());
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.command_lead_ms, 300);
        assert_eq!(config.snapshot_interval, Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn test_connect_receives_id_and_snapshot() {
        let (server, _control) = start_server(test_config()).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let connect = Packet::Connect {
            client_version: PROTOCOL_VERSION,
        };
        send(&socket, &connect, server).await;

        assert_eq!(recv(&socket).await, Packet::Connected { client_id: 1 });
        match recv(&socket).await {
            Packet::StateSnapshot(anchor) => {
                assert!(!anchor.is_playing);
                assert_eq!(anchor.sequence_number, 0);
            }
            other => panic!("Expected snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_version_mismatch_is_rejected() {
        let (server, _control) = start_server(test_config()).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let connect = Packet::Connect { client_version: 999 };
        send(&socket, &connect, server).await;

        assert!(matches!(recv(&socket).await, Packet::Disconnected { .. }));
    }

    #[tokio::test]
    async fn test_server_full() {
        let config = ServerConfig {
            max_clients: 1,
            ..test_config()
        };
        let (server, _control) = start_server(config).await;
        let _first = connect(server).await;

        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let connect = Packet::Connect {
            client_version: PROTOCOL_VERSION,
        };
        send(&second, &connect, server).await;

        match recv(&second).await {
            Packet::Disconnected { reason } => assert_eq!(reason, "Server full"),
            other => panic!("Expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_time_probe_echoes_send_time() {
        let (server, _control) = start_server(test_config()).await;
        let socket = connect(server).await;

        let before = SystemTimeSource::new().now_ms();
        let probe = Packet::TimeProbe {
            client_send_time_ms: 42,
        };
        send(&socket, &probe, server).await;

        match recv(&socket).await {
            Packet::TimeProbeResponse {
                client_send_time_ms,
                server_time_ms,
            } => {
                assert_eq!(client_send_time_ms, 42);
                assert!(server_time_ms >= before);
            }
            other => panic!("Expected probe response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_control_command_is_broadcast() {
        let (server, control) = start_server(test_config()).await;
        let a = connect(server).await;
        let b = connect(server).await;

        assert_ok!(control.send(ServerMessage::Control(ControlCommand::Play)));

        for socket in [&a, &b] {
            match recv(socket).await {
                Packet::Command(SyncCommand::Play {
                    at_server_time_ms,
                    sequence,
                }) => {
                    assert!(at_server_time_ms.is_some());
                    assert_eq!(sequence, 1);
                }
                other => panic!("Expected play command, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_resync_inside_lead_window_is_deferred() {
        let config = ServerConfig {
            command_lead_ms: 200,
            ..test_config()
        };
        let (server, control) = start_server(config).await;
        let socket = connect(server).await;

        assert_ok!(control.send(ServerMessage::Control(ControlCommand::Play)));
        let effect = match recv(&socket).await {
            Packet::Command(command) => command.effect_time_ms().unwrap(),
            other => panic!("Expected command, got {:?}", other),
        };

        send(&socket, &Packet::RequestResync, server).await;

        match recv(&socket).await {
            Packet::StateSnapshot(anchor) => {
                assert!(anchor.is_playing);
                assert!(anchor.anchor_server_time_ms >= effect);
                assert_eq!(anchor.sequence_number, 1);
            }
            other => panic!("Expected snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_periodic_snapshots() {
        let config = ServerConfig {
            snapshot_interval: Duration::from_millis(100),
            ..test_config()
        };
        let (server, _control) = start_server(config).await;
        let socket = connect(server).await;

        assert!(matches!(recv(&socket).await, Packet::StateSnapshot(_)));
        assert!(matches!(recv(&socket).await, Packet::StateSnapshot(_)));
    }

    #[tokio::test]
    async fn test_shutdown_notifies_clients() {
        let (server, control) = start_server(test_config()).await;
        let socket = connect(server).await;

        assert_ok!(control.send(ServerMessage::Shutdown));

        assert!(matches!(recv(&socket).await, Packet::Disconnected { .. }));
    }
}
