//! Connection tracking for the room server
//!
//! This module handles the server-side bookkeeping of connected clients:
//! - Client connection lifecycle (connect, disconnect, timeout)
//! - Capacity limits and address lookup
//! - Per-client activity timestamps
//!
//! Clients hold no playback state here; the room anchor is shared by all of
//! them and is sent to each one as a snapshot.

use log::info;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Default silence after which a client is dropped.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// A connected client
#[derive(Debug)]
pub struct Client {
    /// Unique client identifier assigned by the server
    pub id: u32,
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// Last time we received any packet from this client
    pub last_seen: Instant,
    /// Resync requests received from this client
    pub resync_requests: u32,
}

impl Client {
    pub fn new(id: u32, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            resync_requests: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Checks if the client has exceeded the connection timeout
    ///
    /// Returns true if no packets have been received from this client
    /// within the specified timeout duration, indicating a likely disconnect.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Manages all connected clients
///
/// The ClientManager provides centralized control over client connections
/// and enforces the server capacity limit.
pub struct ClientManager {
    /// Connected clients indexed by their unique ID
    clients: HashMap<u32, Client>,
    /// Next available client ID for new connections
    next_client_id: u32,
    /// Maximum number of concurrent clients allowed
    max_clients: usize,
    timeout: Duration,
}

impl ClientManager {
    /// Creates a new client manager with the specified capacity limit
    ///
    /// Client IDs start from 1 and increment for each new connection.
    pub fn new(max_clients: usize, timeout: Duration) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
            timeout,
        }
    }

    /// Attempts to add a new client connection
    ///
    /// Returns Some(client_id) if successful, None if server is at capacity.
    pub fn add_client(&mut self, addr: SocketAddr) -> Option<u32> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        let client = Client::new(client_id, addr);
        info!("Client {} connected from {}", client_id, addr);
        self.clients.insert(client_id, client);

        Some(client_id)
    }

    /// Removes a client from the server
    ///
    /// Returns true if the client was found and removed, false if they were
    /// already gone.
    pub fn remove_client(&mut self, client_id: &u32) -> bool {
        if let Some(client) = self.clients.remove(client_id) {
            info!("Client {} disconnected", client.id);
            true
        } else {
            false
        }
    }

    /// Finds a client ID by their network address
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<u32> {
        self.clients
            .iter()
            .find(|(_, client)| client.addr == addr)
            .map(|(id, _)| *id)
    }

    /// Records activity from `addr`. Returns the client ID if known.
    pub fn touch_addr(&mut self, addr: SocketAddr) -> Option<u32> {
        let client = self.clients.values_mut().find(|c| c.addr == addr)?;
        client.touch();
        Some(client.id)
    }

    pub fn note_resync_request(&mut self, client_id: u32) -> u32 {
        match self.clients.get_mut(&client_id) {
            Some(client) => {
                client.resync_requests += 1;
                client.resync_requests
            }
            None => 0,
        }
    }

    /// Checks for and removes timed-out clients
    ///
    /// Returns the removed client IDs.
    pub fn check_timeouts(&mut self) -> Vec<u32> {
        let timeout = self.timeout;
        let timed_out: Vec<u32> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(timeout))
            .map(|(id, _)| *id)
            .collect();

        for client_id in &timed_out {
            self.remove_client(client_id);
        }

        timed_out
    }

    /// Gets all client IDs and their network addresses
    ///
    /// Used for broadcasting commands and snapshots to every client.
    pub fn get_client_addrs(&self) -> Vec<(u32, SocketAddr)> {
        self.clients
            .iter()
            .map(|(id, client)| (*id, client.addr))
            .collect()
    }

    /// Returns the number of currently connected clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns true if no clients are currently connected
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
