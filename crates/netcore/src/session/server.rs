use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{DisconnectReason, ServerEvent};
use crate::buffer::ByteBuffer;
use crate::config::ServerConfig;
use crate::net::connection::{ClientId, ConnectionManager};
use crate::net::endpoint::NetworkEndpoint;
use crate::net::handshake::{
    password_digest, session_digest, BanList, HandshakeError, TokenIssuer,
};
use crate::net::protocol::{
    is_control, version_message, ControlPacket, Message, MessageKind, MessageRegistry,
    ServerInfo, Version, GAME_VERSION,
};
use crate::net::stats::NetworkStats;

/// Dedicated server loop: one pass over the socket and one packet per
/// client every tic.
pub struct ServerHost {
    endpoint: NetworkEndpoint,
    connections: ConnectionManager,
    config: ServerConfig,
    registry: MessageRegistry,
    tokens: TokenIssuer,
    bans: BanList,
    password_digest: String,
    version: Version,
    tic: u64,
    tick_duration: Duration,
    last_tick_time: Instant,
    accumulator: Duration,
    running: Arc<AtomicBool>,
    pending_events: VecDeque<ServerEvent>,
}

impl ServerHost {
    pub fn new(config: ServerConfig, registry: MessageRegistry) -> io::Result<Self> {
        let endpoint = NetworkEndpoint::bind(config.bind_addr())?;

        Ok(Self {
            endpoint,
            connections: ConnectionManager::new(config.max_clients, config.timeout_tics()),
            registry,
            tokens: TokenIssuer::new(config.token_max_age()),
            bans: config.ban_list(),
            password_digest: password_digest(&config.password),
            version: GAME_VERSION,
            tic: 0,
            tick_duration: config.tick_duration(),
            last_tick_time: Instant::now(),
            accumulator: Duration::ZERO,
            running: Arc::new(AtomicBool::new(true)),
            pending_events: VecDeque::new(),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn tic(&self) -> u64 {
        self.tic
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn client_count(&self) -> usize {
        self.connections.len()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.connections.ids()
    }

    pub fn ban(&mut self, ip: IpAddr, reason: impl Into<String>) {
        self.bans.ban(ip, reason);
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.pending_events.drain(..)
    }

    pub fn send_reliable(&mut self, client_id: ClientId, msg: Message) -> bool {
        match self.connections.get_mut(client_id) {
            Some(client) => {
                client.transport.queue_reliable(msg);
                true
            }
            None => false,
        }
    }

    pub fn send_unreliable(&mut self, client_id: ClientId, msg: Message) -> bool {
        match self.connections.get_mut(client_id) {
            Some(client) => {
                client.transport.queue_unreliable(msg);
                true
            }
            None => false,
        }
    }

    pub fn broadcast_reliable(&mut self, msg: Message) {
        for client in self.connections.iter_mut() {
            client.transport.queue_reliable(msg.clone());
        }
    }

    pub fn run(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            self.tick_once();
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shutdown_connections();
    }

    pub fn shutdown_connections(&mut self) {
        for client_id in self.connections.ids() {
            self.drop_client(client_id, DisconnectReason::Kicked, "Server shutting down");
        }
    }

    pub fn kick_client(&mut self, client_id: ClientId, reason: &str) {
        self.drop_client(client_id, DisconnectReason::Kicked, reason);
    }

    pub fn tick_once(&mut self) {
        let now = Instant::now();
        let delta = now - self.last_tick_time;
        self.last_tick_time = now;
        self.accumulator += delta;

        if let Err(e) = self.process_network(now) {
            self.pending_events.push_back(ServerEvent::Error {
                message: format!("Network error: {}", e),
            });
        }

        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            self.tick(now);
        }
    }

    fn tick(&mut self, now: Instant) {
        self.tic += 1;

        let mut overflowed = Vec::new();
        for client_id in self.connections.ids() {
            let Some(client) = self.connections.get_mut(client_id) else {
                continue;
            };

            match client.transport.send_packet(self.tic, now) {
                Ok(Some(datagram)) => {
                    log::debug!(
                        target: "gibnet::packet",
                        "client {} seq {} size {} tic {}",
                        client_id,
                        client.transport.channel().next_packet_id().wrapping_sub(1),
                        datagram.len(),
                        self.tic
                    );
                    if let Err(e) = self.endpoint.send_to(&datagram, client.addr) {
                        self.pending_events.push_back(ServerEvent::Error {
                            message: format!("Failed to send to {}: {}", client.addr, e),
                        });
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Client {}: {}", client_id, e);
                    overflowed.push(client_id);
                }
            }
        }

        for client_id in overflowed {
            self.drop_client(
                client_id,
                DisconnectReason::Overflow,
                "Reliable buffer overflow",
            );
        }

        for client_id in self.connections.timed_out(self.tic) {
            self.drop_client(client_id, DisconnectReason::Timeout, "Timed out");
        }

        if self.tic % self.config.ticrate.max(1) as u64 == 0 {
            self.tokens.prune(now);
        }
    }

    /// Tells the client why and forgets it.
    fn drop_client(&mut self, client_id: ClientId, reason: DisconnectReason, message: &str) {
        let Some(client) = self.connections.remove(client_id) else {
            return;
        };

        if !matches!(
            reason,
            DisconnectReason::Graceful | DisconnectReason::Reconnected
        ) {
            self.send_control(
                client.addr,
                &ControlPacket::Disconnect {
                    reason: message.to_string(),
                },
            );
        }

        log::info!(
            "Client {} ({}) {}",
            client_id,
            client.name,
            reason.as_str()
        );
        self.pending_events
            .push_back(ServerEvent::ClientDisconnected { client_id, reason });
    }

    fn send_control(&mut self, addr: SocketAddr, packet: &ControlPacket) {
        let result = packet
            .serialize()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
            .and_then(|data| self.endpoint.send_to(&data, addr));

        if let Err(e) = result {
            self.pending_events.push_back(ServerEvent::Error {
                message: format!("Failed to send control packet to {}: {}", addr, e),
            });
        }
    }

    fn process_network(&mut self, now: Instant) -> io::Result<()> {
        let packets = self.endpoint.receive()?;

        for (data, addr) in packets {
            if is_control(&data) {
                match ControlPacket::deserialize(&data) {
                    Ok(packet) => self.handle_control(packet, addr, now),
                    Err(e) => log::debug!("Bad control packet from {}: {}", addr, e),
                }
            } else {
                self.handle_sequenced(&data, addr, now);
            }
        }

        Ok(())
    }

    fn handle_control(&mut self, packet: ControlPacket, addr: SocketAddr, now: Instant) {
        match packet {
            ControlPacket::ServerInfoRequest => {
                // A connected client starting a new handshake has dropped its session.
                if let Some(client_id) = self.connections.get_by_addr(&addr).map(|c| c.client_id) {
                    self.drop_client(client_id, DisconnectReason::Reconnected, "");
                }
                let token = self.tokens.issue(addr, now);
                let info = self.server_info(token);
                self.send_control(addr, &ControlPacket::ServerInfo(info));
            }
            ControlPacket::Connect {
                token,
                version,
                password_digest: digest,
                name,
            } => {
                let version = Version::from_packed(version);
                if let Err(e) = self.connect_client(addr, token, version, &digest, name, now) {
                    log::info!("Connection from {} denied: {}", addr, e);
                    let reason = e.to_string();
                    self.send_control(
                        addr,
                        &ControlPacket::ConnectionDenied {
                            reason: reason.clone(),
                        },
                    );
                    self.pending_events
                        .push_back(ServerEvent::ConnectionDenied { addr, reason });
                }
            }
            ControlPacket::Disconnect { .. } => {
                if let Some(client_id) = self.connections.get_by_addr(&addr).map(|c| c.client_id) {
                    self.drop_client(client_id, DisconnectReason::Graceful, "");
                }
            }
            ControlPacket::ServerInfo(_) | ControlPacket::ConnectionDenied { .. } => {}
        }
    }

    fn server_info(&self, token: u32) -> ServerInfo {
        ServerInfo {
            token,
            hostname: self.config.hostname.clone(),
            players: self.connections.len().min(u8::MAX as usize) as u8,
            max_players: self.config.max_clients.min(u8::MAX as usize) as u8,
            map: self.config.map.clone(),
            wads: self.config.wads.clone(),
            patches: self.config.patches.clone(),
            version: self.version.packed(),
            download_site: self.config.download_site.clone(),
            email: self.config.email.clone(),
            passworded: !self.password_digest.is_empty(),
        }
    }

    fn connect_client(
        &mut self,
        addr: SocketAddr,
        token: u32,
        version: Version,
        digest: &str,
        name: String,
        now: Instant,
    ) -> Result<ClientId, HandshakeError> {
        if !self.tokens.validate(token, addr, now) {
            return Err(HandshakeError::BadToken);
        }

        let reconnecting = self.connections.get_by_addr(&addr).is_some();
        if self.connections.is_full() && !reconnecting {
            return Err(HandshakeError::ServerFull);
        }

        let email = Some(self.config.email.as_str());
        if let Some(msg) = version_message(self.version, version, email) {
            return Err(HandshakeError::VersionMismatch(msg));
        }

        self.bans.check(&addr)?;

        if !self.password_digest.is_empty() && digest != self.password_digest {
            return Err(HandshakeError::BadPassword);
        }

        let session = session_digest();
        let admission = self
            .connections
            .insert(
                addr,
                name.clone(),
                session.clone(),
                self.config.transport_config(),
                self.tic,
            )
            .ok_or(HandshakeError::ServerFull)?;
        let client_id = admission.client_id;

        if let Some(old) = admission.replaced {
            let reason = DisconnectReason::Reconnected;
            log::info!("Client {} ({}) {}", old.client_id, old.name, reason.as_str());
            self.pending_events.push_back(ServerEvent::ClientDisconnected {
                client_id: old.client_id,
                reason,
            });
        }

        let mut welcome = ByteBuffer::new(8 + session.len());
        welcome.write_u32(client_id);
        welcome.write_string(&session);
        self.send_reliable(
            client_id,
            Message::new(MessageKind::WELCOME, welcome.as_slice()),
        );

        log::info!("Client {} ({}) connected from {}", client_id, name, addr);
        self.pending_events.push_back(ServerEvent::ClientConnected {
            client_id,
            addr,
            name,
        });

        Ok(client_id)
    }

    fn handle_sequenced(&mut self, data: &[u8], addr: SocketAddr, now: Instant) {
        let Some(client) = self.connections.get_by_addr_mut(&addr) else {
            log::trace!("Ignoring packet from unknown address {}", addr);
            return;
        };
        let client_id = client.client_id;

        let received = match client.transport.receive_packet(data, &self.registry, now) {
            Ok(Some(received)) => received,
            Ok(None) => return,
            Err(e) => {
                log::debug!("Bad packet from client {}: {}", client_id, e);
                return;
            }
        };
        client.touch(self.tic);

        for replay in &received.replays {
            if let Err(e) = self.endpoint.send_to(replay, addr) {
                self.pending_events.push_back(ServerEvent::Error {
                    message: format!("Failed to resend to {}: {}", addr, e),
                });
            }
        }

        if received.resync {
            self.pending_events
                .push_back(ServerEvent::ResyncRequired { client_id });
        }

        for message in received.messages {
            match message.kind {
                MessageKind::RESYNC_REQUEST => {
                    log::debug!("Client {} requested a resync", client_id);
                    self.pending_events
                        .push_back(ServerEvent::ResyncRequired { client_id });
                }
                MessageKind::DISCONNECT => {
                    self.drop_client(client_id, DisconnectReason::Graceful, "");
                    return;
                }
                _ => self
                    .pending_events
                    .push_back(ServerEvent::Message { client_id, message }),
            }
        }
    }

    pub fn stats(&self) -> ServerStats {
        let mut transport = NetworkStats::default();
        for client in self.connections.iter() {
            transport.merge(client.transport.stats());
        }

        ServerStats {
            tic: self.tic,
            client_count: self.connections.len(),
            max_clients: self.config.max_clients,
            network_stats: self.endpoint.stats().clone(),
            transport_stats: transport,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerStats {
    pub tic: u64,
    pub client_count: usize,
    pub max_clients: usize,
    pub network_stats: NetworkStats,
    /// Sums over connected clients.
    pub transport_stats: NetworkStats,
}
