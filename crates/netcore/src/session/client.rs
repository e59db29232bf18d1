use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::ClientEvent;
use crate::buffer::ByteBuffer;
use crate::config::ClientConfig;
use crate::net::connection::ClientId;
use crate::net::endpoint::NetworkEndpoint;
use crate::net::handshake::{
    missing_files, password_digest, ClientState, ConnectionStage, ResourceResolver,
};
use crate::net::protocol::{
    is_control, version_message, ControlPacket, Message, MessageKind, MessageRegistry,
    ServerInfo, Version, GAME_VERSION,
};
use crate::net::stats::NetworkStats;
use crate::net::transport::ClientTransport;

/// Client loop: challenge, connect, then exchange sequenced packets with
/// the server every tic.
pub struct ClientSession {
    endpoint: NetworkEndpoint,
    state: ClientState,
    transport: ClientTransport,
    config: ClientConfig,
    registry: MessageRegistry,
    resolver: Box<dyn ResourceResolver>,
    version: Version,
    client_id: Option<ClientId>,
    digest: String,
    server_info: Option<ServerInfo>,
    tic: u64,
    last_received_tic: u64,
    received_this_tic: bool,
    tick_duration: Duration,
    last_tick_time: Instant,
    accumulator: Duration,
    pending_events: VecDeque<ClientEvent>,
}

impl ClientSession {
    pub fn new(
        config: ClientConfig,
        registry: MessageRegistry,
        resolver: Box<dyn ResourceResolver>,
    ) -> io::Result<Self> {
        let endpoint = NetworkEndpoint::bind(config.bind.as_str())?;

        Ok(Self {
            endpoint,
            state: ClientState::new(),
            transport: ClientTransport::new(),
            registry,
            resolver,
            version: GAME_VERSION,
            client_id: None,
            digest: String::new(),
            server_info: None,
            tic: 0,
            last_received_tic: 0,
            received_this_tic: false,
            tick_duration: config.tick_duration(),
            last_tick_time: Instant::now(),
            accumulator: Duration::ZERO,
            pending_events: VecDeque::new(),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn stage(&self) -> ConnectionStage {
        self.state.stage()
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    pub fn stats(&self) -> &NetworkStats {
        self.transport.stats()
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ClientEvent> + '_ {
        self.pending_events.drain(..)
    }

    pub fn connect(&mut self, server: SocketAddr) {
        log::info!("Connecting to {}", server);
        self.reset_session();
        self.state.start_connect(server);
    }

    pub fn reconnect(&mut self) -> bool {
        self.reset_session();
        self.state.start_reconnect()
    }

    /// Leaves the server, telling it why.
    pub fn disconnect(&mut self, reason: &str) {
        if let Some(server) = self.server_addr() {
            self.send_control(
                server,
                &ControlPacket::Disconnect {
                    reason: reason.to_string(),
                },
            );
        }
        self.state.on_disconnect();
        self.reset_session();
    }

    /// Queues a message for the server. Dropped unless connected.
    pub fn send(&mut self, msg: Message) -> bool {
        if !self.state.is_connected() {
            return false;
        }
        self.transport.queue(msg);
        true
    }

    fn server_addr(&self) -> Option<SocketAddr> {
        self.state
            .server()
            .filter(|_| self.state.stage() != ConnectionStage::Unconnected)
    }

    fn reset_session(&mut self) {
        self.transport = ClientTransport::new();
        self.client_id = None;
        self.digest.clear();
        self.last_received_tic = self.tic;
    }

    pub fn tick_once(&mut self) {
        let now = Instant::now();
        let delta = now - self.last_tick_time;
        self.last_tick_time = now;
        self.accumulator += delta;

        if let Err(e) = self.process_network(now) {
            log::warn!("Network error: {}", e);
        }

        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            self.tick(now);
        }
    }

    fn tick(&mut self, now: Instant) {
        self.tic += 1;

        match self.state.stage() {
            ConnectionStage::Unconnected => {}
            ConnectionStage::AwaitingChallengeResponse => self.tick_challenge(now),
            ConnectionStage::Connecting => self.tick_connecting(now),
            ConnectionStage::Connected | ConnectionStage::InGame => self.tick_connected(),
        }
    }

    fn tick_challenge(&mut self, now: Instant) {
        if !self.state.can_retry_connect(now) {
            return;
        }
        if let Some(server) = self.state.server() {
            log::debug!("Requesting server info from {}", server);
            self.send_control(server, &ControlPacket::ServerInfoRequest);
            self.state.on_attempt(now);
        }
    }

    fn tick_connecting(&mut self, now: Instant) {
        if self.state.can_retry_connect(now) {
            log::debug!("No answer to connect, asking for a new token");
            self.state.restart_challenge();
            self.tick_challenge(now);
        }
    }

    fn tick_connected(&mut self) {
        let silent = self.tic.saturating_sub(self.last_received_tic) >= self.config.keepalive_tics;

        if self.received_this_tic || silent || self.transport.has_queued() {
            let Some(server) = self.state.server() else {
                return;
            };
            let datagram = self.transport.write_packet();
            if let Err(e) = self.endpoint.send_to(&datagram, server) {
                log::warn!("Failed to send to {}: {}", server, e);
            }
        }

        self.received_this_tic = false;
    }

    fn send_connect(&mut self, now: Instant) {
        let (Some(server), Some(token)) = (self.state.server(), self.state.token()) else {
            return;
        };

        let packet = ControlPacket::Connect {
            token,
            version: self.version.packed(),
            password_digest: password_digest(&self.config.password),
            name: self.config.name.clone(),
        };
        self.send_control(server, &packet);
        self.state.on_sent_connect(now);
    }

    fn send_control(&mut self, addr: SocketAddr, packet: &ControlPacket) {
        let result = packet
            .serialize()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
            .and_then(|data| self.endpoint.send_to(&data, addr));

        if let Err(e) = result {
            log::warn!("Failed to send control packet to {}: {}", addr, e);
        }
    }

    fn process_network(&mut self, now: Instant) -> io::Result<()> {
        let packets = self.endpoint.receive()?;

        for (data, addr) in packets {
            if !self.state.is_valid_address(addr) {
                log::trace!("Ignoring packet from {}", addr);
                continue;
            }

            if is_control(&data) {
                match ControlPacket::deserialize(&data) {
                    Ok(packet) => self.handle_control(packet, now),
                    Err(e) => log::debug!("Bad control packet from {}: {}", addr, e),
                }
            } else {
                self.handle_sequenced(&data);
            }
        }

        Ok(())
    }

    fn handle_control(&mut self, packet: ControlPacket, now: Instant) {
        match packet {
            ControlPacket::ServerInfo(info) => self.handle_server_info(info, now),
            ControlPacket::ConnectionDenied { .. }
                if self.state.stage() != ConnectionStage::Connecting => {}
            ControlPacket::ConnectionDenied { reason } => {
                log::info!("Connection denied: {}", reason);
                self.state.on_disconnect();
                self.reset_session();
                self.pending_events
                    .push_back(ClientEvent::ConnectionFailed { reason });
            }
            ControlPacket::Disconnect { reason } => {
                log::info!("Disconnected by server: {}", reason);
                self.state.on_disconnect();
                self.reset_session();
                self.pending_events
                    .push_back(ClientEvent::Disconnected { reason });
            }
            ControlPacket::ServerInfoRequest | ControlPacket::Connect { .. } => {}
        }
    }

    fn handle_server_info(&mut self, info: ServerInfo, now: Instant) {
        if self.state.stage() != ConnectionStage::AwaitingChallengeResponse {
            return;
        }

        self.pending_events
            .push_back(ClientEvent::ServerInfo(info.clone()));

        let server_version = Version::from_packed(info.version);
        let email = Some(info.email.as_str());
        if let Some(reason) = version_message(server_version, self.version, email) {
            log::warn!("{}", reason);
            self.state.on_disconnect();
            self.pending_events
                .push_back(ClientEvent::ConnectionFailed { reason });
            return;
        }

        let wanted: Vec<_> = info.wads.iter().chain(&info.patches).cloned().collect();
        let missing: Vec<_> = missing_files(self.resolver.as_ref(), &wanted)
            .into_iter()
            .cloned()
            .collect();

        if !missing.is_empty() || self.config.force_download {
            let files = if missing.is_empty() { wanted } else { missing };
            log::info!("Need {} file(s) before joining {}", files.len(), info.hostname);
            self.state.on_disconnect();
            self.pending_events.push_back(ClientEvent::DownloadRequired {
                files,
                site: info.download_site.clone(),
            });
            return;
        }

        self.state.on_got_server_info(info.token);
        self.server_info = Some(info);
        self.send_connect(now);
    }

    fn handle_sequenced(&mut self, data: &[u8]) {
        if !matches!(
            self.state.stage(),
            ConnectionStage::Connecting | ConnectionStage::Connected | ConnectionStage::InGame
        ) {
            return;
        }

        let received = match self.transport.receive_packet(data, &self.registry) {
            Ok(Some(received)) => received,
            Ok(None) => return,
            Err(e) => {
                log::debug!("Dropping packet from server: {}", e);
                return;
            }
        };

        self.last_received_tic = self.tic;
        self.received_this_tic = true;
        self.state.on_connected();

        if received.lost > 0 {
            log::warn!("Server evicted {} reliable message(s)", received.lost);
        }

        for message in received.messages {
            if message.kind == MessageKind::WELCOME {
                self.handle_welcome(&message.data);
            } else {
                self.pending_events.push_back(ClientEvent::Message(message));
            }
        }
    }

    fn handle_welcome(&mut self, data: &[u8]) {
        let mut buf = ByteBuffer::from_bytes(data);
        let Some(client_id) = buf.read_u32() else {
            log::warn!("Malformed welcome from server");
            return;
        };

        self.client_id = Some(client_id);
        self.digest = buf.read_string();
        self.state.on_entered_game();
        log::info!("Joined as client {}", client_id);
        self.pending_events
            .push_back(ClientEvent::Connected { client_id });
    }
}
