mod client;
mod server;

use std::net::SocketAddr;

use crate::net::connection::ClientId;
use crate::net::handshake::WantedFile;
use crate::net::protocol::{Message, ServerInfo};

pub use client::ClientSession;
pub use server::{ServerHost, ServerStats};

#[derive(Debug, Clone)]
pub enum ServerEvent {
    ClientConnected {
        client_id: ClientId,
        addr: SocketAddr,
        name: String,
    },
    ClientDisconnected {
        client_id: ClientId,
        reason: DisconnectReason,
    },
    ConnectionDenied {
        addr: SocketAddr,
        reason: String,
    },
    /// The client lost reliable state; answer with a full snapshot.
    ResyncRequired {
        client_id: ClientId,
    },
    Message {
        client_id: ClientId,
        message: Message,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Graceful,
    Timeout,
    Kicked,
    Overflow,
    /// Superseded by a new connection from the same address.
    Reconnected,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Kicked => "kicked",
            DisconnectReason::Overflow => "reliable buffer overflow",
            DisconnectReason::Reconnected => "reconnected",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    ServerInfo(ServerInfo),
    Connected {
        client_id: ClientId,
    },
    ConnectionFailed {
        reason: String,
    },
    /// Required files are missing; the connection was dropped so they can
    /// be fetched out of band.
    DownloadRequired {
        files: Vec<WantedFile>,
        site: String,
    },
    Message(Message),
    Disconnected {
        reason: String,
    },
}
