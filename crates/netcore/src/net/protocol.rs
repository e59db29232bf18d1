use std::collections::HashMap;
use std::fmt;

use bitflags::bitflags;
use rkyv::{rancor, Archive, Deserialize, Serialize};

use crate::huffman::CodecError;
use crate::net::handshake::WantedFile;

pub const MAX_PACKET_SIZE: usize = 1200;
pub const PACKET_HEADER_SIZE: usize = 5;
pub const DEFAULT_PORT: u16 = 10666;
pub const TICRATE: u32 = 35;

/// First four bytes of every connectionless packet. Sequenced packets never
/// reach this number.
pub const CONTROL_MARKER: u32 = 0xFFFF_FFFF;

/// Slots in the reliable message and sent packet rings.
pub const RING_SIZE: usize = 1 << 10;
/// Slots in the verbatim replay ring.
pub const OLD_PACKET_SLOTS: usize = 256;

/// Set on the header byte of a reliable message.
pub const RELIABLE_BIT: u8 = 0x80;

pub const GAME_VERSION: Version = Version::new(0, 1, 0);

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketFlags: u8 {
        const COMPRESSED = 1 << 0;
        /// Codec slot the payload was compressed with.
        const CODEC_SELECT = 1 << 1;
        /// Receiver must fold this payload into its pending codec.
        const RECORD = 1 << 2;
    }
}

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("packet shorter than its header")]
    Truncated,
    #[error("unknown message header {0:#04x}")]
    UnknownMessage(u8),
    #[error("malformed {0} message")]
    Malformed(&'static str),
    #[error("codec failure: {0}")]
    Codec(#[from] CodecError),
    #[error("stale codec slot {0}")]
    StaleCodec(u8),
    #[error("not a control packet")]
    NotControl,
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub const fn packed(self) -> u32 {
        (self.major as u32) << 16 | (self.minor as u32) << 8 | self.patch as u32
    }

    pub const fn from_packed(packed: u32) -> Self {
        Self {
            major: (packed >> 16) as u8,
            minor: (packed >> 8) as u8,
            patch: packed as u8,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// A client may join if it speaks the same major version and is at least
/// as new as the server's minor version.
pub fn version_compat(server: Version, client: Version) -> bool {
    server.major == client.major && server.minor <= client.minor
}

/// Explanation shown to a client that may not join, or `None` if it may.
pub fn version_message(server: Version, client: Version, email: Option<&str>) -> Option<String> {
    if version_compat(server, client) {
        return None;
    }

    let mut msg = if (client.major, client.minor) < (server.major, server.minor) {
        format!(
            "Your version {} is older than the server version {}.\n\
             Please upgrade to join this server. Server administrators should \
             give players time to upgrade before moving to a new version.\n",
            client, server
        )
    } else {
        format!(
            "The server is running version {} which is older than your version {}.\n\
             If you are the server administrator, upgrade the server.\n",
            server, client
        )
    };

    if let Some(email) = email.filter(|e| !e.is_empty()) {
        msg.push_str(&format!("Server contact: {}\n", email));
    }

    Some(msg)
}

/// Message header value without the reliable bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKind(pub u8);

impl MessageKind {
    /// Client to server: `[u32 ack][u32 ack bits]`.
    pub const ACK: Self = Self(0);
    /// Client to server: `[string reason]`.
    pub const DISCONNECT: Self = Self(1);
    /// Client to server: the client lost state and needs a full snapshot.
    pub const RESYNC_REQUEST: Self = Self(2);
    /// Server to client: `[u16 floor]`, reliable ids below were evicted.
    pub const SKIP: Self = Self(3);
    /// Server to client: `[u32 client id][string digest]`.
    pub const WELCOME: Self = Self(4);

    /// Lowest kind available to applications.
    pub const FIRST_USER: u8 = 16;

    pub fn header(self, reliable: bool) -> u8 {
        if reliable { self.0 | RELIABLE_BIT } else { self.0 }
    }

    pub fn is_reserved(self) -> bool {
        self.0 < Self::FIRST_USER
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDescriptor {
    pub kind: MessageKind,
    pub name: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("message kind {0} is reserved")]
    Reserved(u8),
    #[error("message kind {0} does not fit in seven bits")]
    OutOfRange(u8),
    #[error("message kind {0} already registered")]
    Duplicate(u8),
}

/// Maps received header bytes to the descriptors used to decode the bytes
/// that follow. Built once at startup.
#[derive(Debug, Clone)]
pub struct MessageRegistry {
    descriptors: HashMap<u8, MessageDescriptor>,
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRegistry {
    pub fn new() -> Self {
        let mut descriptors = HashMap::new();
        for (kind, name) in [
            (MessageKind::ACK, "ack"),
            (MessageKind::DISCONNECT, "disconnect"),
            (MessageKind::RESYNC_REQUEST, "resync_request"),
            (MessageKind::SKIP, "skip"),
            (MessageKind::WELCOME, "welcome"),
        ] {
            descriptors.insert(kind.0, MessageDescriptor { kind, name });
        }
        Self { descriptors }
    }

    pub fn register(&mut self, kind: u8, name: &'static str) -> Result<(), RegistryError> {
        if kind & RELIABLE_BIT != 0 {
            return Err(RegistryError::OutOfRange(kind));
        }
        if MessageKind(kind).is_reserved() {
            return Err(RegistryError::Reserved(kind));
        }
        if self.descriptors.contains_key(&kind) {
            return Err(RegistryError::Duplicate(kind));
        }

        self.descriptors.insert(
            kind,
            MessageDescriptor {
                kind: MessageKind(kind),
                name,
            },
        );
        Ok(())
    }

    /// Descriptor for a received header byte and whether it was sent
    /// reliably.
    pub fn resolve(&self, header: u8) -> Option<(&MessageDescriptor, bool)> {
        self.descriptors
            .get(&(header & !RELIABLE_BIT))
            .map(|desc| (desc, header & RELIABLE_BIT != 0))
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// A delivered message body with its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageKind, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ServerInfo {
    pub token: u32,
    pub hostname: String,
    pub players: u8,
    pub max_players: u8,
    pub map: String,
    pub wads: Vec<WantedFile>,
    pub patches: Vec<WantedFile>,
    pub version: u32,
    pub download_site: String,
    pub email: String,
    pub passworded: bool,
}

/// Connectionless packets exchanged before and around a session.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum ControlPacket {
    ServerInfoRequest,
    ServerInfo(ServerInfo),
    Connect {
        token: u32,
        version: u32,
        password_digest: String,
        name: String,
    },
    ConnectionDenied {
        reason: String,
    },
    Disconnect {
        reason: String,
    },
}

impl ControlPacket {
    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        let body = rkyv::to_bytes::<rancor::Error>(self).map_err(PacketError::Serialize)?;
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&CONTROL_MARKER.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        if !is_control(data) {
            return Err(PacketError::NotControl);
        }

        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(data.len() - 4);
        aligned.extend_from_slice(&data[4..]);
        rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(PacketError::Deserialize)
    }
}

pub fn is_control(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == CONTROL_MARKER.to_le_bytes()
}
