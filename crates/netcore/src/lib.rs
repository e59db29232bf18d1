pub mod buffer;
pub mod config;
pub mod huffman;
pub mod net;
pub mod session;

pub use buffer::{ByteBuffer, Seek};
pub use config::{ClientConfig, ServerConfig};
pub use huffman::{AdaptiveHuffman, ClientCodec, CodecError, ServerCodec};
pub use net::protocol::{DEFAULT_PORT, GAME_VERSION, MAX_PACKET_SIZE, TICRATE};
pub use net::{
    BanList, ClientConnection, ClientId, ClientState, ClientTransport, ConnectionManager,
    ConnectionStage, ControlPacket, HandshakeError, Message, MessageKind, MessageRegistry,
    NetworkEndpoint, NetworkStats, PacketError, PacketFlags, ResourceResolver, ServerInfo,
    ServerTransport, TokenIssuer, TransportConfig, TransportError, Version, WantedFile,
};
pub use session::{ClientEvent, ClientSession, DisconnectReason, ServerEvent, ServerHost};
