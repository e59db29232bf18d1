pub mod channel;
pub mod connection;
pub mod endpoint;
pub mod handshake;
pub mod history;
pub mod protocol;
pub mod stats;
pub mod tracking;
pub mod transport;

pub use channel::{ReliableChannel, ReliableReceiver};
pub use connection::{Admission, ClientConnection, ClientId, ConnectionManager};
pub use endpoint::NetworkEndpoint;
pub use handshake::{
    BanList, ClientState, ConnectionStage, HandshakeError, ResourceResolver, TokenIssuer,
    WantedFile,
};
pub use history::PacketHistory;
pub use protocol::{
    ControlPacket, Message, MessageKind, MessageRegistry, PacketError, PacketFlags, ServerInfo,
    Version,
};
pub use stats::NetworkStats;
pub use tracking::{AckTracker, ReceiveTracker};
pub use transport::{ClientTransport, ServerTransport, TransportConfig, TransportError};
