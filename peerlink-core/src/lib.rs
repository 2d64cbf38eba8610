//! PeerLink core: peer registry, discovery, channel cache, message routing and chunked file
//! transfer. Transport-agnostic: a host supplies a `Transport` and drives it through a `Session`.

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod discovery;
pub mod identity;
pub mod observer;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
pub mod transfer;
pub mod transport;
pub mod wire;

pub use cache::{ConnectionCache, EstablishError, ObtainError};
pub use config::SessionConfig;
pub use connectivity::{Connectivity, ConnectivityEvent, ConnectivityState, WaitError};
pub use identity::{EndpointDescriptor, PeerId, PeerIdentity};
pub use observer::{NoopObserver, Observer};
pub use protocol::{
    Advertisement, DiscoveryQuery, DiscoveryResponse, EndpointAdvertisement, Message,
    MessageError, MessageType, TextMessage, PROTOCOL_VERSION,
};
pub use registry::{Direction, HistoryEntry, PeerRecord, PeerRegistry};
pub use session::{SendError, Session, StartError};
pub use transfer::{FilePacket, ReceivedFile, SendSummary, TransferError};
pub use transport::{Channel, JoinRequest, Transport, TransportError, TransportEvent};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
