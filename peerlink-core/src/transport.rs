//! Transport adapter boundary. The core never touches sockets; a host supplies a `Transport`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::connectivity::ConnectivityEvent;
use crate::identity::{EndpointDescriptor, PeerIdentity};
use crate::protocol::{Advertisement, DiscoveryQuery, DiscoveryResponse, Message};
use crate::wire::{FrameDecodeError, FrameEncodeError};

/// Everything the adapter pushes into the session. Consumed in order by a single task.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connectivity(ConnectivityEvent),
    Discovery(DiscoveryResponse),
    Message(Message),
}

/// Parameters for joining the network.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub identity: PeerIdentity,
    /// Per-instance directory for transport state. Format is the adapter's business.
    pub cache_dir: PathBuf,
    /// Where to fetch bootstrap seeds from, if the adapter uses them.
    pub seed_uri: Option<String>,
    /// Serve as an upstream node instead of looking for one.
    pub act_as_rendezvous: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport has not joined the network")]
    NotJoined,
    #[error("channel closed")]
    Closed,
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame encode error: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("frame decode error: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Ordered, one-way message carrier to a single peer.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Queue one message. Delivery is best-effort; there is no acknowledgement.
    async fn send(&self, message: &Message) -> Result<(), TransportError>;

    fn is_closed(&self) -> bool;

    async fn close(&self);
}

/// Publish/subscribe/unicast service the core runs on.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Join the network. Connectivity notices, discovery responses and inbound messages are
    /// pushed to `events` from then on. Returns the descriptor other peers use to reach us.
    async fn join(
        &self,
        request: JoinRequest,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<EndpointDescriptor, TransportError>;

    /// Publish locally and remotely. `lifetime` is how long we keep answering for it,
    /// `expiration` how long remote peers may cache it.
    async fn publish(
        &self,
        advertisement: &Advertisement,
        lifetime: Duration,
        expiration: Duration,
    ) -> Result<(), TransportError>;

    /// Send a discovery query. Responses arrive later as `TransportEvent::Discovery`.
    async fn query(&self, query: &DiscoveryQuery) -> Result<(), TransportError>;

    async fn open_channel(
        &self,
        endpoint: &EndpointDescriptor,
        timeout: Duration,
    ) -> Result<Arc<dyn Channel>, TransportError>;

    /// Leave the network and stop delivering events.
    async fn leave(&self);
}
