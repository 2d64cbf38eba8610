//! Peer identity: opaque peer ID, display name, and the endpoint descriptor used to reach a peer.

use std::fmt;

use serde::{Deserialize, Serialize};

const PEER_ID_PREFIX: &str = "urn:peerlink:peer:";

/// Opaque peer ID. Carried in the `From` field of every message; never used as the registry key.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a fresh random peer ID.
    pub fn generate() -> Self {
        PeerId(format!(
            "{}{}",
            PEER_ID_PREFIX,
            uuid::Uuid::new_v4().simple()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// ID plus human-readable name. Two identities with the same name are the same peer as far as the
/// registry is concerned, whatever their IDs.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub id: PeerId,
    pub name: String,
}

impl PeerIdentity {
    pub fn new(id: PeerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// New identity with a freshly generated ID.
    pub fn generate(name: impl Into<String>) -> Self {
        Self::new(PeerId::generate(), name)
    }
}

/// How to reach a peer. Both fields are interpreted only by the transport.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// Stable ID of the peer's inbound channel.
    pub pipe_id: String,
    /// Transport address, e.g. `10.0.0.4:45681` for the LAN transport.
    pub locator: String,
}

impl EndpointDescriptor {
    pub fn new(pipe_id: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            pipe_id: pipe_id.into(),
            locator: locator.into(),
        }
    }

    /// New descriptor with a random pipe ID.
    pub fn with_locator(locator: impl Into<String>) -> Self {
        Self::new(uuid::Uuid::new_v4().simple().to_string(), locator)
    }
}
