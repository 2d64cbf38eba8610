//! Peer registry: known peers keyed by display name, in discovery order.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use crate::identity::{EndpointDescriptor, PeerIdentity};
use crate::observer::Observer;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// One line of a conversation with a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub direction: Direction,
    /// Name of whoever wrote the line.
    pub author: String,
    pub timestamp_ms: u64,
    pub text: String,
}

impl HistoryEntry {
    pub fn incoming(author: impl Into<String>, text: impl Into<String>) -> Self {
        Self::at(Direction::Incoming, author, text, now_millis())
    }

    pub fn outgoing(author: impl Into<String>, text: impl Into<String>) -> Self {
        Self::at(Direction::Outgoing, author, text, now_millis())
    }

    pub fn at(
        direction: Direction,
        author: impl Into<String>,
        text: impl Into<String>,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            direction,
            author: author.into(),
            timestamp_ms,
            text: text.into(),
        }
    }
}

/// A discovered peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub identity: PeerIdentity,
    pub endpoint: EndpointDescriptor,
    pub description: Option<String>,
    pub last_update_ms: u64,
    pub history: Vec<HistoryEntry>,
}

impl PeerRecord {
    pub fn new(identity: PeerIdentity, endpoint: EndpointDescriptor, seen_at_ms: u64) -> Self {
        Self {
            identity,
            endpoint,
            description: None,
            last_update_ms: seen_at_ms,
            history: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }
}

/// Outcome of `PeerRegistry::upsert`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    IgnoredSelf,
}

/// Thread-safe peer list. Records only ever get added or refreshed; nothing is removed.
///
/// A single lock covers the list and every view handed out, which are owned copies.
pub struct PeerRegistry {
    local_name: String,
    peers: RwLock<Vec<PeerRecord>>,
    observer: Option<Arc<dyn Observer>>,
}

impl PeerRegistry {
    pub fn new(local_name: impl Into<String>) -> Self {
        Self {
            local_name: local_name.into(),
            peers: RwLock::new(Vec::new()),
            observer: None,
        }
    }

    pub fn with_observer(local_name: impl Into<String>, observer: Arc<dyn Observer>) -> Self {
        Self {
            observer: Some(observer),
            ..Self::new(local_name)
        }
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Insert a new peer or refresh the endpoint, description and timestamp of the one with the
    /// same name. History is kept across refreshes. The local peer is never inserted.
    pub fn upsert(&self, candidate: PeerRecord) -> Upsert {
        if candidate.name() == self.local_name {
            return Upsert::IgnoredSelf;
        }
        let (outcome, snapshot) = {
            let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
            let outcome = match peers.iter_mut().find(|p| p.name() == candidate.name()) {
                Some(existing) => {
                    existing.endpoint = candidate.endpoint;
                    existing.description = candidate.description;
                    existing.last_update_ms = candidate.last_update_ms;
                    debug!(peer = %existing.name(), "peer refreshed");
                    Upsert::Updated
                }
                None => {
                    info!(peer = %candidate.name(), id = %candidate.identity.id, "peer discovered");
                    peers.push(candidate);
                    Upsert::Inserted
                }
            };
            (outcome, peers.clone())
        };
        if let Some(observer) = &self.observer {
            observer.registry_changed(&snapshot);
        }
        outcome
    }

    pub fn find(&self, name: &str) -> Option<PeerRecord> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    pub fn endpoint(&self, name: &str) -> Option<EndpointDescriptor> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.endpoint.clone())
    }

    /// Point-in-time copy of the list, in discovery order.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append to a peer's history. Returns false if the peer is unknown.
    pub fn add_history(&self, name: &str, entry: HistoryEntry) -> bool {
        let history = {
            let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
            match peers.iter_mut().find(|p| p.name() == name) {
                Some(peer) => {
                    peer.history.push(entry);
                    peer.history.clone()
                }
                None => return false,
            }
        };
        if let Some(observer) = &self.observer {
            observer.history_changed(name, &history);
        }
        true
    }

    pub fn history(&self, name: &str) -> Option<Vec<HistoryEntry>> {
        self.find(name).map(|p| p.history)
    }
}
