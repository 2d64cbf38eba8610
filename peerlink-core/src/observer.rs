//! Presentation hooks. Called synchronously after the state they report has been committed.

use crate::registry::{HistoryEntry, PeerRecord};
use crate::transfer::ReceivedFile;

pub trait Observer: Send + Sync {
    /// A peer was added or its advertisement refreshed. `peers` is a point-in-time snapshot.
    fn registry_changed(&self, _peers: &[PeerRecord]) {}

    /// The conversation history of `peer` gained an entry.
    fn history_changed(&self, _peer: &str, _history: &[HistoryEntry]) {}

    /// A file arrived completely.
    fn transfer_completed(&self, _file: &ReceivedFile) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {}
