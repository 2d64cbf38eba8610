//! Connection cache: one long-lived channel per peer name, established on first use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::PeerRegistry;
use crate::transport::{Channel, Transport, TransportError};

/// Default time allowed for establishing a channel.
pub const DEFAULT_CHANNEL_TIMEOUT: Duration = Duration::from_secs(60);

type Slot = Arc<tokio::sync::Mutex<Option<Arc<dyn Channel>>>>;

#[derive(Debug, thiserror::Error)]
pub enum EstablishError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("session is shutting down")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum ObtainError {
    #[error("peer {0:?} is not in the registry")]
    PeerUnknown(String),
    #[error("cannot establish channel to {peer:?}: {source}")]
    ChannelEstablishFailed {
        peer: String,
        #[source]
        source: EstablishError,
    },
}

/// Channels keyed by peer name. Concurrent `obtain` calls for one name share a per-name lock, so
/// at most one establishment is ever in flight for a peer.
pub struct ConnectionCache {
    transport: Arc<dyn Transport>,
    registry: Arc<PeerRegistry>,
    timeout: Duration,
    shutdown: CancellationToken,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ConnectionCache {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<PeerRegistry>,
        timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport,
            registry,
            timeout,
            shutdown,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, name: &str) -> Slot {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Return the open cached channel for `name`, or establish one. Failures are final; the
    /// caller decides whether to try again.
    pub async fn obtain(&self, name: &str) -> Result<Arc<dyn Channel>, ObtainError> {
        let endpoint = self
            .registry
            .endpoint(name)
            .ok_or_else(|| ObtainError::PeerUnknown(name.to_string()))?;

        let slot = self.slot(name);
        let mut cached = slot.lock().await;
        if let Some(channel) = cached.as_ref() {
            if !channel.is_closed() {
                debug!(peer = %name, "reusing established channel");
                return Ok(channel.clone());
            }
        }

        debug!(peer = %name, locator = %endpoint.locator, "establishing channel");
        let establish = tokio::time::timeout(
            self.timeout,
            self.transport.open_channel(&endpoint, self.timeout),
        );
        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(EstablishError::Cancelled),
            r = establish => match r {
                Ok(Ok(channel)) => Ok(channel),
                Ok(Err(e)) => Err(EstablishError::Transport(e)),
                Err(_) => Err(EstablishError::Timeout(self.timeout)),
            },
        };
        match result {
            Ok(channel) => {
                info!(peer = %name, "channel established");
                *cached = Some(channel.clone());
                Ok(channel)
            }
            Err(source) => {
                warn!(peer = %name, error = %source, "channel establishment failed");
                Err(ObtainError::ChannelEstablishFailed {
                    peer: name.to_string(),
                    source,
                })
            }
        }
    }

    /// Cached channel for `name`, if one exists (open or not).
    pub async fn cached(&self, name: &str) -> Option<Arc<dyn Channel>> {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()?;
        let guard = slot.lock().await;
        guard.clone()
    }

    /// Close and forget every cached channel. Only called on session shutdown.
    pub async fn close_all(&self) {
        let slots: Vec<(String, Slot)> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (name, slot) in slots {
            if let Some(channel) = slot.lock().await.take() {
                if !channel.is_closed() {
                    channel.close().await;
                    debug!(peer = %name, "channel closed");
                }
            }
        }
    }
}
