//! Session: wires registry, discovery, channel cache and routing onto one transport.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{ConnectionCache, ObtainError};
use crate::connectivity::{Connectivity, ConnectivityEvent, WaitError};
use crate::discovery::{self, DiscoveryLoop};
use crate::identity::{EndpointDescriptor, PeerIdentity};
use crate::observer::Observer;
use crate::protocol::{Advertisement, EndpointAdvertisement, TextMessage};
use crate::registry::{now_millis, HistoryEntry, PeerRecord, PeerRegistry};
use crate::router::{self, Router, FILE_QUEUE_DEPTH};
use crate::transfer::{self, FileReceiver, SendSummary, TransferError};
use crate::transport::{JoinRequest, Transport, TransportError, TransportEvent};
use crate::SessionConfig;

/// Depth of the inbound event queue the transport pushes into.
pub const EVENT_QUEUE_DEPTH: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("cannot create {path}: {source}", path = .path.display())]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("joining the network failed: {0}")]
    Join(#[source] TransportError),
    #[error(transparent)]
    Connect(#[from] WaitError),
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Obtain(#[from] ObtainError),
    #[error("send failed: {0}")]
    Channel(#[source] TransportError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

pub struct Session {
    identity: PeerIdentity,
    config: SessionConfig,
    local_endpoint: EndpointDescriptor,
    transport: Arc<dyn Transport>,
    registry: Arc<PeerRegistry>,
    connectivity: Arc<Connectivity>,
    cache: ConnectionCache,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Join the network, wait for connectivity, then start discovering peers.
    pub async fn start(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        observer: Arc<dyn Observer>,
    ) -> Result<Self, StartError> {
        let identity = PeerIdentity::generate(config.name.clone());
        info!(name = %identity.name, id = %identity.id, "starting session");
        tokio::fs::create_dir_all(&config.received_dir)
            .await
            .map_err(|source| StartError::Io {
                path: config.received_dir.clone(),
                source,
            })?;

        let shutdown = CancellationToken::new();
        let registry = Arc::new(PeerRegistry::with_observer(
            identity.name.clone(),
            observer.clone(),
        ));
        let connectivity = Arc::new(Connectivity::new());
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (files_tx, files_rx) = mpsc::channel(FILE_QUEUE_DEPTH);

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(pump_events(
            events_rx,
            Router::new(registry.clone(), files_tx),
            registry.clone(),
            connectivity.clone(),
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(router::run_file_worker(
            FileReceiver::new(&config.received_dir, config.packet_size),
            files_rx,
            registry.clone(),
            observer,
        )));

        let request = JoinRequest {
            identity: identity.clone(),
            cache_dir: config.cache_dir.join(&identity.name),
            seed_uri: config.seed_uri.clone(),
            act_as_rendezvous: config.act_as_rendezvous,
        };
        let local_endpoint = match transport.join(request, events_tx).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                shutdown.cancel();
                return Err(StartError::Join(e));
            }
        };
        info!(locator = %local_endpoint.locator, "joined network");

        if config.act_as_rendezvous {
            connectivity.on_event(ConnectivityEvent::BecameUpstream);
        }
        if let Err(e) = connectivity
            .wait_connected_for(config.connect_wait(), &shutdown)
            .await
        {
            shutdown.cancel();
            transport.leave().await;
            return Err(e.into());
        }

        let advertisement = Advertisement::Endpoint(EndpointAdvertisement {
            peer_id: identity.id.clone(),
            name: Some(identity.name.clone()),
            description: config.description.clone(),
            endpoint: local_endpoint.clone(),
        });
        tasks.push(tokio::spawn(
            DiscoveryLoop::new(transport.clone(), advertisement, config.discovery())
                .run(shutdown.clone()),
        ));

        let cache = ConnectionCache::new(
            transport.clone(),
            registry.clone(),
            config.channel_timeout(),
            shutdown.clone(),
        );
        Ok(Self {
            identity,
            config,
            local_endpoint,
            transport,
            registry,
            connectivity,
            cache,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn local_endpoint(&self) -> &EndpointDescriptor {
        &self.local_endpoint
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.registry.snapshot()
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Send a text message and record it in the peer's history.
    pub async fn send_text(&self, peer: &str, text: &str) -> Result<(), SendError> {
        let channel = self.cache.obtain(peer).await?;
        let msg = TextMessage::new(self.identity.clone(), text).to_message();
        channel.send(&msg).await.map_err(SendError::Channel)?;
        self.registry.add_history(
            peer,
            HistoryEntry::outgoing(self.identity.name.as_str(), text),
        );
        Ok(())
    }

    /// Send a file in packets. Runs on the caller's task for the whole transfer.
    pub async fn send_file(&self, peer: &str, path: &Path) -> Result<SendSummary, SendError> {
        let channel = self.cache.obtain(peer).await?;
        let summary =
            transfer::send_file(channel.as_ref(), &self.identity, path, self.config.packet_size)
                .await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.registry.add_history(
            peer,
            HistoryEntry::outgoing(self.identity.name.as_str(), format!("Send file {name}")),
        );
        Ok(summary)
    }

    pub async fn send_text_to_peer(&self, peer: &str, text: &str) -> bool {
        match self.send_text(peer, text).await {
            Ok(()) => true,
            Err(e) => {
                warn!(peer, error = %e, "text not sent");
                false
            }
        }
    }

    pub async fn send_file_to_peer(&self, peer: &str, path: &Path) -> bool {
        match self.send_file(peer, path).await {
            Ok(summary) => {
                info!(peer, packets = summary.packets, bytes = summary.bytes, "file sent");
                true
            }
            Err(e) => {
                warn!(peer, path = %path.display(), error = %e, "file not sent");
                false
            }
        }
    }

    /// Stop background tasks, close every cached channel, leave the network. Idempotent.
    pub async fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("stopping session");
        self.shutdown.cancel();
        self.cache.close_all().await;
        self.transport.leave().await;
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "session task ended abnormally");
            }
        }
        debug!("session stopped");
    }
}

/// Single consumer of the transport's event queue. Keeps per-channel order because everything
/// goes through this one task.
async fn pump_events(
    mut events: mpsc::Receiver<TransportEvent>,
    router: Router,
    registry: Arc<PeerRegistry>,
    connectivity: Arc<Connectivity>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            TransportEvent::Connectivity(e) => {
                connectivity.on_event(e);
            }
            TransportEvent::Discovery(response) => {
                discovery::ingest_response(&registry, &response, now_millis());
            }
            TransportEvent::Message(msg) => {
                router.route(msg).await;
            }
        }
    }
    debug!("event pump stopped");
}
