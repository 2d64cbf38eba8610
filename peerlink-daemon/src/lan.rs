//! LAN transport adapter: multicast discovery plus TCP channels.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use peerlink_core::{
    Advertisement, Channel, ConnectivityEvent, DiscoveryQuery, EndpointDescriptor, JoinRequest,
    Transport, TransportError, TransportEvent, PROTOCOL_VERSION,
};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::discovery::{self, Datagram, Published, ResponseBudget, SharedPublished};
use crate::transport::{self, TcpChannel};

#[derive(Debug, Clone, Copy)]
pub struct LanSettings {
    pub multicast_group: Ipv4Addr,
    pub discovery_port: u16,
    pub channel_port: u16,
}

struct Joined {
    socket: Arc<UdpSocket>,
    group: SocketAddr,
    channel_port: u16,
    published: SharedPublished,
    budget: ResponseBudget,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct LanTransport {
    settings: LanSettings,
    joined: Mutex<Option<Joined>>,
}

impl LanTransport {
    pub fn new(settings: LanSettings) -> Self {
        Self {
            settings,
            joined: Mutex::new(None),
        }
    }

    fn with_joined<T>(&self, f: impl FnOnce(&Joined) -> T) -> Result<T, TransportError> {
        let guard = self.joined.lock().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map(f).ok_or(TransportError::NotJoined)
    }
}

#[async_trait]
impl Transport for LanTransport {
    async fn join(
        &self,
        request: JoinRequest,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<EndpointDescriptor, TransportError> {
        if self.with_joined(|_| ()).is_ok() {
            return Err(TransportError::Rejected("already joined".into()));
        }
        let s = self.settings;
        let socket = Arc::new(discovery::make_multicast_socket(
            s.multicast_group,
            s.discovery_port,
        )?);
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, s.channel_port)).await?;
        let channel_port = listener.local_addr()?.port();
        info!(
            group = %s.multicast_group,
            discovery_port = s.discovery_port,
            channel_port,
            "lan transport bound"
        );

        let cancel = CancellationToken::new();
        let published: SharedPublished = Arc::new(Mutex::new(None));
        let budget: ResponseBudget = Arc::new(AtomicU32::new(0));
        let tasks = vec![
            tokio::spawn(discovery::recv_loop(
                socket.clone(),
                published.clone(),
                budget.clone(),
                events.clone(),
                cancel.clone(),
            )),
            tokio::spawn(transport::run_listener(
                listener,
                events.clone(),
                cancel.clone(),
            )),
        ];
        *self.joined.lock().unwrap_or_else(PoisonError::into_inner) = Some(Joined {
            socket,
            group: SocketAddr::new(s.multicast_group.into(), s.discovery_port),
            channel_port,
            published,
            budget,
            cancel,
            tasks,
        });

        // Bound sockets are all the connectivity a LAN needs.
        let _ = events
            .send(TransportEvent::Connectivity(ConnectivityEvent::Reachable))
            .await;

        Ok(EndpointDescriptor::new(
            format!("pipe-{}", request.identity.id),
            transport::locator(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), channel_port)),
        ))
    }

    async fn publish(
        &self,
        advertisement: &Advertisement,
        lifetime: Duration,
        expiration: Duration,
    ) -> Result<(), TransportError> {
        let (socket, group, channel_port) = self.with_joined(|j| {
            *j.published.lock().unwrap_or_else(PoisonError::into_inner) = Some(Published::new(
                advertisement.clone(),
                j.channel_port,
                lifetime,
            ));
            (j.socket.clone(), j.group, j.channel_port)
        })?;
        debug!(?lifetime, ?expiration, "announcing");
        let announce = Datagram::Announce {
            protocol_version: PROTOCOL_VERSION,
            channel_port,
            advertisement: advertisement.clone(),
        };
        discovery::send_datagram(&socket, &announce, group).await
    }

    async fn query(&self, query: &DiscoveryQuery) -> Result<(), TransportError> {
        let (socket, group) = self.with_joined(|j| {
            j.budget.store(query.max_results, Ordering::Release);
            (j.socket.clone(), j.group)
        })?;
        let datagram = Datagram::Query {
            protocol_version: PROTOCOL_VERSION,
            query: query.clone(),
        };
        discovery::send_datagram(&socket, &datagram, group).await
    }

    async fn open_channel(
        &self,
        endpoint: &EndpointDescriptor,
        timeout: Duration,
    ) -> Result<Arc<dyn Channel>, TransportError> {
        self.with_joined(|_| ())?;
        let addr = transport::parse_locator(&endpoint.locator)?;
        let channel = TcpChannel::connect(addr, timeout).await?;
        Ok(Arc::new(channel))
    }

    async fn leave(&self) {
        let joined = self
            .joined
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(joined) = joined else {
            return;
        };
        joined.cancel.cancel();
        for task in joined.tasks {
            let _ = task.await;
        }
        info!("left lan");
    }
}
