//! LAN discovery: multicast announcements and queries, unicast responses.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use peerlink_core::{
    decode_frame, encode_frame, Advertisement, DiscoveryQuery, DiscoveryResponse, PeerId,
    TransportError, TransportEvent, PROTOCOL_VERSION,
};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transport::locator;

/// Attribute name a query may filter on.
pub const NAME_ATTRIBUTE: &str = "Name";

/// Discovery datagram. Adverts travel without a usable locator; the receiver builds one from the
/// datagram's source address and `channel_port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Datagram {
    Announce {
        protocol_version: u8,
        channel_port: u16,
        advertisement: Advertisement,
    },
    Query {
        protocol_version: u8,
        query: DiscoveryQuery,
    },
    Response {
        protocol_version: u8,
        channel_port: u16,
        advertisement: Advertisement,
    },
}

/// Our current advertisement and how long we keep answering for it.
#[derive(Debug, Clone)]
pub struct Published {
    pub advertisement: Advertisement,
    pub channel_port: u16,
    pub until: Instant,
}

impl Published {
    pub fn new(advertisement: Advertisement, channel_port: u16, lifetime: Duration) -> Self {
        Self {
            advertisement,
            channel_port,
            until: Instant::now() + lifetime,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.until
    }

    fn peer_id(&self) -> Option<&PeerId> {
        advertised_id(&self.advertisement)
    }
}

pub type SharedPublished = Arc<Mutex<Option<Published>>>;

/// Responses still accepted for the latest query. Each query resets it to `max_results`.
pub type ResponseBudget = Arc<AtomicU32>;

/// Take one response from the budget. False once it is spent.
fn take_response(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

fn advertised_id(adv: &Advertisement) -> Option<&PeerId> {
    match adv {
        Advertisement::Endpoint(e) => Some(&e.peer_id),
        Advertisement::Other { .. } => None,
    }
}

pub fn make_multicast_socket(group: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

pub async fn send_datagram(
    socket: &UdpSocket,
    datagram: &Datagram,
    dest: SocketAddr,
) -> Result<(), TransportError> {
    let frame = encode_frame(datagram)?;
    socket.send_to(&frame, dest).await?;
    Ok(())
}

/// Whether our advertisement answers `query`. Only the `Name` attribute is understood.
pub fn matches(query: &DiscoveryQuery, adv: &Advertisement) -> bool {
    if query.max_results == 0 {
        return false;
    }
    let Advertisement::Endpoint(e) = adv else {
        return false;
    };
    if let Some(target) = &query.target {
        if *target != e.peer_id {
            return false;
        }
    }
    match (query.attribute.as_deref(), query.value.as_deref()) {
        (None, _) => true,
        (Some(NAME_ATTRIBUTE), Some(value)) => e.name.as_deref() == Some(value),
        (Some(NAME_ATTRIBUTE), None) => e.name.is_some(),
        (Some(_), _) => false,
    }
}

/// Rewrite the advertised endpoint so it points at the datagram's sender.
pub fn localize(mut adv: Advertisement, from: SocketAddr, channel_port: u16) -> Advertisement {
    if let Advertisement::Endpoint(e) = &mut adv {
        e.endpoint.locator = locator(SocketAddr::new(from.ip(), channel_port));
    }
    adv
}

/// Receive datagrams until cancelled. Announcements and responses become discovery events;
/// queries are answered straight back to the sender while our advertisement is live.
/// Responses beyond the latest query's `max_results` are dropped; announcements are not counted.
pub async fn recv_loop(
    socket: Arc<UdpSocket>,
    published: SharedPublished,
    budget: ResponseBudget,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = tokio::select! {
            _ = cancel.cancelled() => break,
            r = socket.recv_from(&mut buf) => match r {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "discovery receive failed");
                    continue;
                }
            },
        };
        let datagram = match decode_frame::<Datagram>(&buf[..n]) {
            Ok((d, _)) => d,
            Err(e) => {
                debug!(from = %from, error = %e, "ignoring datagram");
                continue;
            }
        };
        let ours = published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let own_id = ours.as_ref().and_then(|p| p.peer_id().cloned());
        let is_response = matches!(datagram, Datagram::Response { .. });
        match datagram {
            Datagram::Announce {
                protocol_version,
                channel_port,
                advertisement,
            }
            | Datagram::Response {
                protocol_version,
                channel_port,
                advertisement,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    continue;
                }
                if own_id.is_some() && advertised_id(&advertisement) == own_id.as_ref() {
                    continue;
                }
                if is_response && !take_response(&budget) {
                    debug!(from = %from, "query already answered in full; dropping response");
                    continue;
                }
                let response = DiscoveryResponse {
                    source: from.to_string(),
                    advertisements: vec![localize(advertisement, from, channel_port)],
                };
                if events.send(TransportEvent::Discovery(response)).await.is_err() {
                    break;
                }
            }
            Datagram::Query {
                protocol_version,
                query,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    continue;
                }
                let Some(ours) = ours.filter(Published::is_live) else {
                    continue;
                };
                if !matches(&query, &ours.advertisement) {
                    continue;
                }
                let reply = Datagram::Response {
                    protocol_version: PROTOCOL_VERSION,
                    channel_port: ours.channel_port,
                    advertisement: ours.advertisement,
                };
                if let Err(e) = send_datagram(&socket, &reply, from).await {
                    warn!(to = %from, error = %e, "discovery response failed");
                }
            }
        }
    }
    debug!("discovery receiver stopped");
}
