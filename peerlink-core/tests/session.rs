//! Two sessions wired together through an in-memory hub.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use peerlink_core::{
    Advertisement, Channel, ConnectivityEvent, DiscoveryQuery, DiscoveryResponse, Direction,
    EndpointDescriptor, JoinRequest, Message, Observer, ReceivedFile, Session, SessionConfig,
    StartError, Transport, TransportError, TransportEvent, WaitError,
};
use rand::RngCore;
use tokio::sync::mpsc;

#[derive(Default)]
struct Hub {
    inboxes: Mutex<HashMap<String, mpsc::Sender<TransportEvent>>>,
    ads: Mutex<Vec<Advertisement>>,
}

impl Hub {
    fn senders(&self) -> Vec<mpsc::Sender<TransportEvent>> {
        self.inboxes.lock().unwrap().values().cloned().collect()
    }
}

struct MemChannel {
    target: mpsc::Sender<TransportEvent>,
    closed: AtomicBool,
}

#[async_trait]
impl Channel for MemChannel {
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.target
            .send(TransportEvent::Message(message.clone()))
            .await
            .map_err(|_| TransportError::Closed)
    }
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MemTransport {
    hub: Arc<Hub>,
    /// Report connectivity on join.
    reachable: bool,
    locator: Mutex<Option<String>>,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    opened: AtomicUsize,
    channels: Mutex<Vec<Arc<MemChannel>>>,
    left: AtomicBool,
}

impl MemTransport {
    fn new(hub: Arc<Hub>, reachable: bool) -> Arc<Self> {
        Arc::new(Self {
            hub,
            reachable,
            locator: Mutex::new(None),
            events: Mutex::new(None),
            opened: AtomicUsize::new(0),
            channels: Mutex::new(Vec::new()),
            left: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Transport for MemTransport {
    async fn join(
        &self,
        request: JoinRequest,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<EndpointDescriptor, TransportError> {
        let locator = format!("mem://{}", request.identity.name);
        self.hub
            .inboxes
            .lock()
            .unwrap()
            .insert(locator.clone(), events.clone());
        *self.locator.lock().unwrap() = Some(locator.clone());
        *self.events.lock().unwrap() = Some(events.clone());
        if self.reachable {
            let _ = events
                .send(TransportEvent::Connectivity(ConnectivityEvent::Reachable))
                .await;
        }
        Ok(EndpointDescriptor::new(
            format!("pipe-{}", request.identity.name),
            locator,
        ))
    }

    async fn publish(
        &self,
        advertisement: &Advertisement,
        _lifetime: Duration,
        _expiration: Duration,
    ) -> Result<(), TransportError> {
        self.hub.ads.lock().unwrap().push(advertisement.clone());
        let response = DiscoveryResponse {
            source: "hub".into(),
            advertisements: vec![advertisement.clone()],
        };
        for inbox in self.hub.senders() {
            let _ = inbox.send(TransportEvent::Discovery(response.clone())).await;
        }
        Ok(())
    }

    async fn query(&self, query: &DiscoveryQuery) -> Result<(), TransportError> {
        let events = self
            .events
            .lock()
            .unwrap()
            .clone()
            .ok_or(TransportError::NotJoined)?;
        let advertisements: Vec<Advertisement> = self
            .hub
            .ads
            .lock()
            .unwrap()
            .iter()
            .take(query.max_results as usize)
            .cloned()
            .collect();
        let _ = events
            .send(TransportEvent::Discovery(DiscoveryResponse {
                source: "hub".into(),
                advertisements,
            }))
            .await;
        Ok(())
    }

    async fn open_channel(
        &self,
        endpoint: &EndpointDescriptor,
        _timeout: Duration,
    ) -> Result<Arc<dyn Channel>, TransportError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let target = self
            .hub
            .inboxes
            .lock()
            .unwrap()
            .get(&endpoint.locator)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(endpoint.locator.clone()))?;
        let channel = Arc::new(MemChannel {
            target,
            closed: AtomicBool::new(false),
        });
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    async fn leave(&self) {
        if let Some(locator) = self.locator.lock().unwrap().take() {
            self.hub.inboxes.lock().unwrap().remove(&locator);
        }
        self.events.lock().unwrap().take();
        self.left.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Recorder {
    completed: Mutex<Vec<ReceivedFile>>,
    registry_updates: AtomicUsize,
}

impl Observer for Recorder {
    fn registry_changed(&self, _peers: &[peerlink_core::PeerRecord]) {
        self.registry_updates.fetch_add(1, Ordering::SeqCst);
    }
    fn transfer_completed(&self, file: &ReceivedFile) {
        self.completed.lock().unwrap().push(file.clone());
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn config(name: &str, dir: &std::path::Path) -> SessionConfig {
    let mut c = SessionConfig::named(name);
    c.cache_dir = dir.join("cache");
    c.received_dir = dir.join(format!("{name}-inbox"));
    c.connect_wait_secs = Some(5);
    c
}

struct Node {
    session: Session,
    transport: Arc<MemTransport>,
    observer: Arc<Recorder>,
}

async fn node(hub: &Arc<Hub>, name: &str, dir: &std::path::Path) -> Node {
    let transport = MemTransport::new(hub.clone(), true);
    let observer = Arc::new(Recorder::default());
    let session = Session::start(config(name, dir), transport.clone(), observer.clone())
        .await
        .unwrap();
    Node {
        session,
        transport,
        observer,
    }
}

async fn pair(dir: &std::path::Path) -> (Node, Node) {
    let hub = Arc::new(Hub::default());
    let alice = node(&hub, "alice", dir).await;
    let bob = node(&hub, "bob", dir).await;
    eventually("mutual discovery", || {
        alice.session.registry().find("bob").is_some()
            && bob.session.registry().find("alice").is_some()
    })
    .await;
    (alice, bob)
}

#[tokio::test]
async fn peers_discover_each_other_but_not_themselves() {
    let dir = tempfile::tempdir().unwrap();
    let (alice, bob) = pair(dir.path()).await;
    assert!(alice.session.connectivity().is_connected());
    assert!(alice.session.registry().find("alice").is_none());
    assert_eq!(alice.session.peers().len(), 1);
    let bob_rec = alice.session.registry().find("bob").unwrap();
    assert_eq!(bob_rec.endpoint.locator, "mem://bob");
    assert_eq!(&bob_rec.identity.id, &bob.session.identity().id);
    assert!(alice.observer.registry_updates.load(Ordering::SeqCst) >= 1);
    alice.session.stop().await;
    bob.session.stop().await;
}

#[tokio::test]
async fn sending_to_unknown_peer_opens_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let hub = Arc::new(Hub::default());
    let alice = node(&hub, "alice", dir.path()).await;
    assert!(!alice.session.send_text_to_peer("bob", "hello").await);
    assert_eq!(alice.transport.opened.load(Ordering::SeqCst), 0);
    alice.session.stop().await;
}

#[tokio::test]
async fn text_lands_in_both_histories() {
    let dir = tempfile::tempdir().unwrap();
    let (alice, bob) = pair(dir.path()).await;

    assert!(alice.session.send_text_to_peer("bob", "hello").await);
    assert!(alice.session.send_text_to_peer("bob", "again").await);
    assert_eq!(alice.transport.opened.load(Ordering::SeqCst), 1);

    let sent = alice.session.registry().history("bob").unwrap();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].direction, Direction::Outgoing);
    assert_eq!(sent[0].author, "alice");

    eventually("bob's history", || {
        bob.session
            .registry()
            .history("alice")
            .is_some_and(|h| h.len() == 2)
    })
    .await;
    let got = bob.session.registry().history("alice").unwrap();
    assert_eq!(got[0].text, "hello");
    assert_eq!(got[1].text, "again");
    assert_eq!(got[0].direction, Direction::Incoming);

    alice.session.stop().await;
    bob.session.stop().await;
}

#[tokio::test]
async fn file_arrives_intact() {
    let dir = tempfile::tempdir().unwrap();
    let (alice, bob) = pair(dir.path()).await;

    let mut data = vec![0u8; 250_001];
    rand::thread_rng().fill_bytes(&mut data);
    let src = dir.path().join("data.bin");
    std::fs::write(&src, &data).unwrap();

    assert!(alice.session.send_file_to_peer("bob", &src).await);
    eventually("transfer completion", || {
        !bob.observer.completed.lock().unwrap().is_empty()
    })
    .await;

    let done = bob.observer.completed.lock().unwrap()[0].clone();
    assert_eq!(done.filename, "data.bin");
    assert_eq!(done.packets, 4);
    assert_eq!(
        done.path,
        dir.path().join("bob-inbox").join("received_data.bin")
    );
    assert_eq!(std::fs::read(&done.path).unwrap(), data);
    assert_eq!(
        alice.session.registry().history("bob").unwrap()[0].text,
        "Send file data.bin"
    );
    eventually("receive history", || {
        bob.session
            .registry()
            .history("alice")
            .is_some_and(|h| h.iter().any(|e| e.text == "Receive file data.bin"))
    })
    .await;

    alice.session.stop().await;
    bob.session.stop().await;
}

#[tokio::test]
async fn stop_closes_channels_and_leaves() {
    let dir = tempfile::tempdir().unwrap();
    let (alice, bob) = pair(dir.path()).await;
    assert!(alice.session.send_text_to_peer("bob", "bye").await);

    alice.session.stop().await;
    assert!(alice.session.is_stopped());
    assert!(alice.transport.left.load(Ordering::SeqCst));
    let channels = alice.transport.channels.lock().unwrap().clone();
    assert_eq!(channels.len(), 1);
    assert!(channels.iter().all(|c| c.is_closed()));
    assert!(!alice.session.send_text_to_peer("bob", "after").await);

    // second stop is a no-op
    alice.session.stop().await;
    bob.session.stop().await;
}

#[tokio::test]
async fn rendezvous_skips_connectivity_wait() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemTransport::new(Arc::new(Hub::default()), false);
    let mut c = config("hub-node", dir.path());
    c.act_as_rendezvous = true;
    let session = Session::start(c, transport, Arc::new(Recorder::default()))
        .await
        .unwrap();
    assert!(session.connectivity().is_connected());
    session.stop().await;
}

#[tokio::test]
async fn unreachable_network_fails_start_after_bound() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemTransport::new(Arc::new(Hub::default()), false);
    let mut c = config("lonely", dir.path());
    c.connect_wait_secs = Some(1);
    let r = Session::start(c, transport.clone(), Arc::new(Recorder::default())).await;
    assert!(matches!(
        r,
        Err(StartError::Connect(WaitError::Timeout(_)))
    ));
    assert!(transport.left.load(Ordering::SeqCst));
}
