//! Discovery loop: publish our advertisement, query for others, sleep, repeat. Responses are
//! ingested into the registry by `ingest_response`, whenever they arrive.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::identity::PeerIdentity;
use crate::protocol::{Advertisement, DiscoveryQuery, DiscoveryResponse};
use crate::registry::{PeerRecord, PeerRegistry, Upsert};
use crate::transport::{Transport, TransportError};

pub const DEFAULT_ADVERTISEMENT_LIFETIME: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_ADVERTISEMENT_EXPIRATION: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_RESULTS: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoverySettings {
    pub lifetime: Duration,
    pub expiration: Duration,
    pub interval: Duration,
    pub max_results: u32,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            lifetime: DEFAULT_ADVERTISEMENT_LIFETIME,
            expiration: DEFAULT_ADVERTISEMENT_EXPIRATION,
            interval: DEFAULT_DISCOVERY_INTERVAL,
            max_results: DEFAULT_MAX_RESULTS,
        }
    }
}

/// A failed cycle step. Logged; the loop always carries on.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("publish failed: {0}")]
    Publish(#[source] TransportError),
    #[error("query failed: {0}")]
    Query(#[source] TransportError),
}

pub struct DiscoveryLoop {
    transport: Arc<dyn Transport>,
    advertisement: Advertisement,
    settings: DiscoverySettings,
}

impl DiscoveryLoop {
    pub fn new(
        transport: Arc<dyn Transport>,
        advertisement: Advertisement,
        settings: DiscoverySettings,
    ) -> Self {
        Self {
            transport,
            advertisement,
            settings,
        }
    }

    /// One publish-then-query step. Both steps run even if the first one fails.
    pub async fn cycle(&self) -> Vec<DiscoveryError> {
        let mut errors = Vec::new();
        debug!(
            lifetime = ?self.settings.lifetime,
            expiration = ?self.settings.expiration,
            "publishing advertisement"
        );
        if let Err(e) = self
            .transport
            .publish(
                &self.advertisement,
                self.settings.lifetime,
                self.settings.expiration,
            )
            .await
        {
            errors.push(DiscoveryError::Publish(e));
        }
        let query = DiscoveryQuery::any(self.settings.max_results);
        debug!(max_results = query.max_results, "sending discovery query");
        if let Err(e) = self.transport.query(&query).await {
            errors.push(DiscoveryError::Query(e));
        }
        errors
    }

    /// Run until `cancel` fires. Transport errors never end the loop.
    pub async fn run(self, cancel: CancellationToken) {
        info!(interval = ?self.settings.interval, "discovery loop started");
        loop {
            for e in self.cycle().await {
                warn!(error = %e, "discovery cycle step failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
        }
        info!("discovery loop stopped");
    }
}

/// Feed every named endpoint advertisement in `response` into the registry, skipping our own.
/// Returns how many records were inserted or refreshed.
pub fn ingest_response(
    registry: &PeerRegistry,
    response: &DiscoveryResponse,
    now_ms: u64,
) -> usize {
    debug!(
        source = %response.source,
        count = response.advertisements.len(),
        "discovery response"
    );
    let mut applied = 0;
    for adv in &response.advertisements {
        let Advertisement::Endpoint(adv) = adv else {
            continue;
        };
        let Some(name) = adv.name.as_deref() else {
            continue;
        };
        if name == registry.local_name() {
            continue;
        }
        let record = PeerRecord::new(
            PeerIdentity::new(adv.peer_id.clone(), name),
            adv.endpoint.clone(),
            now_ms,
        )
        .with_description(adv.description.clone());
        match registry.upsert(record) {
            Upsert::Inserted | Upsert::Updated => applied += 1,
            Upsert::IgnoredSelf => {}
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::identity::{EndpointDescriptor, PeerId};
    use crate::protocol::EndpointAdvertisement;
    use crate::transport::{Channel, JoinRequest, TransportEvent};

    fn endpoint_adv(name: Option<&str>, locator: &str) -> Advertisement {
        Advertisement::Endpoint(EndpointAdvertisement {
            peer_id: PeerId::generate(),
            name: name.map(str::to_string),
            description: Some("desc".into()),
            endpoint: EndpointDescriptor::new("pipe", locator),
        })
    }

    fn response(advs: Vec<Advertisement>) -> DiscoveryResponse {
        DiscoveryResponse {
            source: "test".into(),
            advertisements: advs,
        }
    }

    #[test]
    fn ingest_skips_self_unnamed_and_foreign_kinds() {
        let reg = PeerRegistry::new("me");
        let n = ingest_response(
            &reg,
            &response(vec![
                endpoint_adv(Some("alice"), "e1"),
                endpoint_adv(Some("me"), "e2"),
                endpoint_adv(None, "e3"),
                Advertisement::Other {
                    kind: "peer-group".into(),
                },
            ]),
            10,
        );
        assert_eq!(n, 1);
        let snap = reg.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].name(), "alice");
        assert_eq!(snap[0].description.as_deref(), Some("desc"));
    }

    #[test]
    fn later_advertisement_refreshes_endpoint_and_time() {
        let reg = PeerRegistry::new("me");
        ingest_response(&reg, &response(vec![endpoint_adv(Some("alice"), "E1")]), 1_000);
        ingest_response(&reg, &response(vec![endpoint_adv(Some("alice"), "E2")]), 2_000);
        let alice = reg.find("alice").unwrap();
        assert_eq!(alice.endpoint.locator, "E2");
        assert_eq!(alice.last_update_ms, 2_000);
    }

    /// Transport whose publish and query always fail, counting the attempts.
    #[derive(Default)]
    struct FailingTransport {
        publishes: AtomicUsize,
        queries: AtomicUsize,
    }

    #[async_trait]
    impl Transport for FailingTransport {
        async fn join(
            &self,
            _request: JoinRequest,
            _events: mpsc::Sender<TransportEvent>,
        ) -> Result<EndpointDescriptor, TransportError> {
            Err(TransportError::NotJoined)
        }
        async fn publish(
            &self,
            _advertisement: &Advertisement,
            _lifetime: Duration,
            _expiration: Duration,
        ) -> Result<(), TransportError> {
            self.publishes.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::NotJoined)
        }
        async fn query(&self, query: &DiscoveryQuery) -> Result<(), TransportError> {
            assert_eq!(query.max_results, 7);
            assert!(query.target.is_none());
            self.queries.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Rejected("no route".into()))
        }
        async fn open_channel(
            &self,
            _endpoint: &EndpointDescriptor,
            _timeout: Duration,
        ) -> Result<Arc<dyn Channel>, TransportError> {
            Err(TransportError::NotJoined)
        }
        async fn leave(&self) {}
    }

    #[tokio::test]
    async fn failing_cycle_reports_both_steps() {
        let transport = Arc::new(FailingTransport::default());
        let settings = DiscoverySettings {
            max_results: 7,
            ..Default::default()
        };
        let l = DiscoveryLoop::new(transport.clone(), endpoint_adv(Some("me"), "x"), settings);
        let errors = l.cycle().await;
        assert_eq!(errors.len(), 2);
        assert!(matches!(errors[0], DiscoveryError::Publish(_)));
        assert!(matches!(errors[1], DiscoveryError::Query(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn loop_survives_failures_until_cancelled() {
        let transport = Arc::new(FailingTransport::default());
        let settings = DiscoverySettings {
            interval: Duration::from_secs(60),
            max_results: 7,
            ..Default::default()
        };
        let l = DiscoveryLoop::new(transport.clone(), endpoint_adv(Some("me"), "x"), settings);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(l.run(cancel.clone()));
        // Three cycles: t=0, t=60, t=120.
        tokio::time::sleep(Duration::from_secs(150)).await;
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(transport.publishes.load(Ordering::SeqCst), 3);
        assert_eq!(transport.queries.load(Ordering::SeqCst), 3);
    }
}
