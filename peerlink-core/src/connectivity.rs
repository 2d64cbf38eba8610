//! Connectivity gate: has the local peer got a path into the network yet?

use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Disconnected,
    Connected,
}

/// Connectivity notifications raised by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// The local node can reach the network directly.
    Reachable,
    UpstreamConnected,
    UpstreamReconnected,
    UpstreamDisconnected,
    UpstreamFailed,
    /// Downstream client events. They say nothing about local reachability.
    ClientConnected,
    ClientReconnected,
    ClientDisconnected,
    ClientFailed,
    /// The local node now serves as an upstream node itself.
    BecameUpstream,
    BecameEdge,
}

impl ConnectivityEvent {
    /// Whether this event proves the local node has a path into the network.
    pub fn grants_connectivity(&self) -> bool {
        matches!(
            self,
            ConnectivityEvent::Reachable
                | ConnectivityEvent::UpstreamConnected
                | ConnectivityEvent::UpstreamReconnected
                | ConnectivityEvent::BecameUpstream
        )
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("timed out after {0:?} waiting for connectivity")]
    Timeout(Duration),
    #[error("cancelled while waiting for connectivity")]
    Cancelled,
}

/// Two-state machine. `Connected` is sticky: once reached it stays for the session, so the wait is
/// a one-shot startup gate rather than a link-health signal.
#[derive(Debug)]
pub struct Connectivity {
    state: watch::Sender<ConnectivityState>,
}

impl Connectivity {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectivityState::Disconnected);
        Self { state }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectivityState::Connected
    }

    /// Apply a transport event. Returns true only on the transition into `Connected`.
    pub fn on_event(&self, event: ConnectivityEvent) -> bool {
        debug!(?event, "connectivity event");
        if !event.grants_connectivity() {
            return false;
        }
        let changed = self.state.send_if_modified(|s| {
            if *s == ConnectivityState::Connected {
                false
            } else {
                *s = ConnectivityState::Connected;
                true
            }
        });
        if changed {
            info!(?event, "connected to network");
        }
        changed
    }

    /// Suspend until connected. Every wake-up re-checks the state before returning.
    pub async fn wait_connected(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we borrow it.
        let _ = rx.wait_for(|s| *s == ConnectivityState::Connected).await;
    }

    /// Like `wait_connected` with an optional bound and a cancellation token.
    pub async fn wait_connected_for(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), WaitError> {
        if self.is_connected() {
            return Ok(());
        }
        debug!("awaiting connectivity");
        let wait = async {
            match timeout {
                Some(t) => tokio::time::timeout(t, self.wait_connected())
                    .await
                    .map_err(|_| WaitError::Timeout(t)),
                None => {
                    self.wait_connected().await;
                    Ok(())
                }
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(WaitError::Cancelled),
            r = wait => r,
        }
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn client_events_do_not_connect() {
        let c = Connectivity::new();
        for e in [
            ConnectivityEvent::ClientConnected,
            ConnectivityEvent::ClientReconnected,
            ConnectivityEvent::ClientDisconnected,
            ConnectivityEvent::ClientFailed,
            ConnectivityEvent::UpstreamDisconnected,
            ConnectivityEvent::UpstreamFailed,
            ConnectivityEvent::BecameEdge,
        ] {
            assert!(!c.on_event(e));
        }
        assert_eq!(c.state(), ConnectivityState::Disconnected);
    }

    #[test]
    fn first_grant_transitions_once() {
        let c = Connectivity::new();
        assert!(c.on_event(ConnectivityEvent::UpstreamConnected));
        assert!(!c.on_event(ConnectivityEvent::UpstreamReconnected));
        assert!(c.is_connected());
    }

    #[test]
    fn connected_is_sticky() {
        let c = Connectivity::new();
        c.on_event(ConnectivityEvent::BecameUpstream);
        c.on_event(ConnectivityEvent::UpstreamDisconnected);
        c.on_event(ConnectivityEvent::ClientFailed);
        assert!(c.is_connected());
    }

    #[tokio::test]
    async fn wait_returns_after_transition() {
        let c = Arc::new(Connectivity::new());
        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.wait_connected().await })
        };
        tokio::task::yield_now().await;
        c.on_event(ConnectivityEvent::ClientConnected);
        c.on_event(ConnectivityEvent::Reachable);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn wait_is_immediate_when_connected() {
        let c = Connectivity::new();
        c.on_event(ConnectivityEvent::Reachable);
        let cancel = CancellationToken::new();
        assert_eq!(
            c.wait_connected_for(Some(Duration::from_millis(1)), &cancel)
                .await,
            Ok(())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out() {
        let c = Connectivity::new();
        let cancel = CancellationToken::new();
        let r = c
            .wait_connected_for(Some(Duration::from_secs(5)), &cancel)
            .await;
        assert_eq!(r, Err(WaitError::Timeout(Duration::from_secs(5))));
    }

    #[tokio::test]
    async fn wait_can_be_cancelled() {
        let c = Connectivity::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            c.wait_connected_for(None, &cancel).await,
            Err(WaitError::Cancelled)
        );
    }
}
