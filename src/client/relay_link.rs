//! Client end of the realtime relay.
//!
//! A [`RelayConnector`] opens a joined connection for a session; a [`RelayLink`] keeps one
//! alive in the background, reconnecting with linear backoff and falling back to local-only
//! operation once the attempts are exhausted.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    client::EngineConfig,
    dto::ws::{RelayInboundMessage, RelayOutboundMessage},
    state::{RelayHub, session::GameState},
};

/// Realtime channel failures. All of them are recovered by reconnecting.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The transport could not be opened.
    #[error("failed to connect to the relay: {0}")]
    Connect(String),
    /// The join handshake did not complete in time.
    #[error("relay handshake timed out")]
    HandshakeTimeout,
    /// The relay closed the connection.
    #[error("relay connection closed")]
    Closed,
}

/// A connection already joined to a session.
pub struct RelayConnection {
    /// Frames sent to the relay.
    pub outbound: mpsc::UnboundedSender<RelayInboundMessage>,
    /// Frames pushed by the relay; closed when the relay drops the connection.
    pub inbound: mpsc::UnboundedReceiver<RelayOutboundMessage>,
}

/// Opens relay connections. Implementations send the `join` frame before resolving.
pub trait RelayConnector: Send + Sync {
    /// Connect and join `session_id`.
    fn connect(&self, session_id: String) -> BoxFuture<'static, Result<RelayConnection, RelayError>>;
}

/// Connector talking to a [`RelayHub`] living in the same process.
#[derive(Clone)]
pub struct LocalRelayConnector {
    hub: Arc<RelayHub>,
}

impl LocalRelayConnector {
    /// Connector subscribing to `hub` directly.
    pub fn new(hub: Arc<RelayHub>) -> Self {
        Self { hub }
    }
}

impl RelayConnector for LocalRelayConnector {
    fn connect(&self, session_id: String) -> BoxFuture<'static, Result<RelayConnection, RelayError>> {
        let hub = self.hub.clone();
        Box::pin(async move {
            let connection = Uuid::new_v4();
            let (relay_tx, relay_rx) = mpsc::unbounded_channel();
            let (client_tx, mut client_rx) = mpsc::unbounded_channel::<RelayInboundMessage>();

            // The hub holds the only strong sender, so eviction closes `relay_rx`.
            let relay_handle = relay_tx.downgrade();
            hub.join(connection, &session_id, relay_tx);

            tokio::spawn(async move {
                while let Some(message) = client_rx.recv().await {
                    hub.touch(connection);
                    match message {
                        RelayInboundMessage::Join { session_id } => {
                            let Some(tx) = relay_handle.upgrade() else {
                                break;
                            };
                            hub.join(connection, &session_id, tx);
                        }
                        RelayInboundMessage::GameUpdate { session_id, state } => {
                            hub.publish(Some(connection), &session_id, state);
                        }
                        RelayInboundMessage::Pong | RelayInboundMessage::Unknown => {}
                    }
                }
                hub.leave(connection);
            });

            Ok(RelayConnection {
                outbound: client_tx,
                inbound: relay_rx,
            })
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct LinkSettings {
    handshake_timeout: std::time::Duration,
    reconnect_attempts: u32,
    reconnect_backoff: std::time::Duration,
}

enum LinkEnd {
    Cancelled,
    Lost,
}

/// Background connection to the relay for one session.
///
/// Snapshots handed to [`RelayLink::publish`] are sent as `gameUpdate` frames while connected
/// and dropped while reconnecting. Snapshots pushed by the relay are forwarded to the channel
/// given at spawn time. Dropping the link closes it.
pub struct RelayLink {
    session_id: String,
    queue: mpsc::UnboundedSender<GameState>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RelayLink {
    /// Start maintaining a connection to `session_id`.
    pub fn spawn(
        connector: Arc<dyn RelayConnector>,
        session_id: String,
        config: &EngineConfig,
        remote_tx: mpsc::UnboundedSender<GameState>,
    ) -> Self {
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let settings = LinkSettings {
            handshake_timeout: config.handshake_timeout,
            reconnect_attempts: config.reconnect_attempts,
            reconnect_backoff: config.reconnect_backoff,
        };

        let handle = tokio::spawn(maintain(
            connector,
            session_id.clone(),
            settings,
            queue_rx,
            remote_tx,
            connected.clone(),
            cancel.clone(),
        ));

        Self {
            session_id,
            queue,
            connected,
            cancel,
            handle,
        }
    }

    /// Session this link is attached to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Queue `state` for the relay. Returns `false` once the link has shut down.
    pub fn publish(&self, state: GameState) -> bool {
        self.queue.send(state).is_ok()
    }

    /// Whether a relay connection is currently established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether the link still tries to reach the relay.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Detach from the relay.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn maintain(
    connector: Arc<dyn RelayConnector>,
    session_id: String,
    settings: LinkSettings,
    mut queue_rx: mpsc::UnboundedReceiver<GameState>,
    remote_tx: mpsc::UnboundedSender<GameState>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        let connecting = timeout(settings.handshake_timeout, connector.connect(session_id.clone()));
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            outcome = connecting => outcome.unwrap_or(Err(RelayError::HandshakeTimeout)),
        };

        match outcome {
            Ok(connection) => {
                attempt = 0;
                connected.store(true, Ordering::SeqCst);
                info!(session_id = %session_id, "relay link established");

                let end = pump(connection, &mut queue_rx, &remote_tx, &cancel).await;
                connected.store(false, Ordering::SeqCst);
                match end {
                    LinkEnd::Cancelled => return,
                    LinkEnd::Lost => {
                        warn!(session_id = %session_id, error = %RelayError::Closed, "relay link lost");
                    }
                }
            }
            Err(err) => {
                warn!(session_id = %session_id, attempt, error = %err, "relay connection failed");
            }
        }

        attempt += 1;
        if attempt > settings.reconnect_attempts {
            warn!(session_id = %session_id, "relay unreachable, continuing local-only");
            drain(&mut queue_rx, &cancel).await;
            return;
        }

        let backoff = sleep(settings.reconnect_backoff * attempt);
        tokio::pin!(backoff);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = &mut backoff => break,
                queued = queue_rx.recv() => {
                    if queued.is_none() {
                        return;
                    }
                    debug!(session_id = %session_id, "dropping update while the relay is unreachable");
                }
            }
        }
    }
}

async fn pump(
    mut connection: RelayConnection,
    queue_rx: &mut mpsc::UnboundedReceiver<GameState>,
    remote_tx: &mpsc::UnboundedSender<GameState>,
    cancel: &CancellationToken,
) -> LinkEnd {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return LinkEnd::Cancelled,
            queued = queue_rx.recv() => {
                let Some(state) = queued else {
                    return LinkEnd::Cancelled;
                };
                let update = RelayInboundMessage::GameUpdate {
                    session_id: state.id.clone(),
                    state,
                };
                if connection.outbound.send(update).is_err() {
                    return LinkEnd::Lost;
                }
            }
            incoming = connection.inbound.recv() => match incoming {
                Some(RelayOutboundMessage::State { state }) => {
                    if remote_tx.send(state).is_err() {
                        return LinkEnd::Cancelled;
                    }
                }
                Some(RelayOutboundMessage::Ping) => {
                    if connection.outbound.send(RelayInboundMessage::Pong).is_err() {
                        return LinkEnd::Lost;
                    }
                }
                None => return LinkEnd::Lost,
            },
        }
    }
}

/// Swallow queued updates until the link is closed.
async fn drain(queue_rx: &mut mpsc::UnboundedReceiver<GameState>, cancel: &CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            queued = queue_rx.recv() => {
                if queued.is_none() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicU32,
        time::Duration,
    };

    use super::*;

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    struct RefusingConnector {
        attempts: Arc<AtomicU32>,
    }

    impl RelayConnector for RefusingConnector {
        fn connect(
            &self,
            _session_id: String,
        ) -> BoxFuture<'static, Result<RelayConnection, RelayError>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(RelayError::Connect("refused".into())) })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn updates_reach_other_subscribers() {
        let hub = Arc::new(RelayHub::new());
        let connector: Arc<dyn RelayConnector> = Arc::new(LocalRelayConnector::new(hub.clone()));
        let config = EngineConfig::default();

        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = RelayLink::spawn(connector.clone(), "s".into(), &config, a_tx);
        let b = RelayLink::spawn(connector, "s".into(), &config, b_tx);
        settle().await;
        assert!(a.is_connected() && b.is_connected());
        assert_eq!(hub.subscriber_count("s"), 2);

        let state = GameState::new("s".into(), 2, 60);
        assert!(a.publish(state.clone()));
        settle().await;

        assert_eq!(b_rx.try_recv().unwrap(), state);
        assert_eq!(hub.last_state("s"), Some(state));
    }

    #[tokio::test(start_paused = true)]
    async fn late_joiner_receives_the_last_state() {
        let hub = Arc::new(RelayHub::new());
        let connector: Arc<dyn RelayConnector> = Arc::new(LocalRelayConnector::new(hub.clone()));
        let config = EngineConfig::default();

        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let a = RelayLink::spawn(connector.clone(), "s".into(), &config, a_tx);
        settle().await;
        let state = GameState::new("s".into(), 2, 60);
        a.publish(state.clone());
        settle().await;

        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let _b = RelayLink::spawn(connector, "s".into(), &config, b_tx);
        settle().await;

        assert_eq!(b_rx.try_recv().unwrap(), state);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_the_link_leaves_the_session() {
        let hub = Arc::new(RelayHub::new());
        let connector: Arc<dyn RelayConnector> = Arc::new(LocalRelayConnector::new(hub.clone()));
        let (tx, _rx) = mpsc::unbounded_channel();

        let link = RelayLink::spawn(connector, "s".into(), &EngineConfig::default(), tx);
        settle().await;
        assert_eq!(hub.subscriber_count("s"), 1);

        drop(link);
        settle().await;
        assert_eq!(hub.subscriber_count("s"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn evicted_link_reconnects_after_backoff() {
        let hub = Arc::new(RelayHub::new());
        let connector: Arc<dyn RelayConnector> = Arc::new(LocalRelayConnector::new(hub.clone()));
        let (tx, _rx) = mpsc::unbounded_channel();

        let link = RelayLink::spawn(connector, "s".into(), &EngineConfig::default(), tx);
        settle().await;

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(hub.evict_stale(Duration::ZERO).len(), 1);
        settle().await;
        assert!(!link.is_connected());

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert!(link.is_connected());
        assert_eq!(hub.subscriber_count("s"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_configured_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let connector: Arc<dyn RelayConnector> = Arc::new(RefusingConnector {
            attempts: attempts.clone(),
        });
        let (tx, _rx) = mpsc::unbounded_channel();

        let link = RelayLink::spawn(connector, "s".into(), &EngineConfig::default(), tx);
        settle().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        // Linear backoff: 1 s, 2 s, 3 s, 4 s, 5 s between attempts.
        for (wait, expected) in [(1, 2), (2, 3), (3, 4), (4, 5), (5, 6)] {
            tokio::time::advance(Duration::from_secs(wait)).await;
            settle().await;
            assert_eq!(attempts.load(Ordering::SeqCst), expected);
        }

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 6);

        // Still accepts updates, it just keeps them local.
        assert!(link.publish(GameState::new("s".into(), 2, 60)));
        assert!(link.is_running());
    }
}
