//! Per-client side of the system: the session engine and the collaborators it drives.
//!
//! A client owns its own [`GameState`](crate::state::session::GameState) copy. Every
//! mutation is applied locally first, then forwarded to the relay and persisted on a best
//! effort basis.

use std::time::Duration;

pub mod countdown;
pub mod engine;
pub mod persistence;
pub mod relay_link;

pub use countdown::{CountdownDriver, TickOutcome};
pub use engine::{EngineError, LoadOutcome, SessionEngine};
pub use persistence::{PersistenceError, SessionPersistence, StorePersistence};
pub use relay_link::{LocalRelayConnector, RelayConnection, RelayConnector, RelayError, RelayLink};

/// Tunables of a [`SessionEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Countdown granularity.
    pub tick_period: Duration,
    /// Upper bound for a single durable store call.
    pub store_timeout: Duration,
    /// Upper bound for establishing the relay link.
    pub handshake_timeout: Duration,
    /// Reconnection attempts before falling back to local-only operation.
    pub reconnect_attempts: u32,
    /// Backoff unit; attempt `n` waits `n` times this.
    pub reconnect_backoff: Duration,
    /// Delay between the last seat being claimed and the countdown starting.
    pub auto_start_delay: Duration,
    /// TTL refreshed on every persisted write.
    pub session_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_secs(1),
            store_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(5),
            reconnect_attempts: 5,
            reconnect_backoff: Duration::from_secs(1),
            auto_start_delay: Duration::from_secs(1),
            session_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}
