use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

use crate::state::SharedState;

/// Probe relay subscribers and evict the ones that stopped answering.
///
/// Every heartbeat interval each subscriber receives a `ping`; every sweep interval the
/// subscribers silent for longer than the stale window are dropped from the hub.
pub async fn run(state: SharedState) {
    let config = state.config().clone();
    let mut ping = interval(config.heartbeat_interval);
    let mut sweep = interval(config.sweep_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Both intervals fire immediately; skip that first tick.
    ping.tick().await;
    sweep.tick().await;

    loop {
        tokio::select! {
            _ = ping.tick() => {
                let sent = state.relay().ping_all();
                debug!(sent, "relay heartbeat sent");
            }
            _ = sweep.tick() => {
                let evicted = state.relay().evict_stale(config.stale_after);
                if !evicted.is_empty() {
                    info!(count = evicted.len(), "evicted stale relay subscribers");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::*;
    use crate::{config::AppConfig, dto::ws::RelayOutboundMessage, state::AppState};

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pings_then_evicts_silent_subscribers() {
        let state = AppState::new(AppConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = Uuid::new_v4();
        state.relay().join(connection, "s", tx);

        let task = tokio::spawn(run(state.clone()));
        settle().await;

        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(rx.try_recv().unwrap(), RelayOutboundMessage::Ping);

        // The sweep at 60 s still sees the subscriber within the stale window.
        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(state.relay().subscriber_count("s"), 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(state.relay().subscriber_count("s"), 0);

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn answering_subscribers_stay() {
        let state = AppState::new(AppConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = Uuid::new_v4();
        state.relay().join(connection, "s", tx);

        let task = tokio::spawn(run(state.clone()));
        settle().await;

        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(30)).await;
            settle().await;
            state.relay().touch(connection);
        }
        assert_eq!(state.relay().subscriber_count("s"), 1);

        task.abort();
    }
}
