use serde::Serialize;
use utoipa::ToSchema;

use crate::state::RelayStats;

/// Health response returned by the `/healthcheck` route.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status ("ok" or "degraded").
    pub status: String,
    /// Sessions with at least one relay subscriber.
    pub sessions: usize,
    /// Live relay subscribers.
    pub subscribers: usize,
}

impl HealthResponse {
    /// Create a health response indicating the system is operational.
    pub fn ok(stats: RelayStats) -> Self {
        Self::with_status("ok", stats)
    }

    /// Create a health response indicating the system is in degraded mode.
    pub fn degraded(stats: RelayStats) -> Self {
        Self::with_status("degraded", stats)
    }

    fn with_status(status: &str, stats: RelayStats) -> Self {
        Self {
            status: status.to_string(),
            sessions: stats.sessions,
            subscribers: stats.subscribers,
        }
    }
}
