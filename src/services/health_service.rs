use tracing::warn;

use crate::{dto::health::HealthResponse, state::SharedState};

/// Report storage health together with the relay's size.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    match state.require_session_store().await {
        Ok(store) => {
            if let Err(err) = store.health_check().await {
                warn!(error = %err, "storage health check failed");
            }
        }
        Err(_) => warn!("storage unavailable (degraded mode)"),
    }

    let stats = state.relay().stats();
    if state.is_degraded().await {
        HealthResponse::degraded(stats)
    } else {
        HealthResponse::ok(stats)
    }
}
