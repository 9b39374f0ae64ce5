use std::future::Future;

use tokio::time::timeout;
use tracing::{info, warn};
use validator::Validate;

use crate::{
    dao::storage::StorageResult,
    dto::session::SessionSaved,
    error::ServiceError,
    state::{SharedState, session::GameState},
};

/// Await a store call, bounded by the configured store timeout.
async fn bounded<T>(
    state: &SharedState,
    call: impl Future<Output = StorageResult<T>>,
) -> Result<T, ServiceError> {
    match timeout(state.config().store_timeout, call).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => {
            warn!("session store call timed out");
            Err(ServiceError::Timeout)
        }
    }
}

/// Read the stored snapshot of `id`.
pub async fn fetch_session(state: &SharedState, id: &str) -> Result<GameState, ServiceError> {
    let store = state.require_session_store().await?;
    match bounded(state, store.get(id.to_string())).await? {
        Some(entity) => Ok(entity.state),
        None => Err(ServiceError::NotFound(format!("session `{id}` not found"))),
    }
}

/// Overwrite the stored snapshot of `id`, refreshing its TTL.
pub async fn replace_session(
    state: &SharedState,
    id: &str,
    snapshot: GameState,
) -> Result<SessionSaved, ServiceError> {
    if snapshot.id != id {
        return Err(ServiceError::InvalidInput(format!(
            "snapshot id `{}` does not match session `{id}`",
            snapshot.id
        )));
    }
    snapshot.validate()?;

    let store = state.require_session_store().await?;
    let ttl = state.config().session_ttl;
    let entity = bounded(state, store.put(snapshot, ttl)).await?;
    info!(session_id = %id, "session snapshot stored");
    Ok(entity.into())
}

/// Remove the stored snapshot of `id`.
pub async fn remove_session(state: &SharedState, id: &str) -> Result<(), ServiceError> {
    let store = state.require_session_store().await?;
    if bounded(state, store.delete(id.to_string())).await? {
        info!(session_id = %id, "session removed");
        Ok(())
    } else {
        Err(ServiceError::NotFound(format!("session `{id}` not found")))
    }
}
