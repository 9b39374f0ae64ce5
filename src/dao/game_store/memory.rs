use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use futures::future::BoxFuture;

use crate::{
    dao::{game_store::SessionStore, models::SessionEntity, storage::StorageResult},
    state::session::GameState,
};

/// Process-local store, used when no external backend is configured and in tests.
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    records: Arc<DashMap<String, SessionEntity>>,
}

impl MemorySessionStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self, id: &str) -> Option<SessionEntity> {
        if let Some(entry) = self.records.get(id) {
            if !entry.is_expired() {
                return Some(entry.clone());
            }
        }
        self.records.remove_if(id, |_, entity| entity.is_expired());
        None
    }

    /// Drop every expired record, read or not.
    fn purge_expired(&self) {
        self.records.retain(|_, entity| !entity.is_expired());
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, id: String) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.read(&id)) })
    }

    fn put(&self, state: GameState, ttl: Duration) -> BoxFuture<'static, StorageResult<SessionEntity>> {
        let store = self.clone();
        Box::pin(async move {
            store.purge_expired();
            let entity = SessionEntity::new(state, ttl);
            store.records.insert(entity.id.clone(), entity.clone());
            Ok(entity)
        })
    }

    fn delete(&self, id: String) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            let existed = store.read(&id).is_some();
            store.records.remove(&id);
            Ok(existed)
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }
}
