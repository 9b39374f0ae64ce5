/// CouchDB backend.
#[cfg(feature = "couch-store")]
pub mod couchdb;
/// In-process backend.
pub mod memory;
/// MongoDB backend.
#[cfg(feature = "mongo-store")]
pub mod mongodb;

use std::time::Duration;

use crate::dao::models::SessionEntity;
use crate::dao::storage::StorageResult;
use crate::state::session::GameState;
use futures::future::BoxFuture;

/// Abstraction over the durable key-value store holding session snapshots.
///
/// Records carry a TTL; an expired record is reported as absent.
pub trait SessionStore: Send + Sync {
    fn get(&self, id: String) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>>;
    /// Write (or overwrite) the snapshot and refresh its TTL.
    fn put(&self, state: GameState, ttl: Duration) -> BoxFuture<'static, StorageResult<SessionEntity>>;
    /// Remove the record, returning whether one existed.
    fn delete(&self, id: String) -> BoxFuture<'static, StorageResult<bool>>;
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}
