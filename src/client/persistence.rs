//! Client-side access to the durable session store.
//!
//! The engine only sees [`SessionPersistence`]; it wraps every call in its own timeout and never
//! lets a failure roll back local state.

use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use thiserror::Error;

use crate::{dao::game_store::SessionStore, state::session::GameState};

/// Failures of the durable store as seen by a client. An absent session is not an error.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The store could not be reached or answered with an error.
    #[error("session store unavailable: {0}")]
    Unavailable(String),
    /// The store did not answer within the allotted time.
    #[error("session store timed out")]
    Timeout,
}

/// Result of a [`SessionPersistence`] call.
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Durable key-value boundary keyed by session id.
pub trait SessionPersistence: Send + Sync {
    /// Stored snapshot, `None` when absent or expired.
    fn get(&self, id: String) -> BoxFuture<'static, PersistenceResult<Option<GameState>>>;
    /// Write the snapshot and refresh its TTL.
    fn put(&self, state: GameState, ttl: Duration) -> BoxFuture<'static, PersistenceResult<()>>;
    /// Remove the snapshot, returning whether one existed.
    fn delete(&self, id: String) -> BoxFuture<'static, PersistenceResult<bool>>;
}

/// Persistence backed directly by a [`SessionStore`], for clients living in the server process.
#[derive(Clone)]
pub struct StorePersistence {
    store: Arc<dyn SessionStore>,
}

impl StorePersistence {
    /// Wrap `store`.
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }
}

impl SessionPersistence for StorePersistence {
    fn get(&self, id: String) -> BoxFuture<'static, PersistenceResult<Option<GameState>>> {
        let fut = self.store.get(id);
        Box::pin(async move {
            fut.await
                .map(|found| found.map(|entity| entity.state))
                .map_err(|err| PersistenceError::Unavailable(err.to_string()))
        })
    }

    fn put(&self, state: GameState, ttl: Duration) -> BoxFuture<'static, PersistenceResult<()>> {
        let fut = self.store.put(state, ttl);
        Box::pin(async move {
            fut.await
                .map(|_| ())
                .map_err(|err| PersistenceError::Unavailable(err.to_string()))
        })
    }

    fn delete(&self, id: String) -> BoxFuture<'static, PersistenceResult<bool>> {
        let fut = self.store.delete(id);
        Box::pin(async move {
            fut.await
                .map_err(|err| PersistenceError::Unavailable(err.to_string()))
        })
    }
}

#[cfg(feature = "http-client")]
pub use self::http::HttpPersistence;

#[cfg(feature = "http-client")]
mod http {
    use std::{sync::Arc, time::Duration};

    use futures::future::BoxFuture;
    use reqwest::{Client, StatusCode};

    use super::{PersistenceError, PersistenceResult, SessionPersistence};
    use crate::state::session::GameState;

    /// Persistence going through the server's `/games/{id}` routes.
    ///
    /// The server owns the TTL, so the `ttl` argument of [`SessionPersistence::put`] is ignored.
    #[derive(Clone)]
    pub struct HttpPersistence {
        client: Client,
        base_url: Arc<str>,
    }

    impl HttpPersistence {
        /// Client for the server listening at `base_url`.
        pub fn new(base_url: impl AsRef<str>) -> PersistenceResult<Self> {
            let client = Client::builder()
                .build()
                .map_err(|err| PersistenceError::Unavailable(err.to_string()))?;
            Ok(Self {
                client,
                base_url: Arc::from(base_url.as_ref().trim_end_matches('/')),
            })
        }

        fn url(&self, id: &str) -> String {
            format!("{}/games/{}", self.base_url, id)
        }
    }

    fn unavailable(err: reqwest::Error) -> PersistenceError {
        PersistenceError::Unavailable(err.to_string())
    }

    fn unexpected(status: StatusCode) -> PersistenceError {
        PersistenceError::Unavailable(format!("unexpected status {status}"))
    }

    impl SessionPersistence for HttpPersistence {
        fn get(&self, id: String) -> BoxFuture<'static, PersistenceResult<Option<GameState>>> {
            let request = self.client.get(self.url(&id));
            Box::pin(async move {
                let response = request.send().await.map_err(unavailable)?;
                match response.status() {
                    StatusCode::NOT_FOUND => Ok(None),
                    status if status.is_success() => {
                        response.json::<GameState>().await.map(Some).map_err(unavailable)
                    }
                    other => Err(unexpected(other)),
                }
            })
        }

        fn put(&self, state: GameState, _ttl: Duration) -> BoxFuture<'static, PersistenceResult<()>> {
            let request = self.client.put(self.url(&state.id)).json(&state);
            Box::pin(async move {
                let response = request.send().await.map_err(unavailable)?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(unexpected(response.status()))
                }
            })
        }

        fn delete(&self, id: String) -> BoxFuture<'static, PersistenceResult<bool>> {
            let request = self.client.delete(self.url(&id));
            Box::pin(async move {
                let response = request.send().await.map_err(unavailable)?;
                match response.status() {
                    StatusCode::NOT_FOUND => Ok(false),
                    status if status.is_success() => Ok(true),
                    other => Err(unexpected(other)),
                }
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::game_store::memory::MemorySessionStore;

    #[tokio::test]
    async fn store_persistence_round_trip() {
        let persistence = StorePersistence::new(Arc::new(MemorySessionStore::new()));
        let state = GameState::new("s".into(), 2, 60);

        assert!(persistence.get("s".into()).await.unwrap().is_none());
        persistence
            .put(state.clone(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(persistence.get("s".into()).await.unwrap(), Some(state));
        assert!(persistence.delete("s".into()).await.unwrap());
    }
}
