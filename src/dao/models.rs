use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

use crate::state::session::GameState;

/// Session record persisted by the storage layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionEntity {
    /// Session identifier, mirrors `state.id`.
    pub id: String,
    /// Latest snapshot written for the session.
    pub state: GameState,
    /// Last time the record was written.
    pub updated_at: SystemTime,
    /// Instant after which the record is treated as absent.
    pub expires_at: SystemTime,
}

impl SessionEntity {
    /// Wrap `state` in a record living for `ttl` from now.
    pub fn new(state: GameState, ttl: Duration) -> Self {
        let now = SystemTime::now();
        Self {
            id: state.id.clone(),
            state,
            updated_at: now,
            expires_at: now + ttl,
        }
    }

    /// Whether the record outlived its TTL at `now`.
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires_at <= now
    }

    /// Whether the record outlived its TTL.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_follows_ttl() {
        let entity = SessionEntity::new(GameState::new("s".into(), 2, 60), Duration::from_secs(10));
        assert_eq!(entity.id, "s");
        assert!(!entity.is_expired());
        assert!(entity.is_expired_at(entity.updated_at + Duration::from_secs(10)));
    }
}
