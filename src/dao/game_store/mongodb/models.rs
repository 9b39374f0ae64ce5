use mongodb::bson::{DateTime, Document, doc};
use serde::{Deserialize, Serialize};

use crate::{dao::models::SessionEntity, state::session::GameState};

/// Stored shape of a session; `expiresAt` carries the TTL index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MongoSessionDocument {
    /// Session id.
    #[serde(rename = "_id")]
    pub id: String,
    /// Stored snapshot.
    pub state: GameState,
    /// Time of the last write.
    pub updated_at: DateTime,
    /// Expiry watched by the TTL index.
    pub expires_at: DateTime,
}

impl From<SessionEntity> for MongoSessionDocument {
    fn from(entity: SessionEntity) -> Self {
        Self {
            id: entity.id,
            state: entity.state,
            updated_at: DateTime::from_system_time(entity.updated_at),
            expires_at: DateTime::from_system_time(entity.expires_at),
        }
    }
}

impl From<MongoSessionDocument> for SessionEntity {
    fn from(doc: MongoSessionDocument) -> Self {
        Self {
            id: doc.id,
            state: doc.state,
            updated_at: doc.updated_at.to_system_time(),
            expires_at: doc.expires_at.to_system_time(),
        }
    }
}

/// Filter matching a live (not yet expired) session by id.
///
/// The TTL monitor only runs periodically, so reads filter on `expiresAt` too.
pub fn live_session(id: &str) -> Document {
    doc! { "_id": id, "expiresAt": { "$gt": DateTime::now() } }
}

/// Filter matching session `id`, expired or not.
pub fn session_id(id: &str) -> Document {
    doc! { "_id": id }
}
