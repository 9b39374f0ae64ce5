use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{dao::models::SessionEntity, state::session::GameState};

/// Prefix of every session document id.
pub const SESSION_PREFIX: &str = "session::";

/// Stored shape of a session. CouchDB has no TTL, expiry is checked on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouchSessionDocument {
    /// Prefixed document id, see [`session_doc_id`].
    #[serde(rename = "_id")]
    pub id: String,
    /// Revision, required by CouchDB to overwrite a document.
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// Session payload.
    #[serde(flatten)]
    pub session: SessionBody,
}

/// Payload of a [`CouchSessionDocument`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionBody {
    /// Stored snapshot.
    pub state: GameState,
    /// Milliseconds since the Unix epoch.
    pub updated_at: u64,
    /// Milliseconds since the Unix epoch.
    pub expires_at: u64,
}

impl From<(SessionEntity, Option<String>)> for CouchSessionDocument {
    fn from((entity, rev): (SessionEntity, Option<String>)) -> Self {
        Self {
            id: session_doc_id(&entity.id),
            rev,
            session: SessionBody {
                state: entity.state,
                updated_at: to_millis(entity.updated_at),
                expires_at: to_millis(entity.expires_at),
            },
        }
    }
}

impl From<CouchSessionDocument> for SessionEntity {
    fn from(doc: CouchSessionDocument) -> Self {
        Self {
            id: doc.session.state.id.clone(),
            state: doc.session.state,
            updated_at: from_millis(doc.session.updated_at),
            expires_at: from_millis(doc.session.expires_at),
        }
    }
}

/// Document id of session `id`.
pub fn session_doc_id(id: &str) -> String {
    format!("{SESSION_PREFIX}{id}")
}

fn to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

fn from_millis(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_keeps_entity_fields() {
        let entity = SessionEntity::new(GameState::new("abc".into(), 2, 60), Duration::from_secs(5));
        let doc = CouchSessionDocument::from((entity.clone(), Some("1-x".into())));
        assert_eq!(doc.id, "session::abc");

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["_rev"], "1-x");
        assert_eq!(value["state"]["id"], "abc");

        let back = SessionEntity::from(doc);
        assert_eq!(back.id, "abc");
        assert_eq!(to_millis(back.expires_at), to_millis(entity.expires_at));
    }
}
