use serde::Serialize;
use utoipa::ToSchema;

use crate::{dao::models::SessionEntity, dto::format_system_time};

/// Acknowledgement returned after a session snapshot was written.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionSaved {
    /// Identifier of the stored session.
    pub id: String,
    /// RFC 3339 instant after which the stored snapshot expires.
    pub expires_at: String,
}

impl From<SessionEntity> for SessionSaved {
    fn from(entity: SessionEntity) -> Self {
        Self {
            id: entity.id,
            expires_at: format_system_time(entity.expires_at),
        }
    }
}
