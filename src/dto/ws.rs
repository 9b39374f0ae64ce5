use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use validator::{Validate, ValidationErrors};

use crate::state::session::GameState;

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
/// Messages accepted from relay clients.
#[serde(tag = "type")]
pub enum RelayInboundMessage {
    /// Subscribe the connection to a session; answered with the last known state.
    #[serde(rename = "join")]
    Join {
        /// Session to subscribe to.
        #[serde(rename = "sessionId", alias = "gameId")]
        session_id: String,
    },
    /// A client committed a new snapshot for the session.
    #[serde(rename = "gameUpdate")]
    GameUpdate {
        /// Session the snapshot is published to.
        #[serde(rename = "sessionId", alias = "gameId")]
        session_id: String,
        /// The committed snapshot.
        state: GameState,
    },
    /// Heartbeat reply.
    #[serde(rename = "pong")]
    Pong,
    /// Any other message type; ignored.
    #[serde(other)]
    Unknown,
}

/// Why an inbound relay frame was refused.
#[derive(Debug, Error)]
pub enum InboundError {
    /// Not JSON, or not a known message shape.
    #[error("malformed relay message")]
    Json(#[from] serde_json::Error),
    /// The envelope session id differs from the snapshot's own id.
    #[error("snapshot for `{expected}` carried under session `{got}`")]
    SessionMismatch {
        /// Id carried by the snapshot.
        expected: String,
        /// Id carried by the envelope.
        got: String,
    },
    /// The snapshot breaks a session invariant.
    #[error("invalid snapshot: {0}")]
    Invalid(#[from] ValidationErrors),
}

impl RelayInboundMessage {
    /// Parse a text frame, rejecting snapshots that break the session invariants.
    pub fn from_json_str(text: &str) -> Result<Self, InboundError> {
        let message: Self = serde_json::from_str(text)?;
        if let Self::GameUpdate { session_id, state } = &message {
            if *session_id != state.id {
                return Err(InboundError::SessionMismatch {
                    expected: state.id.clone(),
                    got: session_id.clone(),
                });
            }
            state.validate()?;
        }
        Ok(message)
    }

    /// Session targeted by a join message.
    pub fn join_session_id(&self) -> Option<&str> {
        match self {
            Self::Join { session_id } => Some(session_id.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, ToSchema)]
/// Messages pushed by the relay to its clients.
#[serde(tag = "type")]
pub enum RelayOutboundMessage {
    /// Latest snapshot of the subscribed session.
    #[serde(rename = "gameState")]
    State {
        /// The snapshot.
        state: GameState,
    },
    /// Heartbeat; clients answer with `pong`.
    #[serde(rename = "ping")]
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_join_with_legacy_key() {
        let message = RelayInboundMessage::from_json_str(r#"{"type":"join","gameId":"abc"}"#)
            .unwrap();
        assert_eq!(message.join_session_id(), Some("abc"));

        let message =
            RelayInboundMessage::from_json_str(r#"{"type":"join","sessionId":"abc"}"#).unwrap();
        assert_eq!(message.join_session_id(), Some("abc"));
    }

    #[test]
    fn unknown_types_are_tolerated() {
        let message = RelayInboundMessage::from_json_str(r#"{"type":"chat"}"#).unwrap();
        assert!(matches!(message, RelayInboundMessage::Unknown));
    }

    #[test]
    fn only_join_opens_a_connection() {
        let pong = RelayInboundMessage::from_json_str(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(pong.join_session_id(), None);

        let state = GameState::new("a".into(), 2, 60);
        let update = RelayInboundMessage::GameUpdate {
            session_id: "a".into(),
            state,
        };
        assert_eq!(update.join_session_id(), None);
    }

    #[test]
    fn update_must_match_its_session() {
        let state = GameState::new("a".into(), 2, 60);
        let text = serde_json::to_string(&RelayInboundMessage::GameUpdate {
            session_id: "b".into(),
            state,
        })
        .unwrap();

        let err = RelayInboundMessage::from_json_str(&text).unwrap_err();
        assert!(matches!(err, InboundError::SessionMismatch { .. }));
    }

    #[test]
    fn update_with_broken_invariants_is_rejected() {
        let mut state = GameState::new("a".into(), 2, 60);
        state.time_remaining = 61;
        let text = serde_json::to_string(&RelayInboundMessage::GameUpdate {
            session_id: "a".into(),
            state,
        })
        .unwrap();

        let err = RelayInboundMessage::from_json_str(&text).unwrap_err();
        assert!(matches!(err, InboundError::Invalid(_)));
    }

    #[test]
    fn outbound_shapes() {
        let ping = serde_json::to_value(RelayOutboundMessage::Ping).unwrap();
        assert_eq!(ping, serde_json::json!({"type": "ping"}));

        let state = GameState::new("a".into(), 2, 60);
        let value = serde_json::to_value(RelayOutboundMessage::State { state }).unwrap();
        assert_eq!(value["type"], "gameState");
        assert_eq!(value["state"]["id"], "a");
    }
}
