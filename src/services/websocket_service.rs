use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dto::ws::{RelayInboundMessage, RelayOutboundMessage},
    state::{ConnectionId, SharedState},
};

/// Handle the full lifecycle of a relay WebSocket connection.
///
/// The first frame must be a `join` received within the configured join timeout. Afterwards
/// the connection may publish snapshots and answer heartbeats until either side closes it or
/// the hub evicts it.
pub async fn handle_socket(state: SharedState, socket: WebSocket) {
    let connection: ConnectionId = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let (relay_tx, mut relay_rx) = mpsc::unbounded_channel::<RelayOutboundMessage>();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Message>();

    // Dedicated writer task: relay messages are serialized here, control frames pass through.
    // The hub owns the only strong relay sender once joined, so a closed relay channel means
    // the connection was evicted.
    let writer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                relayed = relay_rx.recv() => {
                    let Some(message) = relayed else {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    };
                    let payload = match serde_json::to_string(&message) {
                        Ok(payload) => payload,
                        Err(err) => {
                            warn!(error = %err, "failed to serialize relay message");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
                control = control_rx.recv() => {
                    let Some(frame) = control else {
                        break;
                    };
                    let closing = matches!(frame, Message::Close(_));
                    if sender.send(frame).await.is_err() || closing {
                        break;
                    }
                }
            }
        }
    });

    let join_timeout = state.config().join_timeout;
    let initial_message = match tokio::time::timeout(join_timeout, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(Message::Close(_)))) => {
            finalize(writer_task, control_tx).await;
            return;
        }
        Ok(Some(Ok(_))) => {
            let _ = control_tx.send(Message::Close(None));
            finalize(writer_task, control_tx).await;
            return;
        }
        Ok(Some(Err(err))) => {
            warn!(error = %err, "websocket receive error");
            finalize(writer_task, control_tx).await;
            return;
        }
        Ok(None) | Err(_) => {
            warn!("relay join timed out");
            finalize(writer_task, control_tx).await;
            return;
        }
    };

    let parsed = RelayInboundMessage::from_json_str(&initial_message);
    let session_id = match parsed.as_ref().map(RelayInboundMessage::join_session_id) {
        Ok(Some(session_id)) => session_id.to_owned(),
        Ok(None) => {
            warn!("first relay message was not a join");
            let _ = control_tx.send(Message::Close(None));
            finalize(writer_task, control_tx).await;
            return;
        }
        Err(err) => {
            warn!(error = %err, "failed to parse or validate relay message");
            let _ = control_tx.send(Message::Close(None));
            finalize(writer_task, control_tx).await;
            return;
        }
    };

    let relay_handle = relay_tx.downgrade();
    state.relay().join(connection, &session_id, relay_tx);

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                state.relay().touch(connection);
                match RelayInboundMessage::from_json_str(&text) {
                    Ok(RelayInboundMessage::Join { session_id }) => {
                        // The hub dropped our sender: the connection was evicted.
                        let Some(tx) = relay_handle.upgrade() else {
                            break;
                        };
                        state.relay().join(connection, &session_id, tx);
                    }
                    Ok(RelayInboundMessage::GameUpdate { session_id, state: snapshot }) => {
                        let joined = state.relay().session_of(connection);
                        if joined.as_deref() != Some(session_id.as_str()) {
                            info!(
                                %connection,
                                session_id = %session_id,
                                "relaying update for a session this connection has not joined"
                            );
                        }
                        let delivered = state.relay().publish(Some(connection), &session_id, snapshot);
                        debug!(%connection, session_id = %session_id, delivered, "relayed snapshot");
                    }
                    Ok(RelayInboundMessage::Pong) => {}
                    Ok(RelayInboundMessage::Unknown) => {
                        debug!(%connection, "ignoring unknown relay message type");
                    }
                    Err(err) => {
                        warn!(%connection, error = %err, "dropping invalid relay message");
                    }
                }
            }
            Ok(Message::Ping(payload)) => {
                state.relay().touch(connection);
                let _ = control_tx.send(Message::Pong(payload));
            }
            Ok(Message::Pong(_)) | Ok(Message::Binary(_)) => {
                state.relay().touch(connection);
            }
            Ok(Message::Close(frame)) => {
                info!(%connection, "relay client closed");
                let _ = control_tx.send(Message::Close(frame));
                break;
            }
            Err(err) => {
                warn!(%connection, error = %err, "websocket error");
                break;
            }
        }
    }

    state.relay().leave(connection);
    info!(%connection, "relay connection finished");

    finalize(writer_task, control_tx).await;
}

/// Ensure the writer task winds down before we return from the socket handler.
async fn finalize(writer_task: JoinHandle<()>, control_tx: mpsc::UnboundedSender<Message>) {
    drop(control_tx);
    let _ = writer_task.await;
}
