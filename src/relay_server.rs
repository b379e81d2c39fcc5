use std::sync::Arc;
use std::time::Duration;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::stream::{SplitStream, StreamExt};
use futures_util::SinkExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::errors::{FleetError, Result};
use crate::protocol::{ClientFrame, ClientRegister};
use crate::AppState;

const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn relay_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

async fn handle_session(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // The first frame must be the registration handshake; anything else is a
    // protocol violation and the session is rejected
    let register = match await_register(&mut receiver).await {
        Ok(register) => register,
        Err(e) => {
            warn!("Rejecting relay session: {}", e);
            let _ = sender.close().await;
            return;
        }
    };

    let (outbox_tx, mut outbox_rx) = mpsc::channel(state.outbox_capacity);
    let session = state
        .registry
        .register(&register.client_id, &register.device_type, outbox_tx)
        .await;
    state
        .mqtt
        .publish_client_state(&register.client_id, &register.device_type, true)
        .await;

    // Single writer per session: commands queue through the outbox and only
    // this task touches the sink
    let client_id = register.client_id.clone();
    let write_task = tokio::spawn(async move {
        while let Some(cmd) = outbox_rx.recv().await {
            let json = match serde_json::to_string(&cmd) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to encode command '{}': {}", cmd.msg_id, e);
                    continue;
                }
            };
            if let Err(e) = sender.send(Message::Text(json)).await {
                error!("Failed to write to client '{}': {}", client_id, e);
                break;
            }
        }
    });

    // Receive loop: the only place correlated results are consumed
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Result(result)) => {
                    session.deliver_result(result).await;
                }
                Ok(ClientFrame::Detection(detection)) => {
                    debug!(
                        "Detection from '{}': stream '{}' class '{}' count {}",
                        register.client_id, detection.stream_id, detection.class_name, detection.count
                    );
                    state
                        .monitor
                        .record_detection(&detection.stream_id, &detection.class_name)
                        .await;
                }
                Ok(ClientFrame::IpcEvent(event)) => {
                    info!(
                        "Camera event from '{}': ipc '{}' {:?}",
                        register.client_id, event.ipc_id, event.event
                    );
                }
                Ok(ClientFrame::Register(_)) => {
                    warn!("Duplicate register frame from '{}', ignoring", register.client_id);
                }
                Err(e) => {
                    warn!("Undecodable frame from '{}': {}", register.client_id, e);
                }
            },
            Ok(Message::Close(_)) => {
                info!("Client '{}' closed the relay session", register.client_id);
                break;
            }
            Err(e) => {
                error!("Relay stream error for '{}': {}", register.client_id, e);
                break;
            }
            _ => {}
        }
    }

    // Tear down: remove from the registry and force-fail every pending
    // request so no caller blocks forever
    state.registry.unregister(&session).await;
    state
        .mqtt
        .publish_client_state(&register.client_id, &register.device_type, false)
        .await;
    write_task.abort();
}

async fn await_register(receiver: &mut SplitStream<WebSocket>) -> Result<ClientRegister> {
    let frame = tokio::time::timeout(REGISTER_TIMEOUT, receiver.next())
        .await
        .map_err(|_| FleetError::protocol("registration timed out"))?
        .ok_or_else(|| FleetError::protocol("connection closed before registration"))?
        .map_err(|e| FleetError::protocol(format!("stream error before registration: {}", e)))?;

    match frame {
        Message::Text(text) => decode_register_frame(&text),
        _ => Err(FleetError::protocol("first frame must be a register message")),
    }
}

fn decode_register_frame(text: &str) -> Result<ClientRegister> {
    match serde_json::from_str::<ClientFrame>(text)? {
        ClientFrame::Register(register) => {
            if register.client_id.is_empty() {
                return Err(FleetError::protocol("register frame has an empty client_id"));
            }
            Ok(register)
        }
        _ => Err(FleetError::protocol("first frame must be a register message")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_frame_accepted() {
        let register = decode_register_frame(
            r#"{"type":"register","client_id":"gw-1","version":"1.0.0","device_type":"rk3588"}"#,
        )
        .unwrap();
        assert_eq!(register.client_id, "gw-1");
    }

    #[test]
    fn test_non_register_first_frame_rejected() {
        let err = decode_register_frame(
            r#"{"type":"result","msg_id":"m-1","success":true}"#,
        )
        .unwrap_err();
        assert!(matches!(err, FleetError::Protocol { .. }));
    }

    #[test]
    fn test_empty_client_id_rejected() {
        let err = decode_register_frame(
            r#"{"type":"register","client_id":"","version":"1.0.0","device_type":"rk3588"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, FleetError::Protocol { .. }));
    }

    #[test]
    fn test_garbage_first_frame_rejected() {
        assert!(decode_register_frame("not json").is_err());
    }
}
