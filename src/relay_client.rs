use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{sleep, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::errors::{FleetError, Result};
use crate::executor::CommandExecutor;
use crate::protocol::{ClientFrame, ClientRegister, DetectionEvent, ServerCommand};

const RESULT_QUEUE_CAPACITY: usize = 100;
const MAX_RECONNECT_SECS: u64 = 60;

/// Gateway side of the relay: one long-lived duplex stream to the fleet
/// server. A dedicated reader dispatches each command to its own task;
/// exactly one writer drains the bounded result queue, because the sink is
/// not safe for concurrent senders.
pub struct RelayAgent {
    config: AgentConfig,
    executor: Arc<dyn CommandExecutor>,
    // Current session's outbound queue, for detection/event uplink
    uplink: RwLock<Option<mpsc::Sender<ClientFrame>>>,
}

impl RelayAgent {
    pub fn new(config: AgentConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            config,
            executor,
            uplink: RwLock::new(None),
        }
    }

    /// Connect, serve, reconnect forever. Commands in flight when the stream
    /// drops are lost; the server's waiters resolve by timeout.
    pub async fn run(self: Arc<Self>) {
        let mut backoff = self.config.reconnect_interval.max(1);
        loop {
            match self.run_session().await {
                Ok(()) => {
                    info!("Relay session ended");
                    backoff = self.config.reconnect_interval.max(1);
                }
                Err(e) => {
                    error!("Relay connection error: {}", e);
                    backoff = (backoff * 2).min(MAX_RECONNECT_SECS);
                }
            }
            info!("Reconnecting in {} seconds...", backoff);
            sleep(Duration::from_secs(backoff)).await;
        }
    }

    /// Report a local detection to the server. Best-effort: returns false
    /// when no session is up or the queue is full.
    pub async fn report_detection(&self, detection: DetectionEvent) -> bool {
        let uplink = self.uplink.read().await;
        match uplink.as_ref() {
            Some(tx) => tx.try_send(ClientFrame::Detection(detection)).is_ok(),
            None => false,
        }
    }

    async fn run_session(&self) -> Result<()> {
        info!("Connecting to fleet server at {}", self.config.server_url);
        let (ws, _) = connect_async(self.config.server_url.as_str())
            .await
            .map_err(|e| FleetError::protocol(format!("connect failed: {}", e)))?;
        let (mut sink, mut stream) = ws.split();

        // Registration must be the first frame on the wire
        let register = ClientFrame::Register(ClientRegister {
            client_id: self.config.client_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            device_type: self.config.device_type.clone(),
        });
        let register_json = serde_json::to_string(&register)?;
        sink.send(Message::Text(register_json.into()))
            .await
            .map_err(|e| FleetError::protocol(format!("register failed: {}", e)))?;
        info!("Registered with fleet server as '{}'", self.config.client_id);

        let (frame_tx, mut frame_rx) = mpsc::channel::<ClientFrame>(RESULT_QUEUE_CAPACITY);
        *self.uplink.write().await = Some(frame_tx.clone());

        // The single writer task
        let writer = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to encode outbound frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    error!("Failed to write frame: {}", e);
                    break;
                }
            }
        });

        let session_result = loop {
            let msg = match stream.next().await {
                Some(msg) => msg,
                None => break Ok(()),
            };
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerCommand>(text.as_str()) {
                    Ok(cmd) => {
                        info!("Received command '{}' ({})", cmd.msg_id, cmd.method);
                        // Commands are independent; each runs in its own task
                        // and may complete out of order
                        let executor = self.executor.clone();
                        let frame_tx = frame_tx.clone();
                        tokio::spawn(async move {
                            let result = executor.execute(&cmd).await;
                            if frame_tx.send(ClientFrame::Result(result)).await.is_err() {
                                warn!("Result queue closed, dropping result for '{}'", cmd.msg_id);
                            }
                        });
                    }
                    Err(e) => warn!("Undecodable command frame: {}", e),
                },
                Ok(Message::Close(_)) => {
                    info!("Server closed the relay session");
                    break Ok(());
                }
                Err(e) => break Err(FleetError::protocol(format!("relay stream error: {}", e))),
                _ => {}
            }
        };

        *self.uplink.write().await = None;
        writer.abort();
        session_result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionManager;
    use crate::config::{MediaConfig, RelayConfig};
    use crate::media::MediaClient;
    use crate::mqtt::MqttHandle;
    use crate::protocol::{CommandMethod, CommandResult};
    use crate::relay_server::relay_handler;
    use crate::session::SessionRegistry;
    use crate::trigger::{TriggerMonitor, TriggerSettings};
    use crate::AppState;
    use async_trait::async_trait;

    struct EchoExecutor;

    #[async_trait]
    impl CommandExecutor for EchoExecutor {
        async fn execute(&self, cmd: &ServerCommand) -> CommandResult {
            match cmd.method {
                CommandMethod::Ping => CommandResult::ok(&cmd.msg_id, "pong"),
                _ => CommandResult::failure(&cmd.msg_id, "unsupported"),
            }
        }
    }

    async fn start_test_server() -> (Arc<AppState>, std::net::SocketAddr, crate::trigger::TriggerEventStream) {
        let (monitor, events) = TriggerMonitor::new(TriggerSettings::default());
        let state = Arc::new(AppState {
            registry: Arc::new(SessionRegistry::new(Duration::from_secs(5))),
            monitor,
            actions: Arc::new(ActionManager::new(5, Duration::from_secs(2))),
            media: MediaClient::new(&MediaConfig {
                url: "http://127.0.0.1:9092".to_string(),
                secret: "s".to_string(),
                record_path: None,
            }),
            mqtt: MqttHandle::disabled(),
            outbox_capacity: RelayConfig::default().outbox_capacity,
            action_deadline: Duration::from_secs(60),
        });

        let app = axum::Router::new()
            .route("/relay", axum::routing::get(relay_handler))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (state, addr, events)
    }

    fn test_agent(addr: std::net::SocketAddr, client_id: &str) -> Arc<RelayAgent> {
        Arc::new(RelayAgent::new(
            AgentConfig {
                client_id: client_id.to_string(),
                server_url: format!("ws://{}/relay", addr),
                device_type: "gateway".to_string(),
                reconnect_interval: 1,
            },
            Arc::new(EchoExecutor),
        ))
    }

    async fn wait_for_registration(state: &AppState, client_id: &str) {
        for _ in 0..100 {
            if state.registry.get(client_id).await.is_some() {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("agent '{}' never registered", client_id);
    }

    #[tokio::test]
    async fn test_command_round_trip_over_websocket() {
        let (state, addr, _events) = start_test_server().await;
        let agent = test_agent(addr, "gw-rt");
        let agent_task = tokio::spawn(agent.clone().run());

        wait_for_registration(&state, "gw-rt").await;
        let result = state
            .registry
            .send("gw-rt", CommandMethod::Ping, serde_json::Value::Null)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.payload["message"], "pong");

        agent_task.abort();
    }

    #[tokio::test]
    async fn test_detection_uplink_feeds_trigger_monitor() {
        let (state, addr, mut events) = start_test_server().await;
        let agent = test_agent(addr, "gw-det");
        let agent_task = tokio::spawn(agent.clone().run());

        wait_for_registration(&state, "gw-det").await;
        let detection = DetectionEvent {
            device_id: "gw-det".to_string(),
            stream_id: "IPC001_0".to_string(),
            class_name: "person".to_string(),
            score: 0.9,
            count: 1,
        };
        // Two detections inside the debounce window must arm the trigger
        assert!(agent.report_detection(detection.clone()).await);
        assert!(agent.report_detection(detection).await);

        let (source, event) = tokio::time::timeout(Duration::from_secs(5), events.next_event())
            .await
            .expect("no trigger event")
            .unwrap();
        assert_eq!(source, "IPC001_0");
        assert_eq!(event.key, "IPC001_0_person");

        agent_task.abort();
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_and_unregisters() {
        let (state, addr, _events) = start_test_server().await;
        let agent = test_agent(addr, "gw-dc");
        let agent_task = tokio::spawn(agent.clone().run());

        wait_for_registration(&state, "gw-dc").await;
        agent_task.abort();

        // The server notices the drop and removes the session; commands then
        // report the device offline
        for _ in 0..100 {
            if state.registry.get("gw-dc").await.is_none() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert!(state.registry.get("gw-dc").await.is_none());
        let err = state
            .registry
            .send("gw-dc", CommandMethod::Ping, serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::NotConnected { .. }));
    }
}
