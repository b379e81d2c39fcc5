use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::actions::{ActionManager, IdempotentAction};
use crate::errors::Result;
use crate::media::MediaClient;
use crate::protocol::{
    CommandMethod, CommandResult, DeviceControlRequest, PlayRequest, PushStreamResetRequest,
    ServerCommand, StopPlayRequest,
};
use crate::signaling::{CameraSignaling, PushTarget};
use crate::workers::{ForwardRequest, StreamWorkers};

const STREAM_POLL_INTERVAL: Duration = Duration::from_secs(2);
const STREAM_POLL_ATTEMPTS: u32 = 15;

/// Executes one relayed command. Implementations must be safe to run
/// concurrently; commands are independent and may complete out of order.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, cmd: &ServerCommand) -> CommandResult;
}

/// The gateway's command execution against its local media server, stream
/// workers and camera signaling.
pub struct AgentExecutor {
    media: MediaClient,
    media_ip: String,
    workers: Arc<dyn StreamWorkers>,
    signaling: Arc<dyn CameraSignaling>,
    actions: Arc<ActionManager>,
    action_deadline: Duration,
}

impl AgentExecutor {
    pub fn new(
        media: MediaClient,
        media_ip: String,
        workers: Arc<dyn StreamWorkers>,
        signaling: Arc<dyn CameraSignaling>,
        actions: Arc<ActionManager>,
        action_deadline: Duration,
    ) -> Self {
        Self { media, media_ip, workers, signaling, actions, action_deadline }
    }

    async fn handle_play(&self, cmd: &ServerCommand) -> Result<CommandResult> {
        let req: PlayRequest = serde_json::from_value(cmd.payload.clone())?;

        if self.media.media_exists(&req.stream_id).await? {
            info!("Stream '{}' already present on media server", req.stream_id);
            return Ok(CommandResult::ok(&cmd.msg_id, "stream already present"));
        }

        // Open a receive port, then ask the camera to push into it
        let rtp_port = self.media.open_rtp_server(&req.stream_id, req.mode).await?;
        let target = PushTarget {
            stream_id: req.stream_id.clone(),
            media_ip: self.media_ip.clone(),
            rtp_port,
            mode: req.mode,
        };
        self.signaling.request_stream_push(&req.channel_id, &target).await?;

        // The camera needs a moment to start pushing; poll until the stream
        // shows up or give up
        for _ in 0..STREAM_POLL_ATTEMPTS {
            tokio::time::sleep(STREAM_POLL_INTERVAL).await;
            if self.media.media_exists(&req.stream_id).await.unwrap_or(false) {
                info!("Stream '{}' is live", req.stream_id);
                return Ok(CommandResult::ok(&cmd.msg_id, "stream started"));
            }
        }

        warn!("Stream '{}' did not appear after signaling", req.stream_id);
        Ok(CommandResult::failure(&cmd.msg_id, "stream did not appear"))
    }

    async fn handle_stop_play(&self, cmd: &ServerCommand) -> Result<CommandResult> {
        let req: StopPlayRequest = serde_json::from_value(cmd.payload.clone())?;

        if self.media.media_exists(&req.stream_id).await? {
            self.media.stop_stream_push(&req.stream_id, "1").await?;
            self.media.close_rtp_server(&req.stream_id).await?;
        }
        self.signaling.stop_stream(&req.stream_id).await?;
        Ok(CommandResult::ok(&cmd.msg_id, "stream stopped"))
    }

    async fn handle_push_stream_reset(&self, cmd: &ServerCommand) -> Result<CommandResult> {
        let req: PushStreamResetRequest = serde_json::from_value(cmd.payload.clone())?;
        let forward = ForwardRequest {
            stream_id: req.stream_id.clone(),
            camera_ip: req.camera_ip,
            username: req.username,
            password: req.password,
            rtsp_suffix: req.rtsp_suffix,
            media_ip: self.media_ip.clone(),
        };

        let key = format!("reset:{}", req.stream_id);
        let action = ResetForwarderAction {
            workers: self.workers.clone(),
            request: forward,
        };
        let rx = self.actions.perform_keyed(&key, self.action_deadline, action)?;
        match rx.await {
            Ok(Ok(())) => Ok(CommandResult::ok(&cmd.msg_id, "forwarder restarted")),
            Ok(Err(e)) => {
                error!("Forwarder reset for '{}' failed: {}", req.stream_id, e);
                Ok(CommandResult::failure(&cmd.msg_id, "forwarder reset failed"))
            }
            Err(_) => Ok(CommandResult::failure(&cmd.msg_id, "forwarder reset aborted")),
        }
    }

    async fn handle_device_control(&self, cmd: &ServerCommand) -> Result<CommandResult> {
        let req: DeviceControlRequest = serde_json::from_value(cmd.payload.clone())?;
        self.signaling
            .device_control(&req.device_id, req.left_right, req.up_down, req.in_out, req.move_speed)
            .await?;
        Ok(CommandResult::ok(&cmd.msg_id, "device control sent"))
    }
}

#[async_trait]
impl CommandExecutor for AgentExecutor {
    async fn execute(&self, cmd: &ServerCommand) -> CommandResult {
        let outcome = match cmd.method {
            CommandMethod::Ping => Ok(CommandResult::ok(&cmd.msg_id, "pong")),
            CommandMethod::Play => self.handle_play(cmd).await,
            CommandMethod::StopPlay => self.handle_stop_play(cmd).await,
            CommandMethod::PushStreamReset => self.handle_push_stream_reset(cmd).await,
            CommandMethod::DeviceControl => self.handle_device_control(cmd).await,
        };

        outcome.unwrap_or_else(|e| {
            error!("Command '{}' ({}) failed: {}", cmd.msg_id, cmd.method, e);
            CommandResult::failure(&cmd.msg_id, &format!("execution failed: {}", e))
        })
    }
}

/// Forced restart of a local forwarder: kill whatever is running for the
/// key, verify it is gone, then spawn a fresh worker.
struct ResetForwarderAction {
    workers: Arc<dyn StreamWorkers>,
    request: ForwardRequest,
}

#[async_trait]
impl IdempotentAction for ResetForwarderAction {
    async fn is_satisfied(&self) -> bool {
        // A reset is always a forced restart; there is no pre-satisfied state
        false
    }

    async fn apply(&self) -> bool {
        if let Err(e) = self.workers.kill(&self.request.stream_id).await {
            warn!("Kill before restart failed for '{}': {}", self.request.stream_id, e);
            return false;
        }
        match self.workers.start(&self.request).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Forwarder restart failed for '{}': {}", self.request.stream_id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaConfig;
    use crate::signaling::NullSignaling;
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct FakeWorkers {
        running: Mutex<HashSet<String>>,
        restarts: Mutex<u32>,
    }

    #[async_trait]
    impl StreamWorkers for FakeWorkers {
        async fn is_running(&self, key: &str) -> bool {
            self.running.lock().unwrap().contains(key)
        }

        async fn start(&self, request: &ForwardRequest) -> Result<()> {
            *self.restarts.lock().unwrap() += 1;
            self.running.lock().unwrap().insert(request.stream_id.clone());
            Ok(())
        }

        async fn kill(&self, key: &str) -> Result<()> {
            self.running.lock().unwrap().remove(key);
            Ok(())
        }
    }

    fn executor() -> (AgentExecutor, Arc<FakeWorkers>) {
        let workers = Arc::new(FakeWorkers {
            running: Mutex::new(HashSet::new()),
            restarts: Mutex::new(0),
        });
        let media = MediaClient::new(&MediaConfig {
            url: "http://127.0.0.1:9092".to_string(),
            secret: "s".to_string(),
            record_path: None,
        });
        let executor = AgentExecutor::new(
            media,
            "127.0.0.1".to_string(),
            workers.clone(),
            Arc::new(NullSignaling),
            Arc::new(ActionManager::new(3, Duration::from_millis(10))),
            Duration::from_secs(5),
        );
        (executor, workers)
    }

    #[tokio::test]
    async fn test_ping_returns_pong() {
        let (executor, _) = executor();
        let cmd = ServerCommand {
            msg_id: "m-1".to_string(),
            method: CommandMethod::Ping,
            payload: serde_json::Value::Null,
        };
        let result = executor.execute(&cmd).await;
        assert!(result.success);
        assert_eq!(result.msg_id, "m-1");
    }

    #[tokio::test]
    async fn test_invalid_payload_fails_without_panicking() {
        let (executor, _) = executor();
        let cmd = ServerCommand {
            msg_id: "m-2".to_string(),
            method: CommandMethod::DeviceControl,
            payload: serde_json::json!("not an object"),
        };
        let result = executor.execute(&cmd).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_push_stream_reset_restarts_worker() {
        let (executor, workers) = executor();
        workers.running.lock().unwrap().insert("IPC001_0".to_string());

        let cmd = ServerCommand {
            msg_id: "m-3".to_string(),
            method: CommandMethod::PushStreamReset,
            payload: serde_json::json!({
                "device_id": "gw-1",
                "stream_id": "IPC001_0",
                "camera_ip": "192.168.1.10",
                "username": "admin",
                "password": "admin",
            }),
        };
        let result = executor.execute(&cmd).await;
        assert!(result.success);
        assert!(workers.is_running("IPC001_0").await);
        assert_eq!(*workers.restarts.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_device_control_passes_through() {
        let (executor, _) = executor();
        let cmd = ServerCommand {
            msg_id: "m-4".to_string(),
            method: CommandMethod::DeviceControl,
            payload: serde_json::json!({ "device_id": "cam-1", "left_right": 1, "move_speed": 128 }),
        };
        let result = executor.execute(&cmd).await;
        assert!(result.success);
    }
}
