use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Command pushed from the fleet server to a connected gateway.
/// `msg_id` correlates the eventual [`CommandResult`]; reuse within one
/// session's lifetime is undefined behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCommand {
    pub msg_id: String,
    pub method: CommandMethod,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Correlated reply from a gateway for a previously relayed command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub msg_id: String,
    pub success: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CommandResult {
    pub fn ok(msg_id: &str, message: &str) -> Self {
        Self {
            msg_id: msg_id.to_string(),
            success: true,
            payload: serde_json::json!({ "message": message }),
        }
    }

    pub fn failure(msg_id: &str, message: &str) -> Self {
        Self {
            msg_id: msg_id.to_string(),
            success: false,
            payload: serde_json::json!({ "message": message }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandMethod {
    Ping,
    Play,
    StopPlay,
    PushStreamReset,
    DeviceControl,
}

impl std::fmt::Display for CommandMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandMethod::Ping => write!(f, "ping"),
            CommandMethod::Play => write!(f, "play"),
            CommandMethod::StopPlay => write!(f, "stop_play"),
            CommandMethod::PushStreamReset => write!(f, "push_stream_reset"),
            CommandMethod::DeviceControl => write!(f, "device_control"),
        }
    }
}

/// Registration handshake: required first frame on every new session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRegister {
    pub client_id: String,
    pub version: String,
    pub device_type: String,
}

/// Raw AI-detection report forwarded by a gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub device_id: String,
    pub stream_id: String,
    pub class_name: String,
    pub score: f64,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpcEventKind {
    Register,
    Keepalive,
    ChannelsActive,
}

/// Camera lifecycle notification from a gateway (register/keepalive).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcEvent {
    pub device_id: String,
    pub ipc_id: String,
    pub event: IpcEventKind,
    pub ipc_name: Option<String>,
    pub channel_id: Option<String>,
}

/// Every frame a gateway may send on the relay stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Register(ClientRegister),
    Result(CommandResult),
    Detection(DetectionEvent),
    IpcEvent(IpcEvent),
}

// ---- command payloads ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayRequest {
    pub device_id: String,
    pub channel_id: String,
    pub stream_id: String,
    /// 0 = udp, 1 = tcp
    #[serde(default)]
    pub mode: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopPlayRequest {
    pub stream_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushStreamResetRequest {
    pub device_id: String,
    pub stream_id: String,
    pub camera_ip: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub rtsp_suffix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceControlRequest {
    pub device_id: String,
    #[serde(default)]
    pub left_right: i8,
    #[serde(default)]
    pub up_down: i8,
    #[serde(default)]
    pub in_out: i8,
    #[serde(default)]
    pub move_speed: u8,
}

/// Trigger monitor output consumed by the recording dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub key: String,
    pub class_name: String,
    pub event: TriggerEventKind,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEventKind {
    Start,
    Stop,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_round_trip() {
        let frame = ClientFrame::Register(ClientRegister {
            client_id: "gw-001".to_string(),
            version: "1.0.0".to_string(),
            device_type: "rk3588".to_string(),
        });
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"register\""));

        match serde_json::from_str::<ClientFrame>(&json).unwrap() {
            ClientFrame::Register(reg) => assert_eq!(reg.client_id, "gw-001"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_command_envelope_fields() {
        let cmd = ServerCommand {
            msg_id: "m-1".to_string(),
            method: CommandMethod::Play,
            payload: serde_json::json!({ "stream_id": "IPC001_0" }),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["msg_id"], "m-1");
        assert_eq!(json["method"], "play");
        assert_eq!(json["payload"]["stream_id"], "IPC001_0");
    }

    #[test]
    fn test_result_defaults_missing_payload() {
        let result: CommandResult =
            serde_json::from_str(r#"{"msg_id":"m-2","success":true}"#).unwrap();
        assert!(result.success);
        assert!(result.payload.is_null());
    }
}
