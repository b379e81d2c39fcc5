use std::sync::Arc;
use axum::extract::{Path as AxumPath, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::dispatcher;
use crate::errors::FleetError;
use crate::protocol::CommandMethod;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<u16>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn error(message: &str, code: u16) -> ApiResponse<()> {
        ApiResponse {
            status: "error".to_string(),
            data: None,
            error: Some(message.to_string()),
            code: Some(code),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub method: CommandMethod,
    #[serde(default)]
    pub payload: serde_json::Value,
}

pub async fn api_health() -> axum::response::Response {
    Json(ApiResponse::success(serde_json::json!({ "status": "ok" }))).into_response()
}

/// List currently connected gateways.
pub async fn api_list_clients(State(state): State<Arc<AppState>>) -> axum::response::Response {
    let sessions = state.registry.list().await;
    Json(ApiResponse::success(sessions)).into_response()
}

/// Relay a command to a connected gateway and return its correlated result.
pub async fn api_send_command(
    State(state): State<Arc<AppState>>,
    AxumPath(client_id): AxumPath<String>,
    Json(request): Json<CommandRequest>,
) -> axum::response::Response {
    match state
        .registry
        .send(&client_id, request.method, request.payload)
        .await
    {
        Ok(result) => Json(ApiResponse::success(result)).into_response(),
        Err(FleetError::NotConnected { .. }) => {
            warn!("Command for offline client '{}'", client_id);
            (
                axum::http::StatusCode::NOT_FOUND,
                Json(ApiResponse::<()>::error("Device is offline", 404)),
            )
                .into_response()
        }
        Err(FleetError::Timeout { .. }) => {
            warn!("Command to client '{}' timed out", client_id);
            (
                axum::http::StatusCode::GATEWAY_TIMEOUT,
                Json(ApiResponse::<()>::error("Device did not respond in time", 504)),
            )
                .into_response()
        }
        Err(e) => {
            error!("Command relay to '{}' failed: {}", client_id, e);
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<()>::error("Command relay failed", 500)),
            )
                .into_response()
        }
    }
}

/// Manually start recording a stream, through the same keyed idempotent
/// action the trigger dispatcher uses.
pub async fn api_start_recording(
    State(state): State<Arc<AppState>>,
    AxumPath(stream_id): AxumPath<String>,
) -> axum::response::Response {
    run_recording_action(state, stream_id, true).await
}

/// Manually stop recording a stream.
pub async fn api_stop_recording(
    State(state): State<Arc<AppState>>,
    AxumPath(stream_id): AxumPath<String>,
) -> axum::response::Response {
    run_recording_action(state, stream_id, false).await
}

async fn run_recording_action(
    state: Arc<AppState>,
    stream_id: String,
    start: bool,
) -> axum::response::Response {
    let launched = if start {
        dispatcher::launch_start_recording(
            &state.actions,
            state.media.clone(),
            &stream_id,
            "manual",
            state.action_deadline,
        )
    } else {
        dispatcher::launch_stop_recording(
            &state.actions,
            state.media.clone(),
            &stream_id,
            state.action_deadline,
        )
    };

    match launched {
        Ok(rx) => match rx.await {
            Ok(Ok(())) => Json(ApiResponse::success(serde_json::json!({
                "stream_id": stream_id,
                "recording": start,
            })))
            .into_response(),
            Ok(Err(e)) => {
                error!("Recording action for '{}' failed: {}", stream_id, e);
                (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ApiResponse::<()>::error("Recording action failed", 500)),
                )
                    .into_response()
            }
            Err(_) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<()>::error("Recording action aborted", 500)),
            )
                .into_response(),
        },
        Err(FleetError::AlreadyInProgress { .. }) => (
            axum::http::StatusCode::CONFLICT,
            Json(ApiResponse::<()>::error(
                "A previous attempt for this stream is still running",
                409,
            )),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to launch recording action for '{}': {}", stream_id, e);
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<()>::error("Failed to launch recording action", 500)),
            )
                .into_response()
        }
    }
}
