use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::actions::{ActionManager, IdempotentAction};
use crate::errors::{FleetError, Result};
use crate::media::MediaClient;
use crate::mqtt::MqttHandle;
use crate::protocol::TriggerEventKind;
use crate::trigger::TriggerEventStream;

/// Start a keyed "ensure recording is on" action for a stream.
pub fn launch_start_recording(
    actions: &Arc<ActionManager>,
    media: MediaClient,
    stream_id: &str,
    class_name: &str,
    deadline: Duration,
) -> Result<oneshot::Receiver<Result<()>>> {
    let key = format!("record:start:{}", stream_id);
    let action = StartRecording {
        media,
        stream_id: stream_id.to_string(),
        class_name: class_name.to_string(),
    };
    actions.perform_keyed(&key, deadline, action)
}

/// Start a keyed "ensure recording is off" action for a stream.
pub fn launch_stop_recording(
    actions: &Arc<ActionManager>,
    media: MediaClient,
    stream_id: &str,
    deadline: Duration,
) -> Result<oneshot::Receiver<Result<()>>> {
    let key = format!("record:stop:{}", stream_id);
    let action = StopRecording {
        media,
        stream_id: stream_id.to_string(),
    };
    actions.perform_keyed(&key, deadline, action)
}

/// Maps debounced trigger events onto recording state on the media server:
/// start → ensure recording is on, stop → ensure recording is off. Each
/// transition runs as a keyed idempotent action; outcomes are observed
/// asynchronously.
pub struct Dispatcher {
    actions: Arc<ActionManager>,
    media: MediaClient,
    mqtt: MqttHandle,
    action_deadline: Duration,
}

impl Dispatcher {
    pub fn new(
        actions: Arc<ActionManager>,
        media: MediaClient,
        mqtt: MqttHandle,
        action_deadline: Duration,
    ) -> Self {
        Self { actions, media, mqtt, action_deadline }
    }

    pub async fn run(self, mut events: TriggerEventStream) {
        info!("Recording dispatcher started");
        while let Some((stream_id, event)) = events.next_event().await {
            self.mqtt.publish_trigger_event(&event).await;
            let launched = match event.event {
                TriggerEventKind::Start => launch_start_recording(
                    &self.actions,
                    self.media.clone(),
                    &stream_id,
                    &event.class_name,
                    self.action_deadline,
                ),
                TriggerEventKind::Stop => launch_stop_recording(
                    &self.actions,
                    self.media.clone(),
                    &stream_id,
                    self.action_deadline,
                ),
            };
            match launched {
                Ok(rx) => {
                    let key = format!("{:?}:{}", event.event, stream_id);
                    tokio::spawn(observe_outcome(key, rx));
                }
                Err(FleetError::AlreadyInProgress { key, .. }) => {
                    // A previous attempt is still running; do not duplicate it
                    warn!("Skipping '{}': previous attempt still in progress", key);
                }
                Err(e) => error!("Failed to launch recording action for '{}': {}", stream_id, e),
            }
        }
        info!("Trigger event stream closed, dispatcher exiting");
    }
}

async fn observe_outcome(key: String, rx: oneshot::Receiver<Result<()>>) {
    match rx.await {
        Ok(Ok(())) => info!("Action '{}' completed", key),
        Ok(Err(e)) => error!("Action '{}' failed: {}", key, e),
        Err(_) => error!("Action '{}' aborted before reporting an outcome", key),
    }
}

/// Ensure the media server is recording a stream.
struct StartRecording {
    media: MediaClient,
    stream_id: String,
    class_name: String,
}

#[async_trait]
impl IdempotentAction for StartRecording {
    async fn is_satisfied(&self) -> bool {
        matches!(self.media.is_recording(&self.stream_id).await, Ok(true))
    }

    async fn apply(&self) -> bool {
        self.media
            .start_recording(&self.stream_id, &self.class_name)
            .await
            .unwrap_or(false)
    }
}

/// Ensure the media server is not recording a stream.
struct StopRecording {
    media: MediaClient,
    stream_id: String,
}

#[async_trait]
impl IdempotentAction for StopRecording {
    async fn is_satisfied(&self) -> bool {
        matches!(self.media.is_recording(&self.stream_id).await, Ok(false))
    }

    async fn apply(&self) -> bool {
        self.media.stop_recording(&self.stream_id).await.unwrap_or(false)
    }
}
