use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, info, warn};

use crate::protocol::{TriggerEvent, TriggerEventKind};

const EVENT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct TriggerSettings {
    /// Rolling window for the detection debounce
    pub debounce_window: Duration,
    /// Detections required within the window before a start fires
    pub debounce_threshold: u32,
    /// Idle time without detections before a stop fires
    pub idle_timeout: Duration,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_secs(5),
            debounce_threshold: 2,
            idle_timeout: Duration::from_secs(20),
        }
    }
}

struct TriggerState {
    fired: bool,
    window_start: Instant,
    count: u32,
    heartbeat: mpsc::Sender<()>,
    // Taken by the idle watcher when the record fires
    heartbeat_rx: Option<mpsc::Receiver<()>>,
    cancel: Option<broadcast::Sender<()>>,
}

impl TriggerState {
    fn new() -> Self {
        let (heartbeat, heartbeat_rx) = mpsc::channel(1);
        Self {
            fired: false,
            window_start: Instant::now(),
            count: 0,
            heartbeat,
            heartbeat_rx: Some(heartbeat_rx),
            cancel: None,
        }
    }
}

/// Converts raw per-source detection streams into debounced start/stop
/// events. Each source gets its own buffered event channel; a consumer reads
/// them all through [`TriggerEventStream`] without polling and without
/// missing newly added or removed sources.
pub struct TriggerMonitor {
    settings: TriggerSettings,
    records: RwLock<HashMap<String, Arc<Mutex<TriggerState>>>>,
    channels: Mutex<HashMap<String, mpsc::Sender<TriggerEvent>>>,
    // Receivers created by registry mutations, awaiting pickup by the consumer
    added: Mutex<Vec<(String, mpsc::Receiver<TriggerEvent>)>>,
    update_tx: mpsc::Sender<()>,
}

impl TriggerMonitor {
    pub fn new(settings: TriggerSettings) -> (Arc<Self>, TriggerEventStream) {
        let (update_tx, update_rx) = mpsc::channel(1);
        let monitor = Arc::new(Self {
            settings,
            records: RwLock::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            added: Mutex::new(Vec::new()),
            update_tx,
        });
        let stream = TriggerEventStream {
            streams: StreamMap::new(),
            update_rx,
            monitor: monitor.clone(),
        };
        (monitor, stream)
    }

    /// Record one raw detection for a source. Debounce rule: the first
    /// `debounce_threshold` detections inside one `debounce_window` arm the
    /// trigger and emit a start; afterwards every detection only feeds the
    /// idle watcher's heartbeat.
    pub async fn record_detection(self: &Arc<Self>, stream_id: &str, class_name: &str) {
        self.ensure_channel(stream_id).await;
        let record = self.get_or_create_record(stream_id).await;
        let key = format!("{}_{}", stream_id, class_name);

        let mut state = record.lock().await;
        if !state.fired {
            let now = Instant::now();
            if now.duration_since(state.window_start) > self.settings.debounce_window {
                // Window elapsed, this detection opens a fresh one
                state.window_start = now;
                state.count = 1;
            } else {
                state.count += 1;
            }

            if state.count >= self.settings.debounce_threshold {
                info!("Trigger armed for '{}'", key);
                state.fired = true;
                self.emit(stream_id, &key, class_name, TriggerEventKind::Start).await;

                let (cancel_tx, cancel_rx) = broadcast::channel(1);
                state.cancel = Some(cancel_tx);
                let heartbeat_rx = state
                    .heartbeat_rx
                    .take()
                    .unwrap_or_else(|| mpsc::channel(1).1);
                let monitor = self.clone();
                let stream_id = stream_id.to_string();
                let class_name = class_name.to_string();
                let key = key.clone();
                tokio::spawn(async move {
                    monitor
                        .idle_watcher(stream_id, key, class_name, heartbeat_rx, cancel_rx)
                        .await;
                });
            }
        }

        // Coalescing heartbeat: a full channel means the watcher already has
        // a pending "recent activity" signal
        let _ = state.heartbeat.try_send(());
    }

    /// Tear down a source: cancel its watcher, delete its record and close
    /// its event channel. Safe to call for unknown sources.
    pub async fn cancel(&self, stream_id: &str) {
        let record = self.records.write().await.remove(stream_id);
        if let Some(record) = record {
            let state = record.lock().await;
            if let Some(cancel) = &state.cancel {
                let _ = cancel.send(());
            }
            debug!("Cancelled trigger monitoring for '{}'", stream_id);
        }
        // Dropping the sender closes the channel once the consumer has
        // drained whatever is still buffered
        let removed = self.channels.lock().await.remove(stream_id);
        if removed.is_some() {
            self.notify_registry_changed();
        }
    }

    async fn idle_watcher(
        self: Arc<Self>,
        stream_id: String,
        key: String,
        class_name: String,
        mut heartbeat_rx: mpsc::Receiver<()>,
        mut cancel_rx: broadcast::Receiver<()>,
    ) {
        let idle_timeout = self.settings.idle_timeout;
        let sleep = tokio::time::sleep(idle_timeout);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = cancel_rx.recv() => {
                    debug!("Idle watcher for '{}' cancelled", key);
                    return;
                }
                beat = heartbeat_rx.recv() => {
                    match beat {
                        Some(()) => sleep.as_mut().reset(Instant::now() + idle_timeout),
                        // Record is gone; nothing left to watch
                        None => return,
                    }
                }
                () = &mut sleep => {
                    debug!("No detections for '{}' within {:?}, disarming", key, idle_timeout);
                    self.emit(&stream_id, &key, &class_name, TriggerEventKind::Stop).await;
                    self.records.write().await.remove(&stream_id);
                    return;
                }
            }
        }
    }

    async fn emit(&self, stream_id: &str, key: &str, class_name: &str, kind: TriggerEventKind) {
        let event = TriggerEvent {
            key: key.to_string(),
            class_name: class_name.to_string(),
            event: kind,
            time: Utc::now(),
        };
        match self.channels.lock().await.get(stream_id) {
            Some(sender) => {
                if sender.try_send(event).is_err() {
                    warn!("Event channel for '{}' is full, dropping {:?} event", stream_id, kind);
                }
            }
            // Late event for a torn-down source; expected under concurrent teardown
            None => debug!("No event channel for '{}', dropping {:?} event", stream_id, kind),
        }
    }

    async fn ensure_channel(&self, stream_id: &str) {
        let mut channels = self.channels.lock().await;
        if channels.contains_key(stream_id) {
            return;
        }
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        channels.insert(stream_id.to_string(), tx);
        self.added.lock().await.push((stream_id.to_string(), rx));
        self.notify_registry_changed();
    }

    async fn get_or_create_record(&self, stream_id: &str) -> Arc<Mutex<TriggerState>> {
        {
            let records = self.records.read().await;
            if let Some(record) = records.get(stream_id) {
                return record.clone();
            }
        }
        let mut records = self.records.write().await;
        records
            .entry(stream_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TriggerState::new())))
            .clone()
    }

    fn notify_registry_changed(&self) {
        // Non-blocking: a pending nudge already forces a rebuild
        let _ = self.update_tx.try_send(());
    }

    async fn drain_added(&self) -> Vec<(String, mpsc::Receiver<TriggerEvent>)> {
        std::mem::take(&mut *self.added.lock().await)
    }

    #[cfg(test)]
    async fn has_record(&self, stream_id: &str) -> bool {
        self.records.read().await.contains_key(stream_id)
    }
}

/// Multiplexed read surface over every active source's event channel.
/// Registry mutations nudge `update_rx`; the consumer rebuilds its wait set
/// and resumes waiting. A removed source's stream ends only after its
/// buffered events are drained.
pub struct TriggerEventStream {
    streams: StreamMap<String, ReceiverStream<TriggerEvent>>,
    update_rx: mpsc::Receiver<()>,
    monitor: Arc<TriggerMonitor>,
}

impl TriggerEventStream {
    /// Block until any source emits or the registry changes. Yields the
    /// source's stream ID alongside the event.
    pub async fn next_event(&mut self) -> Option<(String, TriggerEvent)> {
        loop {
            self.sync_sources().await;

            if self.streams.is_empty() {
                match self.update_rx.recv().await {
                    Some(()) => continue,
                    None => return None,
                }
            }

            tokio::select! {
                maybe = self.streams.next() => {
                    match maybe {
                        Some((source, event)) => return Some((source, event)),
                        // Every stream closed since the last rebuild
                        None => continue,
                    }
                }
                changed = self.update_rx.recv() => {
                    match changed {
                        Some(()) => continue,
                        None => return None,
                    }
                }
            }
        }
    }

    async fn sync_sources(&mut self) {
        for (key, rx) in self.monitor.drain_added().await {
            self.streams.insert(key, ReceiverStream::new(rx));
        }
    }
}
