use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::errors::{FleetError, Result};
use crate::protocol::{CommandMethod, CommandResult, ServerCommand};
use crate::utils::new_msg_id;

/// One persistent duplex connection to a gateway. Owns the outbound command
/// queue (drained by the session's single writer task) and the map of
/// in-flight message IDs to their response waiters.
pub struct ClientSession {
    client_id: String,
    device_type: String,
    connected_at: DateTime<Utc>,
    outbox: mpsc::Sender<ServerCommand>,
    pending: Mutex<HashMap<String, oneshot::Sender<CommandResult>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub client_id: String,
    pub device_type: String,
    pub connected_at: DateTime<Utc>,
}

impl ClientSession {
    pub fn new(client_id: String, device_type: String, outbox: mpsc::Sender<ServerCommand>) -> Self {
        Self {
            client_id,
            device_type,
            connected_at: Utc::now(),
            outbox,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            client_id: self.client_id.clone(),
            device_type: self.device_type.clone(),
            connected_at: self.connected_at,
        }
    }

    /// Send a command and block for its correlated result, or time out.
    /// The waiter is registered before the command hits the wire so a fast
    /// response can never race past it.
    pub async fn send(&self, cmd: ServerCommand, timeout: Duration) -> Result<CommandResult> {
        let msg_id = cmd.msg_id.clone();
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock().await;
            if pending.contains_key(&msg_id) {
                return Err(FleetError::protocol(format!(
                    "Duplicate in-flight message ID '{}'", msg_id
                )));
            }
            pending.insert(msg_id.clone(), tx);
        }

        if self.outbox.send(cmd).await.is_err() {
            // Writer task is gone, the session is being torn down
            self.pending.lock().await.remove(&msg_id);
            return Err(FleetError::not_connected(&self.client_id));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            // Waiter dropped without a value: session force-failed on disconnect
            Ok(Err(_)) => Err(FleetError::not_connected(&self.client_id)),
            Err(_) => {
                self.pending.lock().await.remove(&msg_id);
                Err(FleetError::timeout(&msg_id))
            }
        }
    }

    /// Route an incoming result frame to its waiter. This is the single
    /// consumption point for responses: the entry is removed under the lock,
    /// so each waiter resolves at most once.
    pub async fn deliver_result(&self, result: CommandResult) {
        let waiter = self.pending.lock().await.remove(&result.msg_id);
        match waiter {
            Some(tx) => {
                if tx.send(result).is_err() {
                    // Caller already gave up (timed out) between removal and send
                    debug!("Result waiter for client '{}' is gone", self.client_id);
                }
            }
            None => {
                debug!("Dropping unmatched result '{}' from client '{}'", result.msg_id, self.client_id);
            }
        }
    }

    /// Force-fail every in-flight request. Dropping the waiters unblocks all
    /// callers with a "client disconnected" error.
    pub async fn fail_all_pending(&self) {
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        pending.clear();
        if count > 0 {
            warn!("Failed {} pending request(s) for client '{}'", count, self.client_id);
        }
    }

    #[cfg(test)]
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Tracks one [`ClientSession`] per connected gateway, keyed by client ID.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<ClientSession>>>,
    response_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(response_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            response_timeout,
        }
    }

    /// Register a freshly connected client. A live session under the same ID
    /// is displaced and its pending requests are force-failed.
    pub async fn register(
        &self,
        client_id: &str,
        device_type: &str,
        outbox: mpsc::Sender<ServerCommand>,
    ) -> Arc<ClientSession> {
        let session = Arc::new(ClientSession::new(
            client_id.to_string(),
            device_type.to_string(),
            outbox,
        ));
        let displaced = {
            let mut sessions = self.sessions.write().await;
            sessions.insert(client_id.to_string(), session.clone())
        };
        if let Some(old) = displaced {
            warn!("Client '{}' reconnected, displacing previous session", client_id);
            old.fail_all_pending().await;
        }
        info!("Registered client '{}' ({})", client_id, device_type);
        session
    }

    /// Remove a session on disconnect. Only removes the registry entry if it
    /// still points at this session, so a reconnect that already displaced it
    /// is left untouched. Pending requests are failed either way.
    pub async fn unregister(&self, session: &Arc<ClientSession>) {
        {
            let mut sessions = self.sessions.write().await;
            if let Some(current) = sessions.get(session.client_id()) {
                if Arc::ptr_eq(current, session) {
                    sessions.remove(session.client_id());
                }
            }
        }
        session.fail_all_pending().await;
        info!("Unregistered client '{}'", session.client_id());
    }

    pub async fn get(&self, client_id: &str) -> Option<Arc<ClientSession>> {
        self.sessions.read().await.get(client_id).cloned()
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        self.sessions.read().await.values().map(|s| s.info()).collect()
    }

    /// Relay a command to a connected client and wait for its result.
    pub async fn send(
        &self,
        client_id: &str,
        method: CommandMethod,
        payload: serde_json::Value,
    ) -> Result<CommandResult> {
        let session = self
            .get(client_id)
            .await
            .ok_or_else(|| FleetError::not_connected(client_id))?;
        let cmd = ServerCommand {
            msg_id: new_msg_id(),
            method,
            payload,
        };
        session.send(cmd, self.response_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_command(msg_id: &str) -> ServerCommand {
        ServerCommand {
            msg_id: msg_id.to_string(),
            method: CommandMethod::Ping,
            payload: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_send_resolves_with_matching_result() {
        let (tx, mut rx) = mpsc::channel(8);
        let session = Arc::new(ClientSession::new("gw-1".into(), "gateway".into(), tx));

        let sender = session.clone();
        let send_task = tokio::spawn(async move {
            sender.send(test_command("m-1"), Duration::from_secs(5)).await
        });

        // The command must reach the outbox before the result is delivered
        let cmd = rx.recv().await.unwrap();
        assert_eq!(cmd.msg_id, "m-1");
        session.deliver_result(CommandResult::ok("m-1", "done")).await;

        let result = send_task.await.unwrap().unwrap();
        assert!(result.success);
        assert_eq!(session.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_results_correlate_out_of_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let session = Arc::new(ClientSession::new("gw-1".into(), "gateway".into(), tx));

        let s1 = session.clone();
        let first = tokio::spawn(async move {
            s1.send(test_command("m-1"), Duration::from_secs(5)).await
        });
        let s2 = session.clone();
        let second = tokio::spawn(async move {
            s2.send(test_command("m-2"), Duration::from_secs(5)).await
        });

        // Wait until both commands are on the wire, then answer in reverse
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        session.deliver_result(CommandResult::failure("m-2", "nope")).await;
        session.deliver_result(CommandResult::ok("m-1", "done")).await;

        assert!(first.await.unwrap().unwrap().success);
        assert!(!second.await.unwrap().unwrap().success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_times_out_without_response() {
        let (tx, _rx) = mpsc::channel(8);
        let session = ClientSession::new("gw-1".into(), "gateway".into(), tx);

        let err = session
            .send(test_command("m-1"), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Timeout { .. }));
        // The waiter entry must not leak after expiry
        assert_eq!(session.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_exactly_once_under_concurrent_delivery_and_timeout() {
        // Race a very short timeout against result delivery; whichever wins,
        // the caller observes exactly one outcome and nothing leaks.
        for _ in 0..50 {
            let (tx, _rx) = mpsc::channel(8);
            let session = Arc::new(ClientSession::new("gw-1".into(), "gateway".into(), tx));

            let sender = session.clone();
            let send_task = tokio::spawn(async move {
                sender.send(test_command("m-1"), Duration::from_millis(1)).await
            });
            let deliverer = session.clone();
            let deliver_task = tokio::spawn(async move {
                deliverer.deliver_result(CommandResult::ok("m-1", "done")).await;
            });

            let outcome = send_task.await.unwrap();
            deliver_task.await.unwrap();
            match outcome {
                Ok(result) => assert!(result.success),
                Err(FleetError::Timeout { .. }) => {}
                Err(other) => panic!("unexpected error: {}", other),
            }
            assert_eq!(session.pending_count().await, 0);
        }
    }

    #[tokio::test]
    async fn test_unregister_unblocks_pending_callers() {
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(30)));
        let (tx, _rx) = mpsc::channel(8);
        let session = registry.register("gw-1", "gateway", tx).await;

        let blocked = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry.send("gw-1", CommandMethod::Ping, serde_json::Value::Null).await
            })
        };
        // Let the send park on its waiter before tearing the session down
        tokio::task::yield_now().await;
        registry.unregister(&session).await;

        let err = blocked.await.unwrap().unwrap_err();
        assert!(matches!(err, FleetError::NotConnected { .. }));
        assert_eq!(session.pending_count().await, 0);
        assert!(registry.get("gw-1").await.is_none());
    }

    #[tokio::test]
    async fn test_send_to_unknown_client_is_not_connected() {
        let registry = SessionRegistry::new(Duration::from_secs(1));
        let err = registry
            .send("nope", CommandMethod::Ping, serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_reregistration_displaces_old_session() {
        let registry = SessionRegistry::new(Duration::from_secs(30));
        let (tx1, _rx1) = mpsc::channel(8);
        let old = registry.register("gw-1", "gateway", tx1).await;
        let (tx2, _rx2) = mpsc::channel(8);
        let new = registry.register("gw-1", "gateway", tx2).await;

        // Disconnect of the displaced session must not evict the new one
        registry.unregister(&old).await;
        let current = registry.get("gw-1").await.unwrap();
        assert!(Arc::ptr_eq(&current, &new));
    }
}
