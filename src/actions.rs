use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::errors::{FleetError, Result};

/// An operation safe to attempt repeatedly: check whether the desired
/// external state already holds, and apply one step toward it if not.
#[async_trait]
pub trait IdempotentAction: Send + Sync {
    /// Does the desired state already hold?
    async fn is_satisfied(&self) -> bool;
    /// Attempt the state change once. Returns whether it reported success.
    async fn apply(&self) -> bool;
}

/// Runs "check state, act if needed" operations with per-key mutual
/// exclusion and bounded retry. A second concurrent request for a key fails
/// fast with `AlreadyInProgress` instead of queuing.
pub struct ActionManager {
    in_flight: Mutex<HashSet<String>>,
    // Lazily created, never removed: the key space is bounded by active streams
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    max_retry: u32,
    retry_delay: Duration,
}

impl ActionManager {
    pub fn new(max_retry: u32, retry_delay: Duration) -> Self {
        Self {
            in_flight: Mutex::new(HashSet::new()),
            locks: Mutex::new(HashMap::new()),
            max_retry,
            retry_delay,
        }
    }

    /// Start a keyed action and return a receiver for its eventual outcome.
    /// Returns `AlreadyInProgress` immediately when the key is busy. The key
    /// is deregistered on every exit path so later calls are never blocked.
    pub fn perform_keyed<A>(
        self: &Arc<Self>,
        key: &str,
        deadline: Duration,
        action: A,
    ) -> Result<oneshot::Receiver<Result<()>>>
    where
        A: IdempotentAction + 'static,
    {
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if !in_flight.insert(key.to_string()) {
                return Err(FleetError::already_in_progress(key));
            }
        }

        let (result_tx, result_rx) = oneshot::channel();
        let manager = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let outcome = tokio::time::timeout(deadline, manager.run_attempts(&key, &action))
                .await
                .unwrap_or_else(|_| {
                    warn!("Keyed action '{}' cancelled by deadline", key);
                    Err(FleetError::cancelled(&key))
                });
            manager.deregister(&key);
            let _ = result_tx.send(outcome);
        });

        Ok(result_rx)
    }

    async fn run_attempts(&self, key: &str, action: &dyn IdempotentAction) -> Result<()> {
        let lock = self.key_lock(key);
        // Serializes with any other holder of this key's mutex
        let _guard = lock.lock().await;

        for attempt in 1..=self.max_retry {
            if action.is_satisfied().await {
                debug!("Keyed action '{}' already satisfied (attempt {})", key, attempt);
                return Ok(());
            }
            if action.apply().await {
                debug!("Keyed action '{}' succeeded on attempt {}", key, attempt);
                return Ok(());
            }
            if attempt < self.max_retry {
                warn!("Keyed action '{}' attempt {} failed, retrying in {:?}", key, attempt, self.retry_delay);
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(FleetError::retries_exhausted(key, self.max_retry))
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn deregister(&self, key: &str) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(key);
    }

    #[cfg(test)]
    fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.lock().unwrap().contains(key)
    }
}
