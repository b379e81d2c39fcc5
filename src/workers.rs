use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::errors::{FleetError, Result};

const KILL_ATTEMPTS: u32 = 3;
const KILL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Parameters for one local stream-forwarding worker: pulls RTSP from a
/// camera and pushes it to the media server.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub stream_id: String,
    pub camera_ip: String,
    pub username: String,
    pub password: String,
    pub rtsp_suffix: String,
    pub media_ip: String,
}

/// Process-lifecycle capability for local stream-forwarding workers. The
/// keyed action manager is agnostic to whether an action is a remote HTTP
/// call or a local process signal; this is the local half.
#[async_trait]
pub trait StreamWorkers: Send + Sync {
    async fn is_running(&self, key: &str) -> bool;
    async fn start(&self, request: &ForwardRequest) -> Result<()>;
    /// Kill the worker for a key and verify it is gone.
    async fn kill(&self, key: &str) -> Result<()>;
}

/// Shell-out adapter: workers are ffmpeg processes found by matching the
/// stream key on their command line.
pub struct ShellWorkers;

impl ShellWorkers {
    async fn matching_pids(pattern: &str) -> String {
        match Command::new("pgrep").arg("-f").arg(pattern).output().await {
            Ok(output) => String::from_utf8_lossy(&output.stdout).trim().to_string(),
            Err(e) => {
                error!("pgrep failed: {}", e);
                String::new()
            }
        }
    }
}

#[async_trait]
impl StreamWorkers for ShellWorkers {
    async fn is_running(&self, key: &str) -> bool {
        let pattern = format!("ffmpeg.*{}", key);
        !Self::matching_pids(&pattern).await.is_empty()
    }

    async fn start(&self, request: &ForwardRequest) -> Result<()> {
        let input = format!(
            "rtsp://{}:{}@{}:554{}",
            request.username, request.password, request.camera_ip, request.rtsp_suffix
        );
        let output = format!("rtsp://{}:554/rtp/{}", request.media_ip, request.stream_id);

        let child = Command::new("ffmpeg")
            .args(["-rtsp_transport", "tcp", "-i", &input])
            .args(["-c", "copy"])
            .args(["-c:a", "pcm_alaw", "-ar", "8000"])
            .args(["-f", "rtsp", &output])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| FleetError::worker(format!("failed to spawn forwarder for '{}': {}", request.stream_id, e)))?;

        info!("Started forwarder for stream '{}' (pid {:?})", request.stream_id, child.id());
        // The worker outlives this call; liveness is checked via is_running
        drop(child);
        Ok(())
    }

    async fn kill(&self, key: &str) -> Result<()> {
        let pattern = format!("ffmpeg.*{}", key);

        for attempt in 1..=KILL_ATTEMPTS {
            if Self::matching_pids(&pattern).await.is_empty() {
                debug!("No forwarder process matches '{}'", key);
                return Ok(());
            }
            match Command::new("pkill").arg("-f").arg(&pattern).status().await {
                Ok(status) if status.success() => return Ok(()),
                Ok(_) => debug!("pkill reported no match for '{}' (attempt {})", key, attempt),
                Err(e) => debug!("pkill for '{}' failed: {} (attempt {})", key, e, attempt),
            }
            tokio::time::sleep(KILL_RETRY_DELAY).await;
        }

        // Final verification before declaring failure
        let leftover = Self::matching_pids(&pattern).await;
        if leftover.is_empty() {
            debug!("Forwarder for '{}' gone after retries", key);
            Ok(())
        } else {
            error!("Forwarder for '{}' still running (pids {})", key, leftover);
            Err(FleetError::worker(format!("failed to kill forwarder for '{}'", key)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    pub struct FakeWorkers {
        pub running: Mutex<HashSet<String>>,
        pub kill_fails: bool,
    }

    impl FakeWorkers {
        pub fn new() -> Self {
            Self { running: Mutex::new(HashSet::new()), kill_fails: false }
        }
    }

    #[async_trait]
    impl StreamWorkers for FakeWorkers {
        async fn is_running(&self, key: &str) -> bool {
            self.running.lock().unwrap().contains(key)
        }

        async fn start(&self, request: &ForwardRequest) -> Result<()> {
            self.running.lock().unwrap().insert(request.stream_id.clone());
            Ok(())
        }

        async fn kill(&self, key: &str) -> Result<()> {
            if self.kill_fails {
                return Err(FleetError::worker(format!("failed to kill forwarder for '{}'", key)));
            }
            self.running.lock().unwrap().remove(key);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_fake_workers_lifecycle() {
        let workers = FakeWorkers::new();
        assert!(!workers.is_running("IPC001_0").await);

        let request = ForwardRequest {
            stream_id: "IPC001_0".to_string(),
            camera_ip: "192.168.1.10".to_string(),
            username: "admin".to_string(),
            password: "admin".to_string(),
            rtsp_suffix: "/stream1".to_string(),
            media_ip: "127.0.0.1".to_string(),
        };
        workers.start(&request).await.unwrap();
        assert!(workers.is_running("IPC001_0").await);

        workers.kill("IPC001_0").await.unwrap();
        assert!(!workers.is_running("IPC001_0").await);
    }
}
