use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use crate::errors::Result;
use crate::utils::parse_duration;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub action: ActionConfig,
    pub media: MediaConfig,
    pub agent: Option<AgentConfig>,
    pub mqtt: Option<MqttConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_allow_origin: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// How long `send` waits for a correlated response, e.g. "10s"
    #[serde(default = "default_response_timeout")]
    pub response_timeout: String,
    /// Capacity of each session's outbound command queue
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Rolling window for the detection debounce, e.g. "5s"
    #[serde(default = "default_debounce_window")]
    pub debounce_window: String,
    /// Detections required within the window before a start fires
    #[serde(default = "default_debounce_threshold")]
    pub debounce_threshold: u32,
    /// Idle time without detections before a stop fires, e.g. "20s"
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    /// Delay between retry attempts, e.g. "2s"
    #[serde(default = "default_retry_delay")]
    pub retry_delay: String,
    /// Overall deadline for one keyed action, e.g. "60s"
    #[serde(default = "default_action_deadline")]
    pub deadline: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Base URL of the media server control API, e.g. "http://127.0.0.1:9092"
    pub url: String,
    pub secret: String,
    /// Root directory for recorded files on the media server
    pub record_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub client_id: String,
    /// Relay endpoint of the fleet server, e.g. "ws://fleet.example.com:8080/relay"
    pub server_url: String,
    #[serde(default = "default_device_type")]
    pub device_type: String,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_url: String,
    pub client_id: String,
    pub base_topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

fn default_response_timeout() -> String { "10s".to_string() }
fn default_outbox_capacity() -> usize { 100 }
fn default_debounce_window() -> String { "5s".to_string() }
fn default_debounce_threshold() -> u32 { 2 }
fn default_idle_timeout() -> String { "20s".to_string() }
fn default_max_retry() -> u32 { 5 }
fn default_retry_delay() -> String { "2s".to_string() }
fn default_action_deadline() -> String { "60s".to_string() }
fn default_device_type() -> String { "gateway".to_string() }
fn default_reconnect_interval() -> u64 { 5 }
fn default_keep_alive_secs() -> u64 { 30 }

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            response_timeout: default_response_timeout(),
            outbox_capacity: default_outbox_capacity(),
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            debounce_window: default_debounce_window(),
            debounce_threshold: default_debounce_threshold(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            max_retry: default_max_retry(),
            retry_delay: default_retry_delay(),
            deadline: default_action_deadline(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                cors_allow_origin: None,
            },
            relay: RelayConfig::default(),
            trigger: TriggerConfig::default(),
            action: ActionConfig::default(),
            media: MediaConfig {
                url: "http://127.0.0.1:9092".to_string(),
                secret: String::new(),
                record_path: None,
            },
            agent: None,
            mqtt: None,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::errors::FleetError::config(format!("Failed to parse '{}': {}", path, e)))?;
        info!("Loaded configuration from '{}'", path);
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        // Fail early on malformed durations rather than at first use
        self.relay.response_timeout()?;
        self.trigger.debounce_window()?;
        self.trigger.idle_timeout()?;
        self.action.retry_delay()?;
        self.action.deadline()?;
        if self.trigger.debounce_threshold == 0 {
            return Err(crate::errors::FleetError::config("trigger.debounce_threshold must be at least 1"));
        }
        Ok(())
    }
}

impl RelayConfig {
    pub fn response_timeout(&self) -> Result<Duration> {
        parse_duration(&self.response_timeout)
    }
}

impl TriggerConfig {
    pub fn debounce_window(&self) -> Result<Duration> {
        parse_duration(&self.debounce_window)
    }

    pub fn idle_timeout(&self) -> Result<Duration> {
        parse_duration(&self.idle_timeout)
    }
}

impl ActionConfig {
    pub fn retry_delay(&self) -> Result<Duration> {
        parse_duration(&self.retry_delay)
    }

    pub fn deadline(&self) -> Result<Duration> {
        parse_duration(&self.deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.relay.response_timeout().unwrap(), Duration::from_secs(10));
        assert_eq!(config.trigger.debounce_window().unwrap(), Duration::from_secs(5));
        assert_eq!(config.trigger.debounce_threshold, 2);
        assert_eq!(config.trigger.idle_timeout().unwrap(), Duration::from_secs(20));
        assert_eq!(config.action.max_retry, 5);
        assert_eq!(config.action.retry_delay().unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9000

            [media]
            url = "http://127.0.0.1:9092"
            secret = "s3cret"

            [trigger]
            idle_timeout = "45s"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.trigger.idle_timeout().unwrap(), Duration::from_secs(45));
        // Unspecified sections fall back to defaults
        assert_eq!(config.action.max_retry, 5);
        assert!(config.mqtt.is_none());
    }
}
