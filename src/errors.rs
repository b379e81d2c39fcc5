use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Client '{client_id}' is not connected")]
    NotConnected { client_id: String },

    #[error("Timed out waiting for response to message '{msg_id}'")]
    Timeout { msg_id: String },

    #[error("Action for key '{key}' is already in progress")]
    AlreadyInProgress { key: String },

    #[error("Action for key '{key}' failed after {attempts} attempts")]
    RetriesExhausted { key: String, attempts: u32 },

    #[error("Action for key '{key}' was cancelled")]
    Cancelled { key: String },

    #[error("Protocol violation: {message}")]
    Protocol { message: String },

    #[error("Media server error: {message}")]
    Media { message: String },

    #[error("Stream worker error: {message}")]
    Worker { message: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("URL parse error: {source}")]
    UrlParse {
        #[from]
        source: url::ParseError,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("HTTP request error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    #[error("MQTT client error: {source}")]
    MqttClient {
        #[from]
        source: rumqttc::ClientError,
    },
}

impl FleetError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn not_connected(client_id: impl Into<String>) -> Self {
        Self::NotConnected { client_id: client_id.into() }
    }

    pub fn timeout(msg_id: impl Into<String>) -> Self {
        Self::Timeout { msg_id: msg_id.into() }
    }

    pub fn already_in_progress(key: impl Into<String>) -> Self {
        Self::AlreadyInProgress { key: key.into() }
    }

    pub fn retries_exhausted(key: impl Into<String>, attempts: u32) -> Self {
        Self::RetriesExhausted { key: key.into(), attempts }
    }

    pub fn cancelled(key: impl Into<String>) -> Self {
        Self::Cancelled { key: key.into() }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { message: message.into() }
    }

    pub fn media(message: impl Into<String>) -> Self {
        Self::Media { message: message.into() }
    }

    pub fn worker(message: impl Into<String>) -> Self {
        Self::Worker { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
