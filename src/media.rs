use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error};

use crate::config::MediaConfig;
use crate::errors::{FleetError, Result};

const DEFAULT_RECORD_SEGMENT_SECS: u32 = 1800;

/// HTTP client for the media server's control API. All endpoints are
/// idempotent and keyed by stream ID; responses carry a `code` field where
/// zero means success.
#[derive(Clone)]
pub struct MediaClient {
    base_url: String,
    secret: String,
    record_path: Option<String>,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CodeResponse {
    code: i32,
}

#[derive(Debug, Deserialize)]
struct RecordResponse {
    code: i32,
    #[serde(default)]
    result: bool,
}

#[derive(Debug, Deserialize)]
struct RecordStatusResponse {
    code: i32,
    #[serde(default)]
    status: bool,
}

#[derive(Debug, Deserialize)]
struct MediaListResponse {
    code: i32,
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OpenRtpResponse {
    code: i32,
    #[serde(default)]
    port: u16,
}

#[derive(Debug, Deserialize)]
struct CloseRtpResponse {
    code: i32,
    #[serde(default)]
    hit: i32,
}

impl MediaClient {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            secret: config.secret.clone(),
            record_path: config.record_path.clone(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    /// Is the media server currently recording this stream?
    pub async fn is_recording(&self, stream_id: &str) -> Result<bool> {
        let url = format!(
            "{}/index/api/isRecording?type=1&app=rtp&vhost=__defaultVhost__&secret={}&stream={}",
            self.base_url, self.secret, stream_id
        );
        let resp: RecordStatusResponse = self.get_json(&url).await?;
        if resp.code != 0 {
            return Err(FleetError::media(format!(
                "isRecording for '{}' returned code {}", stream_id, resp.code
            )));
        }
        Ok(resp.status)
    }

    /// Start an MP4 recording for a stream. `class_name` selects the
    /// subdirectory recorded files land in.
    pub async fn start_recording(&self, stream_id: &str, class_name: &str) -> Result<bool> {
        let root = self.record_path.as_deref().unwrap_or("/userdata/fleet_recordings");
        let customized_path = format!("{}/{}", root, if class_name.is_empty() { "default" } else { class_name });
        let url = format!(
            "{}/index/api/startRecord?type=1&app=rtp&vhost=__defaultVhost__&secret={}&stream={}&customized_path={}&max_second={}",
            self.base_url, self.secret, stream_id, customized_path, DEFAULT_RECORD_SEGMENT_SECS
        );
        let resp: RecordResponse = self.get_json(&url).await?;
        debug!("startRecord for '{}' returned code {} result {}", stream_id, resp.code, resp.result);
        Ok(resp.code == 0 && resp.result)
    }

    /// Stop the MP4 recording for a stream.
    pub async fn stop_recording(&self, stream_id: &str) -> Result<bool> {
        let url = format!(
            "{}/index/api/stopRecord?type=1&app=rtp&vhost=__defaultVhost__&secret={}&stream={}",
            self.base_url, self.secret, stream_id
        );
        let resp: RecordResponse = self.get_json(&url).await?;
        debug!("stopRecord for '{}' returned code {} result {}", stream_id, resp.code, resp.result);
        Ok(resp.code == 0 && resp.result)
    }

    /// Does the stream currently exist on the media server?
    pub async fn media_exists(&self, stream_id: &str) -> Result<bool> {
        let url = format!(
            "{}/index/api/getMediaList?secret={}&schema=rtsp&vhost=__defaultVhost__&app=rtp&stream={}",
            self.base_url, self.secret, stream_id
        );
        let resp: MediaListResponse = self.get_json(&url).await?;
        Ok(resp.code == 0 && !resp.data.is_empty())
    }

    /// Stop an outbound RTP push for a stream.
    pub async fn stop_stream_push(&self, stream_id: &str, ssrc: &str) -> Result<bool> {
        let url = format!(
            "{}/index/api/stopSendRtp?secret={}&vhost=__defaultVhost__&app=rtp&stream={}&ssrc={}",
            self.base_url, self.secret, stream_id, ssrc
        );
        let resp: CodeResponse = self.get_json(&url).await?;
        Ok(resp.code == 0)
    }

    /// Open an RTP receive port for a stream and return it.
    pub async fn open_rtp_server(&self, stream_id: &str, tcp_mode: u8) -> Result<u16> {
        let url = format!(
            "{}/index/api/openRtpServer?secret={}&port=0&tcp_mode={}&stream_id={}",
            self.base_url, self.secret, tcp_mode, stream_id
        );
        let resp: OpenRtpResponse = self.get_json(&url).await?;
        if resp.code != 0 || resp.port == 0 {
            return Err(FleetError::media(format!(
                "openRtpServer for '{}' returned code {} port {}", stream_id, resp.code, resp.port
            )));
        }
        Ok(resp.port)
    }

    /// Close the RTP receive port opened for a stream.
    pub async fn close_rtp_server(&self, stream_id: &str) -> Result<bool> {
        let url = format!(
            "{}/index/api/closeRtpServer?secret={}&stream_id={}",
            self.base_url, self.secret, stream_id
        );
        let resp: CloseRtpResponse = self.get_json(&url).await?;
        Ok(resp.code == 0 && resp.hit >= 1)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T> {
        let response = self.http.get(url).send().await.map_err(|e| {
            error!("Media server request failed: {}", e);
            FleetError::media(format!("request failed: {}", e))
        })?;
        let body = response.json::<T>().await.map_err(|e| {
            error!("Media server response decode failed: {}", e);
            FleetError::media(format!("response decode failed: {}", e))
        })?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = MediaClient::new(&MediaConfig {
            url: "http://127.0.0.1:9092/".to_string(),
            secret: "s".to_string(),
            record_path: None,
        });
        assert_eq!(client.base_url, "http://127.0.0.1:9092");
    }

    #[test]
    fn test_record_status_decode() {
        let resp: RecordStatusResponse =
            serde_json::from_str(r#"{"code":0,"status":true}"#).unwrap();
        assert_eq!(resp.code, 0);
        assert!(resp.status);

        // Missing fields default rather than fail
        let resp: RecordStatusResponse = serde_json::from_str(r#"{"code":-500}"#).unwrap();
        assert!(!resp.status);
    }

    #[test]
    fn test_media_list_decode() {
        let resp: MediaListResponse =
            serde_json::from_str(r#"{"code":0,"data":[{"stream":"IPC001_0"}]}"#).unwrap();
        assert!(!resp.data.is_empty());
    }
}
