use async_trait::async_trait;
use tracing::info;

use crate::errors::Result;

/// Destination the camera should push its stream to.
#[derive(Debug, Clone)]
pub struct PushTarget {
    pub stream_id: String,
    pub media_ip: String,
    pub rtp_port: u16,
    /// 0 = udp, 1 = tcp
    pub mode: u8,
}

/// SIP signaling toward cameras. Success or failure of the underlying
/// signaling dialog is opaque to the fleet core beyond error/no-error.
#[async_trait]
pub trait CameraSignaling: Send + Sync {
    /// Instruct a camera channel to begin pushing its stream.
    async fn request_stream_push(&self, channel_id: &str, target: &PushTarget) -> Result<()>;
    /// Instruct a camera to stop a previously requested stream.
    async fn stop_stream(&self, stream_id: &str) -> Result<()>;
    /// Pan/tilt/zoom control for a camera.
    async fn device_control(&self, device_id: &str, left_right: i8, up_down: i8, in_out: i8, move_speed: u8) -> Result<()>;
}

/// Placeholder wired in where no SIP stack is deployed; logs and succeeds so
/// the relay paths stay exercisable end to end.
pub struct NullSignaling;

#[async_trait]
impl CameraSignaling for NullSignaling {
    async fn request_stream_push(&self, channel_id: &str, target: &PushTarget) -> Result<()> {
        info!(
            "Signaling stream push for channel '{}': stream '{}' to {}:{} (mode {})",
            channel_id, target.stream_id, target.media_ip, target.rtp_port, target.mode
        );
        Ok(())
    }

    async fn stop_stream(&self, stream_id: &str) -> Result<()> {
        info!("Signaling stream stop for '{}'", stream_id);
        Ok(())
    }

    async fn device_control(&self, device_id: &str, left_right: i8, up_down: i8, in_out: i8, move_speed: u8) -> Result<()> {
        info!(
            "Signaling PTZ for device '{}' (lr={} ud={} io={} speed={})",
            device_id, left_right, up_down, in_out, move_speed
        );
        Ok(())
    }
}
