//! WebRTC session configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// WebRTC configuration shared by the ingest and egress sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    /// STUN server URLs; at least two independent servers for redundancy
    pub stun_servers: Vec<String>,
    /// Video codec preference
    pub video_codec: VideoCodec,
    /// Maximum outbound bitrate in kbps, applied once ingest connects
    pub max_bitrate_kbps: u32,
    /// Maximum outbound frame rate; lower than typical capture rates since
    /// the inference pipeline gains nothing from more
    pub max_framerate: u32,
    /// Egress negotiation attempts before giving up
    pub egress_retry_limit: u32,
    /// Fixed delay between egress attempts, in milliseconds
    pub egress_retry_delay_ms: u64,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun.cloudflare.com:3478".to_string(),
            ],
            video_codec: VideoCodec::H264,
            max_bitrate_kbps: 2000,
            max_framerate: 30,
            egress_retry_limit: 3,
            egress_retry_delay_ms: 2000,
        }
    }
}

impl WebRtcConfig {
    pub fn egress_retry_delay(&self) -> Duration {
        Duration::from_millis(self.egress_retry_delay_ms)
    }
}

/// Video codec preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    VP8,
    VP9,
}

impl VideoCodec {
    /// Codec name as it appears in an SDP rtpmap line.
    pub fn rtpmap_name(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "H264",
            VideoCodec::VP8 => "VP8",
            VideoCodec::VP9 => "VP9",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "video/H264",
            VideoCodec::VP8 => "video/VP8",
            VideoCodec::VP9 => "video/VP9",
        }
    }

    pub fn sdp_fmtp(&self) -> &'static str {
        match self {
            VideoCodec::H264 => {
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            }
            VideoCodec::VP8 => "",
            VideoCodec::VP9 => "profile-id=0",
        }
    }
}

impl Default for VideoCodec {
    fn default() -> Self {
        Self::H264
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoCodec::H264 => write!(f, "H.264"),
            VideoCodec::VP8 => write!(f, "VP8"),
            VideoCodec::VP9 => write!(f, "VP9"),
        }
    }
}
