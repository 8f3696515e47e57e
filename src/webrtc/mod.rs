//! WebRTC ingest and egress sessions
//!
//! Two fully independent peer connections: a WHIP-style outbound session
//! carrying the local source to the gateway, and a WHEP-style inbound
//! session carrying the transformed result back.

pub mod config;
pub mod egress;
pub mod ingest;
pub(crate) mod peer;
pub mod source;

pub use config::{VideoCodec, WebRtcConfig};
pub use egress::EgressSession;
pub use ingest::IngestSession;
pub use source::{EncoderLimits, VideoSample, VideoSource};

/// Connection state of one peer connection, as surfaced to the
/// orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::New => write!(f, "new"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Failed => write!(f, "failed"),
            LinkState::Closed => write!(f, "closed"),
        }
    }
}
