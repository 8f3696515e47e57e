//! Media link construction seam
//!
//! The orchestrator drives ingest/egress through these traits so its state
//! machine can be exercised against fakes; [`RtcConnector`] is the
//! production implementation over the WebRTC sessions.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;
use crate::gateway::GatewayApi;
use crate::webrtc::{EgressSession, IngestSession, LinkState, VideoSource, WebRtcConfig};

/// Outbound link handle as seen by the orchestrator
#[async_trait]
pub trait IngestLink: Send + Sync {
    /// Egress endpoint surfaced by the negotiation exchange, when present.
    fn egress_url(&self) -> Option<String>;
    fn state_watch(&self) -> watch::Receiver<LinkState>;
    async fn close(&self);
}

/// Inbound link handle as seen by the orchestrator
#[async_trait]
pub trait EgressLink: Send + Sync {
    fn state_watch(&self) -> watch::Receiver<LinkState>;
    async fn close(&self);
}

/// Creates ingest and egress links
#[async_trait]
pub trait MediaConnector: Send + Sync {
    async fn connect_ingest(&self, ingest_url: &str) -> Result<Box<dyn IngestLink>>;
    async fn connect_egress(&self, egress_url: &str) -> Result<Box<dyn EgressLink>>;
}

#[async_trait]
impl IngestLink for IngestSession {
    fn egress_url(&self) -> Option<String> {
        IngestSession::egress_url(self).map(|s| s.to_string())
    }

    fn state_watch(&self) -> watch::Receiver<LinkState> {
        IngestSession::state_watch(self)
    }

    async fn close(&self) {
        IngestSession::close(self).await
    }
}

#[async_trait]
impl EgressLink for EgressSession {
    fn state_watch(&self) -> watch::Receiver<LinkState> {
        EgressSession::state_watch(self)
    }

    async fn close(&self) {
        EgressSession::close(self).await
    }
}

/// Production connector over the WebRTC sessions
pub struct RtcConnector {
    config: WebRtcConfig,
    gateway: Arc<dyn GatewayApi>,
    source: Arc<VideoSource>,
}

impl RtcConnector {
    pub fn new(config: WebRtcConfig, gateway: Arc<dyn GatewayApi>, source: Arc<VideoSource>) -> Self {
        Self {
            config,
            gateway,
            source,
        }
    }
}

#[async_trait]
impl MediaConnector for RtcConnector {
    async fn connect_ingest(&self, ingest_url: &str) -> Result<Box<dyn IngestLink>> {
        let session = IngestSession::connect(
            &self.config,
            self.gateway.clone(),
            ingest_url,
            self.source.clone(),
        )
        .await?;
        Ok(Box::new(session))
    }

    async fn connect_egress(&self, egress_url: &str) -> Result<Box<dyn EgressLink>> {
        let session =
            EgressSession::connect(&self.config, self.gateway.clone(), egress_url).await?;
        Ok(Box::new(session))
    }
}
