//! Gateway REST client
//!
//! Four operations against the Daydream gateway: create, update and delete
//! a stream, and the raw-SDP negotiation exchange. The egress playback URL
//! is multiplexed through a response header of the ingest SDP exchange
//! rather than the response body.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{AppError, Result};

/// Response header carrying the egress playback endpoint after ingest
/// negotiation.
pub const EGRESS_URL_HEADER: &str = "livepeer-egress-url";

/// Response header carrying the negotiated session resource URL.
pub const RESOURCE_URL_HEADER: &str = "livepeer-resource-url";

/// Gateway endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway API base URL
    pub api_url: String,
    /// Pipeline to run on the gateway
    pub pipeline: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.daydream.live".to_string(),
            pipeline: "streamdiffusion".to_string(),
        }
    }
}

/// Remote stream descriptor returned by the create call
#[derive(Debug, Clone, Deserialize)]
pub struct StreamInfo {
    /// Stream identifier
    pub id: String,
    /// WHIP ingest endpoint
    pub ingest_url: String,
    /// Playback identifier, when the gateway assigns one
    #[serde(default)]
    pub egress_playback_id: Option<String>,
}

/// Result of one SDP offer/answer exchange
#[derive(Debug, Clone)]
pub struct SdpExchange {
    /// Remote session description
    pub answer_sdp: String,
    /// Egress playback endpoint (ingest exchange only)
    pub egress_url: Option<String>,
    /// Session resource URL, when advertised
    pub resource_url: Option<String>,
}

/// Gateway operations, behind a trait so session logic is testable without
/// a live gateway.
#[async_trait]
pub trait GatewayApi: Send + Sync {
    async fn create_stream(&self, params: &Value) -> Result<StreamInfo>;
    async fn update_stream(&self, id: &str, params: &Value) -> Result<()>;
    async fn delete_stream(&self, id: &str) -> Result<()>;
    async fn exchange_sdp(&self, endpoint: &str, local_sdp: &str) -> Result<SdpExchange>;
}

/// HTTP client for the gateway REST surface
pub struct GatewayClient {
    client: reqwest::Client,
    config: GatewayConfig,
    api_key: String,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            api_key,
        }
    }

    fn streams_url(&self) -> String {
        format!("{}/v1/streams", self.config.api_url.trim_end_matches('/'))
    }

    fn body(&self, params: &Value) -> Value {
        json!({
            "pipeline": self.config.pipeline,
            "params": params,
        })
    }
}

#[async_trait]
impl GatewayApi for GatewayClient {
    async fn create_stream(&self, params: &Value) -> Result<StreamInfo> {
        let resp = self
            .client
            .post(self.streams_url())
            .bearer_auth(&self.api_key)
            .json(&self.body(params))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::Network(format!(
                "create stream returned {}: {}",
                status, text
            )));
        }

        let info: StreamInfo = resp.json().await?;
        debug!("Created stream {} (ingest: {})", info.id, info.ingest_url);
        Ok(info)
    }

    async fn update_stream(&self, id: &str, params: &Value) -> Result<()> {
        let resp = self
            .client
            .patch(format!("{}/{}", self.streams_url(), id))
            .bearer_auth(&self.api_key)
            .json(&self.body(params))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AppError::Network(format!(
                "update stream {} returned {}",
                id, status
            )));
        }
        Ok(())
    }

    async fn delete_stream(&self, id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(format!("{}/{}", self.streams_url(), id))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AppError::Network(format!(
                "delete stream {} returned {}",
                id, status
            )));
        }
        Ok(())
    }

    async fn exchange_sdp(&self, endpoint: &str, local_sdp: &str) -> Result<SdpExchange> {
        let resp = self
            .client
            .post(endpoint)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/sdp")
            .body(local_sdp.to_string())
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::Network(format!(
                "SDP exchange at {} returned {}: {}",
                endpoint, status, text
            )));
        }

        let header_value = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        };
        let egress_url = header_value(EGRESS_URL_HEADER);
        let resource_url = header_value(RESOURCE_URL_HEADER);

        let answer_sdp = resp.text().await?;
        if answer_sdp.trim().is_empty() {
            return Err(AppError::Protocol(
                "SDP exchange returned an empty answer".to_string(),
            ));
        }

        debug!(
            "SDP exchange ok (egress header: {})",
            egress_url.as_deref().unwrap_or("-")
        );

        Ok(SdpExchange {
            answer_sdp,
            egress_url,
            resource_url,
        })
    }
}
