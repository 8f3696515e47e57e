//! WHIP-style ingest session
//!
//! Owns the outbound peer connection: sendonly video fed from the local
//! source plus a sendonly placeholder audio track (the gateway's
//! negotiation requires matching media line counts even when no audio is
//! produced). Negotiation is strictly sequential: offer, codec-preference
//! rewrite, local description, one bounded settling tick for synchronously
//! gathered candidates, HTTP exchange, remote description.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::config::{VideoCodec, WebRtcConfig};
use super::peer::{build_peer, watch_link_state};
use super::source::{EncoderLimits, TrackFeeder, VideoSource};
use super::LinkState;
use crate::error::{AppError, Result};
use crate::gateway::GatewayApi;
use crate::sdp;

/// Single scheduling tick allowed for synchronously gathered candidates to
/// attach to the local description. The answer supplies the remote side's
/// candidates, so full gathering is never awaited.
const CANDIDATE_SETTLE_TICK: Duration = Duration::from_millis(50);

const STREAM_ID: &str = "daydream";

/// Outbound media session towards the gateway
pub struct IngestSession {
    pc: Arc<RTCPeerConnection>,
    feeder: TrackFeeder,
    state_rx: watch::Receiver<LinkState>,
    egress_url: Option<String>,
    resource_url: Option<String>,
}

impl IngestSession {
    /// Negotiate the outbound connection against `ingest_url`.
    ///
    /// Returns once the answer is applied; connectivity is reported
    /// asynchronously through [`IngestSession::state_watch`].
    pub async fn connect(
        config: &WebRtcConfig,
        gateway: Arc<dyn GatewayApi>,
        ingest_url: &str,
        source: Arc<VideoSource>,
    ) -> Result<Self> {
        let pc = build_peer(config).await?;
        Self::connect_with_peer(pc, config, gateway, ingest_url, source).await
    }

    pub(crate) async fn connect_with_peer(
        pc: Arc<RTCPeerConnection>,
        config: &WebRtcConfig,
        gateway: Arc<dyn GatewayApi>,
        ingest_url: &str,
        source: Arc<VideoSource>,
    ) -> Result<Self> {
        match Self::negotiate(Arc::clone(&pc), config, gateway, ingest_url, source).await {
            Ok(session) => Ok(session),
            Err(e) => {
                // Full teardown: a reconnecting caller must never have the
                // failed attempt's ICE agent still alive.
                if let Err(close_err) = pc.close().await {
                    warn!("Failed to close ingest peer after attempt: {}", close_err);
                }
                Err(e)
            }
        }
    }

    async fn negotiate(
        pc: Arc<RTCPeerConnection>,
        config: &WebRtcConfig,
        gateway: Arc<dyn GatewayApi>,
        ingest_url: &str,
        source: Arc<VideoSource>,
    ) -> Result<Self> {
        let state_rx = watch_link_state(&pc, "Ingest");

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: config.video_codec.mime_type().to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: config.video_codec.sdp_fmtp().to_string(),
                rtcp_feedback: vec![],
            },
            "video0".to_string(),
            STREAM_ID.to_string(),
        ));

        // Placeholder audio: negotiated, never fed.
        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            "audio0".to_string(),
            STREAM_ID.to_string(),
        ));

        let sendonly = || RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Sendonly,
            send_encodings: vec![],
        };
        let video_transceiver = pc
            .add_transceiver_from_track(video_track.clone(), Some(sendonly()))
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to add video track: {}", e)))?;
        pc.add_transceiver_from_track(audio_track, Some(sendonly()))
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to add audio track: {}", e)))?;

        // Local-engine hint; the textual rewrite below is what the remote
        // side actually sees.
        if let Err(e) = video_transceiver
            .set_codec_preferences(codec_preferences(config.video_codec))
            .await
        {
            debug!("Codec preference hint not applied: {}", e);
        }

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to create offer: {}", e)))?;

        let rewritten = sdp::prefer_codec(&offer.sdp, config.video_codec.rtpmap_name());
        let local = RTCSessionDescription::offer(rewritten)
            .map_err(|e| AppError::Negotiation(format!("Invalid rewritten offer: {}", e)))?;
        pc.set_local_description(local)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to set local description: {}", e)))?;

        tokio::time::sleep(CANDIDATE_SETTLE_TICK).await;

        let local_sdp = pc
            .local_description()
            .await
            .ok_or_else(|| AppError::Negotiation("local description missing".to_string()))?
            .sdp;

        let exchange = gateway.exchange_sdp(ingest_url, &local_sdp).await?;

        let answer = RTCSessionDescription::answer(exchange.answer_sdp)
            .map_err(|e| AppError::Negotiation(format!("Invalid SDP answer: {}", e)))?;
        pc.set_remote_description(answer)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to set remote description: {}", e)))?;

        info!("Ingest negotiation complete");

        let feeder = TrackFeeder::spawn(video_track, source.subscribe(), source.limits());
        apply_limits_on_connect(state_rx.clone(), source, config);

        Ok(Self {
            pc,
            feeder,
            state_rx,
            egress_url: exchange.egress_url,
            resource_url: exchange.resource_url,
        })
    }

    /// Egress playback endpoint surfaced by the negotiation exchange.
    pub fn egress_url(&self) -> Option<&str> {
        self.egress_url.as_deref()
    }

    /// Session resource URL, when the gateway advertised one.
    pub fn resource_url(&self) -> Option<&str> {
        self.resource_url.as_deref()
    }

    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    /// Release the peer connection and the track feeder.
    pub async fn close(&self) {
        self.feeder.stop();
        if let Err(e) = self.pc.close().await {
            warn!("Failed to close ingest peer connection: {}", e);
        }
    }
}

/// Constrain the outbound encoding once the link is up. Bandwidth is the
/// binding constraint downstream, not source fidelity.
fn apply_limits_on_connect(
    mut state_rx: watch::Receiver<LinkState>,
    source: Arc<VideoSource>,
    config: &WebRtcConfig,
) {
    let limits = EncoderLimits {
        max_bitrate_kbps: Some(config.max_bitrate_kbps),
        max_framerate: Some(config.max_framerate),
    };
    tokio::spawn(async move {
        loop {
            match *state_rx.borrow_and_update() {
                LinkState::Connected => {
                    source.set_limits(limits);
                    break;
                }
                LinkState::Failed | LinkState::Closed => break,
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                break;
            }
        }
    });
}

fn codec_preferences(codec: VideoCodec) -> Vec<RTCRtpCodecParameters> {
    vec![RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: codec.mime_type().to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: codec.sdp_fmtp().to_string(),
            rtcp_feedback: vec![],
        },
        ..Default::default()
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

    use crate::gateway::{SdpExchange, StreamInfo};

    struct RejectingGateway;

    #[async_trait]
    impl GatewayApi for RejectingGateway {
        async fn create_stream(&self, _params: &Value) -> Result<StreamInfo> {
            unreachable!("only SDP exchange is exercised here")
        }

        async fn update_stream(&self, _id: &str, _params: &Value) -> Result<()> {
            unreachable!("only SDP exchange is exercised here")
        }

        async fn delete_stream(&self, _id: &str) -> Result<()> {
            unreachable!("only SDP exchange is exercised here")
        }

        async fn exchange_sdp(&self, _endpoint: &str, _sdp: &str) -> Result<SdpExchange> {
            Err(AppError::Network("exchange refused".to_string()))
        }
    }

    #[tokio::test]
    async fn failed_exchange_closes_the_peer() {
        let config = WebRtcConfig::default();
        let pc = build_peer(&config).await.unwrap();
        let observed = Arc::clone(&pc);
        let source = Arc::new(VideoSource::new());

        let result = IngestSession::connect_with_peer(
            pc,
            &config,
            Arc::new(RejectingGateway),
            "http://127.0.0.1:1/ingest",
            source,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(observed.connection_state(), RTCPeerConnectionState::Closed);
    }
}
