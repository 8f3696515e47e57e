//! WHEP-style egress session
//!
//! Receive-only counterpart of ingest: no local tracks, recvonly video and
//! audio transceivers. Negotiation failures shortly after stream creation
//! are transient, so attempts are retried a fixed number of times with a
//! fixed delay; each failed attempt tears its peer connection down fully
//! before the next one starts. Exhaustion is reported exactly once.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;

use super::config::WebRtcConfig;
use super::peer::{build_peer, watch_link_state};
use super::LinkState;
use crate::error::{AppError, Result};
use crate::gateway::GatewayApi;

const CANDIDATE_SETTLE_TICK: Duration = Duration::from_millis(50);

/// Inbound media session from the gateway
pub struct EgressSession {
    pc: Arc<RTCPeerConnection>,
    state_rx: watch::Receiver<LinkState>,
    track_tx: broadcast::Sender<Arc<TrackRemote>>,
    last_track: Arc<RwLock<Option<Arc<TrackRemote>>>>,
}

impl EgressSession {
    /// Negotiate the inbound connection, retrying up to the configured
    /// ceiling with a fixed inter-attempt delay.
    pub async fn connect(
        config: &WebRtcConfig,
        gateway: Arc<dyn GatewayApi>,
        egress_url: &str,
    ) -> Result<Self> {
        retry_fixed(
            config.egress_retry_limit,
            config.egress_retry_delay(),
            |attempt| {
                let gateway = gateway.clone();
                async move {
                    info!("Egress negotiation attempt {}", attempt);
                    Self::attempt(config, gateway, egress_url).await
                }
            },
        )
        .await
    }

    async fn attempt(
        config: &WebRtcConfig,
        gateway: Arc<dyn GatewayApi>,
        egress_url: &str,
    ) -> Result<Self> {
        let pc = build_peer(config).await?;
        match Self::negotiate(&pc, gateway, egress_url).await {
            Ok((state_rx, track_tx, last_track)) => Ok(Self {
                pc,
                state_rx,
                track_tx,
                last_track,
            }),
            Err(e) => {
                // Full teardown before the caller schedules the next attempt.
                if let Err(close_err) = pc.close().await {
                    warn!("Failed to close egress peer after attempt: {}", close_err);
                }
                Err(e)
            }
        }
    }

    async fn negotiate(
        pc: &Arc<RTCPeerConnection>,
        gateway: Arc<dyn GatewayApi>,
        egress_url: &str,
    ) -> Result<(
        watch::Receiver<LinkState>,
        broadcast::Sender<Arc<TrackRemote>>,
        Arc<RwLock<Option<Arc<TrackRemote>>>>,
    )> {
        let state_rx = watch_link_state(pc, "Egress");

        let (track_tx, _) = broadcast::channel(4);
        let last_track: Arc<RwLock<Option<Arc<TrackRemote>>>> = Arc::new(RwLock::new(None));

        // Fires once per track binding, not per frame.
        let on_track_tx = track_tx.clone();
        let on_track_last = last_track.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let mime = track.codec().capability.mime_type.clone();
            info!("Egress track bound: {}", mime);
            if mime.to_ascii_lowercase().starts_with("video") {
                *on_track_last.write() = Some(track.clone());
                let _ = on_track_tx.send(track);
            }
            Box::pin(async {})
        }));

        let recvonly = || RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        };
        pc.add_transceiver_from_kind(RTPCodecType::Video, Some(recvonly()))
            .await
            .map_err(|e| {
                AppError::Negotiation(format!("Failed to add video transceiver: {}", e))
            })?;
        pc.add_transceiver_from_kind(RTPCodecType::Audio, Some(recvonly()))
            .await
            .map_err(|e| {
                AppError::Negotiation(format!("Failed to add audio transceiver: {}", e))
            })?;

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to create offer: {}", e)))?;
        pc.set_local_description(offer)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to set local description: {}", e)))?;

        tokio::time::sleep(CANDIDATE_SETTLE_TICK).await;

        let local_sdp = pc
            .local_description()
            .await
            .ok_or_else(|| AppError::Negotiation("local description missing".to_string()))?
            .sdp;

        let exchange = gateway.exchange_sdp(egress_url, &local_sdp).await?;

        let answer = RTCSessionDescription::answer(exchange.answer_sdp)
            .map_err(|e| AppError::Negotiation(format!("Invalid SDP answer: {}", e)))?;
        pc.set_remote_description(answer)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to set remote description: {}", e)))?;

        info!("Egress negotiation complete");
        Ok((state_rx, track_tx, last_track))
    }

    /// Subscribe to new video track bindings.
    pub fn track_events(&self) -> broadcast::Receiver<Arc<TrackRemote>> {
        self.track_tx.subscribe()
    }

    /// Most recent video track, for subscribers that attach late.
    pub fn last_track(&self) -> Option<Arc<TrackRemote>> {
        self.last_track.read().clone()
    }

    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    pub async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("Failed to close egress peer connection: {}", e);
        }
    }
}

/// Run `attempt` up to `limit` times with a fixed delay between failures.
/// The last error is returned once the ceiling is exhausted.
pub(crate) async fn retry_fixed<T, F, Fut>(limit: u32, delay: Duration, mut attempt: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let limit = limit.max(1);
    let mut last_err = None;
    for n in 1..=limit {
        match attempt(n).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!("Attempt {}/{} failed: {}", n, limit, e);
                last_err = Some(e);
                if n < limit {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| AppError::Negotiation("no attempts were made".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn exhausting_the_ceiling_fails_once_after_exact_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_fixed(3, Duration::from_secs(2), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::Negotiation("refused".to_string())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_retrying_after_success() {
        let calls = AtomicU32::new(0);
        let result = retry_fixed(5, Duration::from_secs(2), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(AppError::Negotiation("refused".to_string()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_between_attempts_is_fixed() {
        let start = tokio::time::Instant::now();
        let _: Result<()> = retry_fixed(3, Duration::from_secs(2), |_| async {
            Err(AppError::Negotiation("refused".to_string()))
        })
        .await;
        // Two inter-attempt delays for three attempts.
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn zero_limit_still_attempts_once() {
        let calls = AtomicU32::new(0);
        let result = retry_fixed(0, Duration::from_millis(1), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
