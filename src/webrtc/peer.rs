//! Peer connection construction shared by ingest and egress

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

use super::config::WebRtcConfig;
use super::LinkState;
use crate::error::{AppError, Result};

/// Build a peer connection with the configured STUN servers.
pub(crate) async fn build_peer(config: &WebRtcConfig) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| AppError::Negotiation(format!("Failed to register codecs: {}", e)))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| AppError::Negotiation(format!("Failed to register interceptors: {}", e)))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    // One RTCIceServer per STUN URL keeps the servers independent.
    let ice_servers = config
        .stun_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .collect();

    let rtc_config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };

    let pc = api
        .new_peer_connection(rtc_config)
        .await
        .map_err(|e| AppError::Negotiation(format!("Failed to create peer connection: {}", e)))?;

    Ok(Arc::new(pc))
}

/// Surface peer connectivity transitions as a watch channel.
///
/// Connected/Failed can arrive arbitrarily long after negotiation returns,
/// so sessions expose them as events rather than return values.
pub(crate) fn watch_link_state(
    pc: &RTCPeerConnection,
    label: &'static str,
) -> watch::Receiver<LinkState> {
    let (state_tx, state_rx) = watch::channel(LinkState::New);

    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let new_state = match s {
            RTCPeerConnectionState::New => Some(LinkState::New),
            RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
            RTCPeerConnectionState::Connected => Some(LinkState::Connected),
            RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
            RTCPeerConnectionState::Failed => Some(LinkState::Failed),
            RTCPeerConnectionState::Closed => Some(LinkState::Closed),
            _ => None,
        };
        if let Some(state) = new_state {
            info!("{} connection state: {}", label, state);
            let _ = state_tx.send(state);
        }
        Box::pin(async {})
    }));

    state_rx
}
