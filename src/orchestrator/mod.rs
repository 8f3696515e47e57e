//! Session orchestration
//!
//! Drives the full session lifecycle: create the remote stream, bring up
//! ingest, wait a settling interval for the inference pipeline, bring up
//! egress from the URL that ingest negotiation surfaced, then supervise.
//! While streaming, an ingest drop runs a bounded exponential-backoff
//! reconnect loop that tears down and recreates the ingest link per
//! attempt; a fixed-interval sync loop re-encodes the generation
//! parameters and pushes them when the bytes changed.

mod connector;

pub use connector::{EgressLink, IngestLink, MediaConnector, RtcConnector};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::gateway::{GatewayApi, StreamInfo};
use crate::params::GenerationParams;
use crate::webrtc::LinkState;

/// Externally observable session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Creating,
    Connecting,
    Streaming,
    Reconnecting,
    /// Terminal for this session; carries a human-readable reason.
    Error(String),
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Creating => write!(f, "creating"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Streaming => write!(f, "streaming"),
            SessionState::Reconnecting => write!(f, "reconnecting"),
            SessionState::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// Session lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// Egress dropped after streaming began. There is no egress reconnect
    /// loop; the host decides how to react.
    EgressDown,
}

/// Orchestrator timing and retry policy
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Settling interval between ingest connect and egress start, in ms
    pub settle_delay_ms: u64,
    /// Parameter sync tick interval, in ms
    pub sync_interval_ms: u64,
    /// Ingest reconnect attempts before giving up
    pub reconnect_limit: u32,
    /// First reconnect delay, in ms; doubles per attempt
    pub reconnect_initial_delay_ms: u64,
    /// How long a link may take to report connected, in ms
    pub connect_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 2000,
            sync_interval_ms: 1000,
            reconnect_limit: 5,
            reconnect_initial_delay_ms: 1000,
            connect_timeout_ms: 30_000,
        }
    }
}

impl OrchestratorConfig {
    fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    fn reconnect_initial_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_delay_ms)
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Owns one remote stream and its ingest/egress links
pub struct Orchestrator {
    gateway: Arc<dyn GatewayApi>,
    connector: Arc<dyn MediaConnector>,
    /// Mutated by the host's configuration surface at any time; every sync
    /// tick reads it fresh.
    params: Arc<RwLock<GenerationParams>>,
    config: OrchestratorConfig,
    state_tx: watch::Sender<SessionState>,
    events_tx: broadcast::Sender<SessionEvent>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        gateway: Arc<dyn GatewayApi>,
        connector: Arc<dyn MediaConnector>,
        params: Arc<RwLock<GenerationParams>>,
        config: OrchestratorConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (events_tx, _) = broadcast::channel(64);
        Self {
            gateway,
            connector,
            params,
            config,
            state_tx,
            events_tx,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Request teardown; `run` finishes shortly after.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    /// Drive the session to completion: until shutdown or a fatal error.
    pub async fn run(&self) {
        if let Err(reason) = self.drive().await {
            warn!("Session failed: {}", reason);
            self.set_state(SessionState::Error(reason));
        }
    }

    async fn drive(&self) -> std::result::Result<(), String> {
        self.set_state(SessionState::Creating);

        let initial = self.params.read().to_value();
        let mut baseline = initial.to_string();

        let stream = self
            .gateway
            .create_stream(&initial)
            .await
            .map_err(|e| format!("stream creation failed: {}", e))?;
        info!("Stream {} created", stream.id);

        self.set_state(SessionState::Connecting);

        // First connect is not retried; only a mid-stream drop is.
        let ingest = match self.bring_up_ingest(&stream).await {
            Ok(link) => link,
            Err(e) => {
                self.delete_stream(&stream.id).await;
                return Err(format!("ingest connect failed: {}", e));
            }
        };

        // Give the inference pipeline time to initialize before pulling.
        tokio::time::sleep(self.config.settle_delay()).await;

        let egress_url = match ingest.egress_url() {
            Some(url) => url,
            None => {
                ingest.close().await;
                self.delete_stream(&stream.id).await;
                return Err(AppError::Protocol(
                    "ingest negotiation returned no egress URL".to_string(),
                )
                .to_string());
            }
        };

        let egress = match self.bring_up_egress(&egress_url).await {
            Ok(link) => link,
            Err(e) => {
                ingest.close().await;
                self.delete_stream(&stream.id).await;
                return Err(format!("egress connect failed: {}", e));
            }
        };

        self.set_state(SessionState::Streaming);

        let result = self.supervise(&stream, ingest, egress, &mut baseline).await;
        self.delete_stream(&stream.id).await;
        match result {
            Ok(()) => {
                self.set_state(SessionState::Idle);
                Ok(())
            }
            Err(reason) => Err(reason),
        }
    }

    async fn bring_up_ingest(&self, stream: &StreamInfo) -> Result<Box<dyn IngestLink>> {
        let link = self.connector.connect_ingest(&stream.ingest_url).await?;
        let mut state_rx = link.state_watch();
        if let Err(e) = self
            .await_connected(&mut state_rx, "ingest")
            .await
        {
            link.close().await;
            return Err(e);
        }
        Ok(link)
    }

    async fn bring_up_egress(&self, egress_url: &str) -> Result<Box<dyn EgressLink>> {
        let link = self.connector.connect_egress(egress_url).await?;
        let mut state_rx = link.state_watch();
        if let Err(e) = self
            .await_connected(&mut state_rx, "egress")
            .await
        {
            link.close().await;
            return Err(e);
        }
        Ok(link)
    }

    /// Supervision loop: shutdown, link state transitions and the sync tick.
    async fn supervise(
        &self,
        stream: &StreamInfo,
        mut ingest: Box<dyn IngestLink>,
        egress: Box<dyn EgressLink>,
        baseline: &mut String,
    ) -> std::result::Result<(), String> {
        let mut ingest_state = ingest.state_watch();
        let mut egress_state = egress.state_watch();
        let mut egress_watched = true;

        let mut sync = tokio::time::interval(self.config.sync_interval());
        sync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Session shutting down");
                    ingest.close().await;
                    egress.close().await;
                    return Ok(());
                }
                changed = ingest_state.changed() => {
                    let dropped = changed.is_err()
                        || is_down(*ingest_state.borrow_and_update());
                    if dropped {
                        warn!("Ingest link dropped, reconnecting");
                        self.set_state(SessionState::Reconnecting);
                        match self.reconnect_ingest(stream, ingest).await {
                            Ok(link) => {
                                ingest = link;
                                ingest_state = ingest.state_watch();
                                self.set_state(SessionState::Streaming);
                            }
                            Err(e) => {
                                egress.close().await;
                                if self.shutdown.is_cancelled() {
                                    return Ok(());
                                }
                                return Err(format!("ingest reconnect failed: {}", e));
                            }
                        }
                    }
                }
                changed = egress_state.changed(), if egress_watched => {
                    match changed {
                        Err(_) => egress_watched = false,
                        Ok(()) => {
                            if is_down(*egress_state.borrow_and_update()) {
                                warn!("Egress link down; no reconnect policy for egress");
                                let _ = self.events_tx.send(SessionEvent::EgressDown);
                            }
                        }
                    }
                }
                _ = sync.tick() => {
                    self.sync_params(&stream.id, baseline).await;
                }
            }
        }
    }

    /// Bounded reconnect loop for the ingest link only. Each attempt tears
    /// the previous link down fully, waits (doubling per attempt) and
    /// recreates the session from scratch.
    async fn reconnect_ingest(
        &self,
        stream: &StreamInfo,
        old: Box<dyn IngestLink>,
    ) -> Result<Box<dyn IngestLink>> {
        old.close().await;

        let limit = self.config.reconnect_limit.max(1);
        let mut delay = self.config.reconnect_initial_delay();

        for attempt in 1..=limit {
            info!(
                "Ingest reconnect attempt {}/{} after {:?}",
                attempt, limit, delay
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(AppError::Network("shutdown during reconnect".to_string()));
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match self.bring_up_ingest(stream).await {
                Ok(link) => {
                    info!("Ingest reconnected on attempt {}", attempt);
                    return Ok(link);
                }
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
            }

            delay *= 2;
        }

        Err(AppError::Network(format!(
            "ingest did not recover after {} attempts",
            limit
        )))
    }

    /// One sync tick: re-encode the current parameters and push when the
    /// bytes differ from the last pushed revision.
    async fn sync_params(&self, stream_id: &str, baseline: &mut String) {
        let value = self.params.read().to_value();
        let encoded = value.to_string();
        if encoded == *baseline {
            return;
        }

        debug!("Generation parameters changed, pushing update");
        if let Err(e) = self.gateway.update_stream(stream_id, &value).await {
            warn!("Parameter update failed: {}", e);
        }
        // The baseline advances even on a failed push; the next tick diffs
        // against this revision (accepted staleness window).
        *baseline = encoded;
    }

    async fn await_connected(
        &self,
        state_rx: &mut watch::Receiver<LinkState>,
        what: &str,
    ) -> Result<()> {
        let wait = async {
            loop {
                match *state_rx.borrow_and_update() {
                    LinkState::Connected => return Ok(()),
                    LinkState::Failed | LinkState::Closed => {
                        return Err(AppError::Negotiation(format!(
                            "{} connection failed",
                            what
                        )));
                    }
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(AppError::Negotiation(format!(
                        "{} state channel closed",
                        what
                    )));
                }
            }
        };

        tokio::time::timeout(self.config.connect_timeout(), wait)
            .await
            .map_err(|_| AppError::Timeout(format!("{} did not connect in time", what)))?
    }

    /// Best-effort teardown of the remote stream; failure is logged only.
    async fn delete_stream(&self, stream_id: &str) {
        if let Err(e) = self.gateway.delete_stream(stream_id).await {
            warn!("Failed to delete stream {}: {}", stream_id, e);
        }
    }

    fn set_state(&self, state: SessionState) {
        if *self.state_tx.borrow() == state {
            return;
        }
        info!("Session state: {}", state);
        // send_replace updates the value even with no subscriber, so the
        // state() accessor never reads a stale entry.
        self.state_tx.send_replace(state.clone());
        let _ = self.events_tx.send(SessionEvent::StateChanged(state));
    }
}

fn is_down(state: LinkState) -> bool {
    matches!(
        state,
        LinkState::Disconnected | LinkState::Failed | LinkState::Closed
    )
}
