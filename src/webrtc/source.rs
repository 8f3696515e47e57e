//! Local video source plumbing
//!
//! The host pushes encoded video samples into a [`VideoSource`]; the ingest
//! session fans them onto its local track. Once ingest connects it tightens
//! the [`EncoderLimits`], which both the host's encoder (via the watch
//! channel) and the feeder's frame pacing observe.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// One encoded video access unit
#[derive(Debug, Clone)]
pub struct VideoSample {
    pub data: Bytes,
    pub duration: Duration,
}

/// Caps the ingest session applies to the outbound encoding once connected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderLimits {
    /// Maximum bitrate in kbps; `None` leaves the encoder unconstrained
    pub max_bitrate_kbps: Option<u32>,
    /// Maximum frame rate; frames above it are dropped by the feeder
    pub max_framerate: Option<u32>,
}

/// Encoded-sample fan-in shared between the host and the ingest session
pub struct VideoSource {
    sample_tx: broadcast::Sender<VideoSample>,
    limits_tx: watch::Sender<EncoderLimits>,
    limits_rx: watch::Receiver<EncoderLimits>,
}

impl VideoSource {
    pub fn new() -> Self {
        let (sample_tx, _) = broadcast::channel(16);
        let (limits_tx, limits_rx) = watch::channel(EncoderLimits::default());
        Self {
            sample_tx,
            limits_tx,
            limits_rx,
        }
    }

    /// Push one encoded sample. Returns false when no session is listening.
    pub fn push(&self, sample: VideoSample) -> bool {
        self.sample_tx.send(sample).is_ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VideoSample> {
        self.sample_tx.subscribe()
    }

    /// Current encoder caps; the host's encoder should watch this.
    pub fn limits(&self) -> watch::Receiver<EncoderLimits> {
        self.limits_rx.clone()
    }

    /// Tighten the encoder caps. Called by ingest once connected.
    pub fn set_limits(&self, limits: EncoderLimits) {
        if self.limits_tx.send_if_modified(|current| {
            if *current == limits {
                false
            } else {
                *current = limits;
                true
            }
        }) {
            info!(
                "Encoder limits applied (bitrate: {:?} kbps, framerate: {:?})",
                limits.max_bitrate_kbps, limits.max_framerate
            );
        }
    }
}

impl Default for VideoSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for the task feeding a local track from a [`VideoSource`]
pub struct TrackFeeder {
    running: watch::Sender<bool>,
}

impl TrackFeeder {
    /// Spawn a task copying samples from the source onto the track,
    /// dropping frames that exceed the frame-rate cap.
    pub fn spawn(
        track: std::sync::Arc<TrackLocalStaticSample>,
        mut sample_rx: broadcast::Receiver<VideoSample>,
        mut limits_rx: watch::Receiver<EncoderLimits>,
    ) -> Self {
        let (running_tx, mut running_rx) = watch::channel(true);

        tokio::spawn(async move {
            let mut last_write: Option<Instant> = None;
            loop {
                tokio::select! {
                    result = sample_rx.recv() => {
                        match result {
                            Ok(sample) => {
                                let limits = *limits_rx.borrow_and_update();
                                if let Some(fps) = limits.max_framerate {
                                    let min_gap = Duration::from_secs(1) / fps.max(1);
                                    if let Some(last) = last_write {
                                        if last.elapsed() < min_gap {
                                            continue;
                                        }
                                    }
                                }
                                last_write = Some(Instant::now());

                                let out = Sample {
                                    data: sample.data,
                                    duration: sample.duration,
                                    ..Default::default()
                                };
                                if let Err(e) = track.write_sample(&out).await {
                                    debug!("Failed to write video sample: {}", e);
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                debug!("Video feeder lagged by {} samples", n);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = running_rx.changed() => {
                        if !*running_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Video feeder stopped");
        });

        Self {
            running: running_tx,
        }
    }

    pub fn stop(&self) {
        let _ = self.running.send(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_update_notifies_watchers() {
        let source = VideoSource::new();
        let rx = source.limits();
        assert_eq!(*rx.borrow(), EncoderLimits::default());

        source.set_limits(EncoderLimits {
            max_bitrate_kbps: Some(2000),
            max_framerate: Some(30),
        });
        assert_eq!(rx.borrow().max_bitrate_kbps, Some(2000));
        assert_eq!(rx.borrow().max_framerate, Some(30));
    }

    #[test]
    fn push_without_subscriber_is_dropped() {
        let source = VideoSource::new();
        assert!(!source.push(VideoSample {
            data: Bytes::from_static(&[0, 0, 0, 1]),
            duration: Duration::from_millis(33),
        }));

        let _rx = source.subscribe();
        assert!(source.push(VideoSample {
            data: Bytes::from_static(&[0, 0, 0, 1]),
            duration: Duration::from_millis(33),
        }));
    }
}
