//! daydream-client - Realtime AI video client
//!
//! This crate streams a local video source to the Daydream inference
//! gateway over WHIP-style WebRTC ingest, plays the transformed result
//! back over WHEP-style egress, and keeps the generation parameters
//! synchronized with the gateway out of band.

pub mod auth;
pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod params;
pub mod sdp;
pub mod webrtc;

pub use error::{AppError, Result};
