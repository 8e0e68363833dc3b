//! # dialbridge-common
//!
//! Shared configuration, error handling, identifiers and media primitives used
//! across all dialbridge crates. No call or conference logic lives here.

pub mod config;
pub mod error;
pub mod id;
pub mod media;

pub use error::{BridgeError, BridgeResult};
pub use media::{AudioFrame, MediaKind, MediaStream, MediaTrack, VideoFrame};
