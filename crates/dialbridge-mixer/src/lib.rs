//! # dialbridge-mixer
//!
//! Composites the conference tracks admitted for one session into the single
//! audio + video stream sent back to the caller.
//!
//! - [`layout`]: grid geometry (uniform grid or filmstrip)
//! - [`compositor`]: center-crop and scale each source into its cell
//! - [`audio`]: unity-gain summing bus
//! - [`engine`]: admitted track sets and the fixed-rate render loop

pub mod audio;
pub mod compositor;
pub mod engine;
pub mod layout;

pub use engine::{MixerHandle, MixingEngine};
pub use layout::Cell;

use dialbridge_common::BridgeError;

/// Mixer setup errors.
#[derive(Debug, thiserror::Error)]
pub enum MixerError {
    #[error("Invalid output geometry {width}x{height}")]
    InvalidGeometry { width: u32, height: u32 },

    #[error("Frame rate {0} outside the supported range")]
    InvalidFrameRate(u32),

    #[error("Audio format must have a positive rate, channel count and frame period")]
    InvalidAudioFormat,
}

impl From<MixerError> for BridgeError {
    fn from(err: MixerError) -> Self {
        BridgeError::Media(err.to_string())
    }
}
