//! Unity-gain summing bus.

use dialbridge_common::{AudioFrame, MediaTrack};

/// Sums one frame from every admitted audio track per mix period.
#[derive(Debug, Clone)]
pub struct AudioBus {
    samples_per_frame: usize,
    sample_rate: u32,
    channels: u16,
}

impl AudioBus {
    pub fn new(samples_per_frame: usize, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples_per_frame,
            sample_rate,
            channels,
        }
    }

    /// Pull the next frame of each track and sum them with i16 saturation.
    ///
    /// A track with nothing queued contributes silence for this period. Short
    /// frames are zero-padded, long ones truncated to the bus frame size.
    pub fn mix(&self, tracks: &[MediaTrack]) -> AudioFrame {
        let mut acc = vec![0i32; self.samples_per_frame];
        for track in tracks {
            let Some(frame) = track.pull_audio() else {
                continue;
            };
            for (sum, sample) in acc.iter_mut().zip(frame.samples) {
                *sum += sample as i32;
            }
        }
        let samples = acc
            .into_iter()
            .map(|s| s.clamp(i16::MIN as i32, i16::MAX as i32) as i16)
            .collect();
        AudioFrame::new(samples, self.sample_rate, self.channels)
    }
}
