//! Media primitives shared between the call leg, the conference client and the
//! mixer.
//!
//! Encoding and decoding happen outside this process boundary; everything in
//! here deals with decoded media. A [`MediaTrack`] is a cheap-clone handle:
//! whoever decodes pushes into it, whoever composites or forwards reads from it.
//!
//! - Video keeps only the latest frame. Readers that run slower than the
//!   source simply see the newest picture.
//! - Audio keeps a short FIFO of PCM frames and drops the oldest when full, so
//!   a stalled reader never accumulates latency.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::id::generate_track_id;

/// Decoded video frame.
pub type VideoFrame = image::RgbaImage;

/// Maximum number of queued audio frames per track.
pub const AUDIO_QUEUE_DEPTH: usize = 5;

/// Kind of a media track, spelled the way the conference signaling spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// A block of interleaved 16-bit PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    pub fn silence(len: usize, sample_rate: u32, channels: u16) -> Self {
        Self::new(vec![0; len], sample_rate, channels)
    }
}

/// Handle to a single audio or video track.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

struct TrackInner {
    id: String,
    kind: MediaKind,
    ended: AtomicBool,
    latest_frame: Mutex<Option<Arc<VideoFrame>>>,
    audio: Mutex<VecDeque<AudioFrame>>,
}

impl MediaTrack {
    /// Create a track with a freshly generated id.
    pub fn new(kind: MediaKind) -> Self {
        Self::with_id(generate_track_id(), kind)
    }

    /// Create a track with a caller-chosen id (e.g. the server-assigned consumer id).
    pub fn with_id(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                ended: AtomicBool::new(false),
                latest_frame: Mutex::new(None),
                audio: Mutex::new(VecDeque::with_capacity(AUDIO_QUEUE_DEPTH)),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::Acquire)
    }

    /// End the track. Buffered media is released and later pushes are ignored.
    pub fn stop(&self) {
        self.inner.ended.store(true, Ordering::Release);
        lock(&self.inner.latest_frame).take();
        lock(&self.inner.audio).clear();
    }

    /// Replace the latest video frame. Ignored for audio or ended tracks.
    pub fn push_video_frame(&self, frame: Arc<VideoFrame>) {
        if self.inner.kind != MediaKind::Video || self.is_ended() {
            return;
        }
        *lock(&self.inner.latest_frame) = Some(frame);
    }

    /// The most recent video frame, if the source produced one yet.
    pub fn latest_video_frame(&self) -> Option<Arc<VideoFrame>> {
        lock(&self.inner.latest_frame).clone()
    }

    /// Queue an audio frame, dropping the oldest one when the queue is full.
    pub fn push_audio(&self, frame: AudioFrame) {
        if self.inner.kind != MediaKind::Audio || self.is_ended() {
            return;
        }
        let mut queue = lock(&self.inner.audio);
        if queue.len() >= AUDIO_QUEUE_DEPTH {
            queue.pop_front();
        }
        queue.push_back(frame);
    }

    /// Take the next queued audio frame.
    pub fn pull_audio(&self) -> Option<AudioFrame> {
        lock(&self.inner.audio).pop_front()
    }

    pub fn queued_audio(&self) -> usize {
        lock(&self.inner.audio).len()
    }

    /// Drop queued audio without ending the track.
    pub fn clear_audio(&self) {
        lock(&self.inner.audio).clear();
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for MediaTrack {}

/// One audio track plus one video track, handed out as a single unit.
#[derive(Debug, Clone)]
pub struct MediaStream {
    pub id: String,
    pub audio: MediaTrack,
    pub video: MediaTrack,
}

impl MediaStream {
    pub fn new() -> Self {
        Self {
            id: generate_track_id(),
            audio: MediaTrack::new(MediaKind::Audio),
            video: MediaTrack::new(MediaKind::Video),
        }
    }

    pub fn stop(&self) {
        self.audio.stop();
        self.video.stop();
    }
}

impl Default for MediaStream {
    fn default() -> Self {
        Self::new()
    }
}

// Poisoning is ignored; buffered media stays structurally valid.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_queue_drops_oldest() {
        let track = MediaTrack::new(MediaKind::Audio);
        for i in 0..(AUDIO_QUEUE_DEPTH as i16 + 2) {
            track.push_audio(AudioFrame::new(vec![i], 48_000, 1));
        }
        assert_eq!(track.queued_audio(), AUDIO_QUEUE_DEPTH);
        assert_eq!(track.pull_audio().map(|f| f.samples), Some(vec![2]));
    }

    #[test]
    fn video_keeps_latest_frame_only() {
        let track = MediaTrack::new(MediaKind::Video);
        assert!(track.latest_video_frame().is_none());
        track.push_video_frame(Arc::new(VideoFrame::new(2, 2)));
        track.push_video_frame(Arc::new(VideoFrame::new(4, 4)));
        let frame = track.latest_video_frame().expect("frame");
        assert_eq!(frame.dimensions(), (4, 4));
    }

    #[test]
    fn stopped_track_ignores_pushes() {
        let track = MediaTrack::new(MediaKind::Audio);
        track.push_audio(AudioFrame::silence(4, 48_000, 1));
        track.stop();
        track.push_audio(AudioFrame::silence(4, 48_000, 1));
        assert!(track.is_ended());
        assert_eq!(track.queued_audio(), 0);
    }

    #[test]
    fn kind_mismatch_is_ignored() {
        let track = MediaTrack::new(MediaKind::Audio);
        track.push_video_frame(Arc::new(VideoFrame::new(1, 1)));
        assert!(track.latest_video_frame().is_none());
    }

    #[test]
    fn kind_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&MediaKind::Video).unwrap(),
            "\"video\""
        );
    }
}
