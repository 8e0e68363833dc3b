//! The mixing engine: admitted track sets plus the render/audio loop.
//!
//! ```text
//!   MixerHandle ──add/remove──▶ MixState ◀──snapshot── render loop ──▶ output MediaStream
//! ```
//!
//! The admitted sets are guarded by a plain mutex held only for a snapshot
//! copy, so mutations never block a render tick for longer than a clone of a
//! few track handles.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use dialbridge_common::config::{LayoutMode, MAX_FRAME_RATE, MixerConfig};
use dialbridge_common::{MediaKind, MediaStream, MediaTrack};

use crate::MixerError;
use crate::audio::AudioBus;
use crate::compositor::Compositor;
use crate::layout::{self, Cell};

#[derive(Default)]
struct MixState {
    video: Vec<MediaTrack>,
    audio: Vec<MediaTrack>,
    /// Bumped on every change of the admitted video set.
    generation: u64,
    closed: bool,
}

/// Cloneable handle for admitting and releasing tracks.
#[derive(Clone)]
pub struct MixerHandle {
    state: Arc<Mutex<MixState>>,
    layout: LayoutMode,
    width: u32,
    height: u32,
}

impl MixerHandle {
    /// Admit a video track. Returns `false` if it was already admitted.
    pub fn add_video(&self, track: MediaTrack) -> bool {
        let mut state = lock(&self.state);
        if state.closed || state.video.contains(&track) {
            tracing::debug!(track = %track.id(), "Video track already admitted");
            return false;
        }
        tracing::debug!(track = %track.id(), "Video track admitted to mixer");
        state.video.push(track);
        state.generation += 1;
        true
    }

    /// Admit an audio track. Returns `false` if it was already admitted.
    pub fn add_audio(&self, track: MediaTrack) -> bool {
        let mut state = lock(&self.state);
        if state.closed || state.audio.contains(&track) {
            tracing::debug!(track = %track.id(), "Audio track already admitted");
            return false;
        }
        tracing::debug!(track = %track.id(), "Audio track admitted to mixer");
        state.audio.push(track);
        true
    }

    /// Admit a track into the set matching its kind.
    pub fn add(&self, track: MediaTrack) -> bool {
        match track.kind() {
            MediaKind::Audio => self.add_audio(track),
            MediaKind::Video => self.add_video(track),
        }
    }

    pub fn remove_video(&self, track_id: &str) -> bool {
        let mut state = lock(&self.state);
        let before = state.video.len();
        state.video.retain(|t| t.id() != track_id);
        let removed = state.video.len() != before;
        if removed {
            state.generation += 1;
            tracing::debug!(track = %track_id, "Video track released from mixer");
        }
        removed
    }

    pub fn remove_audio(&self, track_id: &str) -> bool {
        let mut state = lock(&self.state);
        let before = state.audio.len();
        state.audio.retain(|t| t.id() != track_id);
        let removed = state.audio.len() != before;
        if removed {
            tracing::debug!(track = %track_id, "Audio track released from mixer");
        }
        removed
    }

    /// Release a track from whichever set holds it.
    pub fn remove(&self, track_id: &str) -> bool {
        self.remove_video(track_id) | self.remove_audio(track_id)
    }

    pub fn remove_all_video(&self) {
        let mut state = lock(&self.state);
        if !state.video.is_empty() {
            state.video.clear();
            state.generation += 1;
        }
    }

    pub fn remove_all_audio(&self) {
        lock(&self.state).audio.clear();
    }

    pub fn admitted_video_ids(&self) -> Vec<String> {
        lock(&self.state)
            .video
            .iter()
            .map(|t| t.id().to_string())
            .collect()
    }

    pub fn admitted_audio_ids(&self) -> Vec<String> {
        lock(&self.state)
            .audio
            .iter()
            .map(|t| t.id().to_string())
            .collect()
    }

    /// Grid the next render tick uses for the current video set.
    pub fn cells(&self) -> Vec<Cell> {
        let count = lock(&self.state).video.len();
        layout::cells(self.layout, count, self.width, self.height)
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.video.clear();
        state.audio.clear();
        state.generation += 1;
    }

    fn snapshot_video(&self) -> (u64, Vec<MediaTrack>) {
        let state = lock(&self.state);
        (state.generation, state.video.clone())
    }

    fn snapshot_audio(&self) -> Vec<MediaTrack> {
        lock(&self.state).audio.clone()
    }
}

/// Composites admitted tracks into one audio and one video track.
pub struct MixingEngine {
    handle: MixerHandle,
    output: MediaStream,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MixingEngine {
    /// Validate the output format and spawn the render loop on the current runtime.
    pub fn start(config: &MixerConfig) -> Result<Self, MixerError> {
        if config.width == 0 || config.height == 0 {
            return Err(MixerError::InvalidGeometry {
                width: config.width,
                height: config.height,
            });
        }
        if config.frame_rate == 0 || config.frame_rate > MAX_FRAME_RATE {
            return Err(MixerError::InvalidFrameRate(config.frame_rate));
        }
        if config.sample_rate == 0 || config.channels == 0 || config.frame_ms == 0 {
            return Err(MixerError::InvalidAudioFormat);
        }

        let handle = MixerHandle {
            state: Arc::new(Mutex::new(MixState::default())),
            layout: config.layout,
            width: config.width,
            height: config.height,
        };
        let output = MediaStream::new();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_mixer(
            handle.clone(),
            output.clone(),
            config.clone(),
            cancel.clone(),
        ));

        tracing::info!(
            stream = %output.id,
            width = config.width,
            height = config.height,
            fps = config.frame_rate,
            layout = ?config.layout,
            "Mixing engine started"
        );

        Ok(Self {
            handle,
            output,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn handle(&self) -> MixerHandle {
        self.handle.clone()
    }

    /// The combined output stream sent to the caller.
    pub fn output(&self) -> MediaStream {
        self.output.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop the render loop, release every admitted track and end the output.
    /// Safe to call more than once.
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        self.handle.close();
        self.output.stop();
        tracing::info!(stream = %self.output.id, "Mixing engine closed");
    }
}

impl Drop for MixingEngine {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_mixer(
    handle: MixerHandle,
    output: MediaStream,
    config: MixerConfig,
    cancel: CancellationToken,
) {
    let mut compositor = Compositor::new(config.width, config.height, config.layout);
    let bus = AudioBus::new(config.samples_per_frame(), config.sample_rate, config.channels);

    let mut render = interval(Duration::from_micros(1_000_000 / config.frame_rate as u64));
    render.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut mix = interval(Duration::from_millis(config.frame_ms as u64));
    mix.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = render.tick() => {
                let (generation, tracks) = handle.snapshot_video();
                let frame = compositor.render(generation, &tracks);
                output.video.push_video_frame(Arc::new(frame));
            }
            _ = mix.tick() => {
                let tracks = handle.snapshot_audio();
                output.audio.push_audio(bus.mix(&tracks));
            }
        }
    }

    tracing::debug!(stream = %output.id, "Mixer loop stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
