//! Voice prompts played to the caller.
//!
//! Clips are decoded once per process into PCM at the mixer's format. Each
//! session owns a [`PromptPlayer`] whose track is admitted to the session
//! mixer, so prompts reach the caller mixed with the conference audio.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

use dialbridge_common::config::{MixerConfig, PromptsConfig};
use dialbridge_common::{AudioFrame, BridgeError, BridgeResult, MediaKind, MediaTrack};
use dialbridge_mixer::MixerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Prompt {
    EnterCode,
    InvalidCode,
    Muted,
    Unmuted,
    Joined,
}

impl Prompt {
    pub const ALL: [Prompt; 5] = [
        Prompt::EnterCode,
        Prompt::InvalidCode,
        Prompt::Muted,
        Prompt::Unmuted,
        Prompt::Joined,
    ];

    fn path(self, config: &PromptsConfig) -> &Path {
        match self {
            Self::EnterCode => &config.enter_code,
            Self::InvalidCode => &config.invalid_code,
            Self::Muted => &config.muted,
            Self::Unmuted => &config.unmuted,
            Self::Joined => &config.joined,
        }
    }
}

impl fmt::Display for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::EnterCode => "enter_code",
            Self::InvalidCode => "invalid_code",
            Self::Muted => "muted",
            Self::Unmuted => "unmuted",
            Self::Joined => "joined",
        };
        f.write_str(s)
    }
}

/// Decoded prompt clips, shared by every session.
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    clips: HashMap<Prompt, Arc<[i16]>>,
    sample_rate: u32,
    channels: u16,
}

impl PromptLibrary {
    /// Load every configured clip. Clips that fail to load are logged and
    /// left out; playing them is a no-op.
    pub fn load(config: &PromptsConfig, mixer: &MixerConfig) -> Self {
        let mut clips: HashMap<Prompt, Arc<[i16]>> = HashMap::new();
        for prompt in Prompt::ALL {
            let path = prompt.path(config);
            match load_clip(path, mixer.sample_rate, mixer.channels) {
                Ok(samples) => {
                    tracing::debug!(prompt = %prompt, path = %path.display(), samples = samples.len(), "Prompt loaded");
                    clips.insert(prompt, samples.into());
                }
                Err(e) => {
                    tracing::warn!(prompt = %prompt, path = %path.display(), error = %e, "Prompt unavailable");
                }
            }
        }
        Self {
            clips,
            sample_rate: mixer.sample_rate,
            channels: mixer.channels,
        }
    }

    /// Library from in-memory PCM already in the output format.
    pub fn from_clips(
        clips: impl IntoIterator<Item = (Prompt, Vec<i16>)>,
        sample_rate: u32,
        channels: u16,
    ) -> Self {
        Self {
            clips: clips.into_iter().map(|(p, s)| (p, s.into())).collect(),
            sample_rate,
            channels,
        }
    }

    pub fn clip(&self, prompt: Prompt) -> Option<Arc<[i16]>> {
        self.clips.get(&prompt).cloned()
    }

    /// Prompts that failed to load.
    pub fn missing(&self) -> Vec<Prompt> {
        Prompt::ALL
            .into_iter()
            .filter(|p| !self.clips.contains_key(p))
            .collect()
    }
}

/// Read a mono 16-bit WAV at `sample_rate`, widened to `channels`.
pub fn load_clip(path: &Path, sample_rate: u32, channels: u16) -> BridgeResult<Vec<i16>> {
    let mut reader = hound::WavReader::open(path).map_err(|e| BridgeError::Prompt(e.to_string()))?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        return Err(BridgeError::Prompt(format!(
            "expected mono 16-bit PCM, got {} channel(s) at {} bits",
            spec.channels, spec.bits_per_sample
        )));
    }
    if spec.sample_rate != sample_rate {
        return Err(BridgeError::Prompt(format!(
            "expected {sample_rate} Hz, got {} Hz",
            spec.sample_rate
        )));
    }

    let mono = reader
        .samples::<i16>()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| BridgeError::Prompt(e.to_string()))?;
    if channels <= 1 {
        return Ok(mono);
    }
    Ok(mono
        .into_iter()
        .flat_map(|s| std::iter::repeat_n(s, channels as usize))
        .collect())
}

struct ActivePrompt {
    prompt: Prompt,
    task: JoinHandle<()>,
}

/// Plays one prompt at a time into a mixer-admitted track.
pub struct PromptPlayer {
    library: Arc<PromptLibrary>,
    mixer: MixerHandle,
    track: MediaTrack,
    frame_samples: usize,
    frame: Duration,
    active: Option<ActivePrompt>,
}

impl PromptPlayer {
    pub fn new(library: Arc<PromptLibrary>, mixer: MixerHandle, config: &MixerConfig) -> Self {
        let track = MediaTrack::new(MediaKind::Audio);
        mixer.add_audio(track.clone());
        Self {
            library,
            mixer,
            track,
            frame_samples: config.samples_per_frame(),
            frame: Duration::from_millis(config.frame_ms as u64),
            active: None,
        }
    }

    pub fn track(&self) -> &MediaTrack {
        &self.track
    }

    /// Start `prompt`, cutting off whatever was playing.
    pub fn play(&mut self, prompt: Prompt) -> bool {
        self.stop();
        let Some(clip) = self.library.clip(prompt) else {
            tracing::warn!(prompt = %prompt, "Prompt not loaded, skipping");
            return false;
        };
        tracing::debug!(prompt = %prompt, "Playing prompt");
        let task = tokio::spawn(pump(
            clip,
            self.track.clone(),
            self.frame_samples,
            self.frame,
            self.library.sample_rate,
            self.library.channels,
        ));
        self.active = Some(ActivePrompt { prompt, task });
        true
    }

    /// The prompt still playing, if any.
    pub fn active(&self) -> Option<Prompt> {
        self.active
            .as_ref()
            .filter(|a| !a.task.is_finished())
            .map(|a| a.prompt)
    }

    pub fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            active.task.abort();
        }
        self.track.clear_audio();
    }

    /// Stop playback and release the track from the mixer.
    pub fn close(&mut self) {
        self.stop();
        self.mixer.remove_audio(self.track.id());
        self.track.stop();
    }
}

impl Drop for PromptPlayer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Feed `clip` into `track` one mixer frame per tick.
async fn pump(
    clip: Arc<[i16]>,
    track: MediaTrack,
    frame_samples: usize,
    frame: Duration,
    sample_rate: u32,
    channels: u16,
) {
    let mut ticker = interval(frame);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    for chunk in clip.chunks(frame_samples.max(1)) {
        ticker.tick().await;
        let mut samples = chunk.to_vec();
        samples.resize(frame_samples, 0);
        track.push_audio(AudioFrame::new(samples, sample_rate, channels));
    }
}
