//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::error::{BridgeError, BridgeResult};

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Number of digits in a dial-in room code.
pub const CODE_LENGTH: usize = 5;

/// Highest mixer frame rate accepted; the render period must stay non-zero.
pub const MAX_FRAME_RATE: u32 = 240;

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG
        .get()
        .expect("Config not initialized. Call dialbridge_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code accesses config.
/// `path` overrides the default `config` file name (extension resolved by the loader).
pub fn init(path: Option<&str>) -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = defaults(config::Config::builder())?
        // Optional config file
        .add_source(config::File::with_name(path.unwrap_or("config")).required(path.is_some()))
        // Environment variables (DIALBRIDGE_CONFERENCE__HOST_NAME, DIALBRIDGE_MIXER__LAYOUT, etc.)
        .add_source(
            config::Environment::with_prefix("DIALBRIDGE")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

fn defaults(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
    builder
        .set_default("sip.display_name", "dialbridge")?
        .set_default("sip.user_agent_string", "dialbridge SIPGW")?
        .set_default("sip.server", "")?
        .set_default("sip.uri", "")?
        .set_default("sip.username", "")?
        .set_default("sip.password", "")?
        .set_default("sip.trace_sip", false)?
        .set_default("conference.host_name", "localhost")?
        .set_default("conference.port", 4443)?
        .set_default("conference.request_timeout_ms", 10_000)?
        .set_default("conference.force_tcp", true)?
        .set_default("conference.last_n", 4)?
        .set_default("conference.max_reconnect", 10)?
        .set_default("bridge.mode", "code_routed")?
        .set_default("bridge.accept_delay_ms", 10)?
        .set_default("bridge.prompt_delay_ms", 4_000)?
        .set_default("bridge.prompt_interval_ms", 15_000)?
        .set_default("bridge.room_header", "X-Room")?
        .set_default("mixer.width", 640)?
        .set_default("mixer.height", 480)?
        .set_default("mixer.frame_rate", 15)?
        .set_default("mixer.layout", "uniform")?
        .set_default("mixer.sample_rate", 48_000)?
        .set_default("mixer.channels", 1)?
        .set_default("mixer.frame_ms", 20)?
        .set_default("prompts.enter_code", "sounds/conference-pin.wav")?
        .set_default("prompts.invalid_code", "sounds/invalid-pin.wav")?
        .set_default("prompts.muted", "sounds/muted.wav")?
        .set_default("prompts.unmuted", "sounds/unmuted.wav")?
        .set_default("prompts.joined", "sounds/notify.wav")
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub sip: SipConfig,
    pub conference: ConferenceConfig,
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub rooms: RoomsConfig,
    pub mixer: MixerConfig,
    pub prompts: PromptsConfig,
}

impl AppConfig {
    /// Build a config from TOML text layered over the defaults (no env, no files).
    pub fn from_toml_str(toml: &str) -> BridgeResult<Self> {
        let cfg = defaults(config::Config::builder())?
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    /// Reject values the bridge cannot run with.
    pub fn validate(&self) -> BridgeResult<()> {
        for (code, room) in &self.rooms.mapping {
            if code.len() != CODE_LENGTH || !code.chars().all(|c| c.is_ascii_digit()) {
                return Err(BridgeError::InvalidConfig(format!(
                    "room code {code:?} must be exactly {CODE_LENGTH} digits"
                )));
            }
            if room.trim().is_empty() {
                return Err(BridgeError::InvalidConfig(format!(
                    "room code {code:?} maps to an empty room id"
                )));
            }
        }
        if self.conference.last_n == 0 {
            return Err(BridgeError::InvalidConfig(
                "conference.last_n must be at least 1".into(),
            ));
        }
        if self.conference.request_timeout_ms == 0 {
            return Err(BridgeError::InvalidConfig(
                "conference.request_timeout_ms must be positive".into(),
            ));
        }
        let m = &self.mixer;
        if m.width == 0 || m.height == 0 || m.frame_rate == 0 {
            return Err(BridgeError::InvalidConfig(
                "mixer geometry and frame rate must be positive".into(),
            ));
        }
        if m.frame_rate > MAX_FRAME_RATE {
            return Err(BridgeError::InvalidConfig(format!(
                "mixer.frame_rate must be at most {MAX_FRAME_RATE}"
            )));
        }
        if m.sample_rate == 0 || m.channels == 0 || m.frame_ms == 0 {
            return Err(BridgeError::InvalidConfig(
                "mixer audio format must be positive".into(),
            ));
        }
        if self.bridge.mode == BridgeMode::DirectRoom && self.rooms.default_room.is_none() {
            tracing::warn!(
                header = %self.bridge.room_header,
                "direct_room mode without rooms.default_room; calls without the header will be rejected"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SipConfig {
    pub display_name: String,
    pub user_agent_string: String,
    /// Call-control server (e.g. `wss://10.5.0.1:7443`).
    pub server: String,
    pub uri: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub trace_sip: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConferenceConfig {
    /// Conference signaling host.
    pub host_name: String,
    pub port: u16,
    /// Per-request timeout for signaling RPCs.
    pub request_timeout_ms: u64,
    /// Ask the room server for TCP-only ICE candidates.
    pub force_tcp: bool,
    /// Maximum number of spotlighted video participants.
    pub last_n: usize,
    /// Reconnect attempts before the signaling channel gives up.
    pub max_reconnect: u32,
    #[serde(default)]
    pub turn_servers: Vec<TurnServer>,
}

/// ICE server configuration (STUN/TURN).
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct TurnServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// How inbound calls find their room.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BridgeMode {
    /// Prompt for a numeric code and resolve it through the room mapping.
    CodeRouted,
    /// Take the room from a call header, falling back to `rooms.default_room`.
    DirectRoom,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BridgeConfig {
    pub mode: BridgeMode,
    pub accept_delay_ms: u64,
    /// Delay before the first "enter code" prompt.
    pub prompt_delay_ms: u64,
    pub prompt_interval_ms: u64,
    /// Header carrying the room id in `direct_room` mode.
    pub room_header: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct RoomsConfig {
    /// Dial-in code → room id.
    #[serde(default)]
    pub mapping: HashMap<String, String>,
    #[serde(default)]
    pub default_room: Option<String>,
}

/// Grid policy of the video compositor.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LayoutMode {
    #[default]
    Uniform,
    Filmstrip,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MixerConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub layout: LayoutMode,
    pub sample_rate: u32,
    pub channels: u16,
    /// Audio mix period in milliseconds.
    pub frame_ms: u32,
}

impl MixerConfig {
    /// Interleaved samples in one audio mix period.
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize / 1000) * self.channels as usize
    }
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            frame_rate: 15,
            layout: LayoutMode::Uniform,
            sample_rate: 48_000,
            channels: 1,
            frame_ms: 20,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PromptsConfig {
    pub enter_code: PathBuf,
    pub invalid_code: PathBuf,
    pub muted: PathBuf,
    pub unmuted: PathBuf,
    pub joined: PathBuf,
}
