//! Centralized error types for dialbridge.
//!
//! Uses `thiserror` for ergonomic error definitions. The variants follow the
//! failure classes a bridging session distinguishes: negotiation failures are
//! fatal to the session, request timeouts are typed so callers can decide,
//! and everything else is either logged or turned into a user-audible prompt.

use crate::media::MediaKind;

/// Core error type used across all dialbridge crates.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    // === Signaling errors ===
    #[error("Request timeout: {method}")]
    RequestTimeout { method: String },

    #[error("Signaling channel is not connected")]
    NotConnected,

    #[error("Signaling channel closed")]
    ChannelClosed,

    #[error("Request {method} rejected ({code}): {reason}")]
    Rejected {
        method: String,
        code: u16,
        reason: String,
    },

    #[error("Malformed signaling frame: {0}")]
    MalformedFrame(String),

    // === Conference media errors ===
    #[error("Negotiation failed at {step}: {reason}")]
    Negotiation { step: &'static str, reason: String },

    #[error("Cannot produce {0}")]
    CannotProduce(MediaKind),

    #[error("Not joined to a room")]
    NotJoined,

    #[error("Media error: {0}")]
    Media(String),

    // === Call-side errors ===
    #[error("Invalid DTMF payload: {0}")]
    InvalidDtmf(String),

    #[error("Call control error: {0}")]
    CallControl(String),

    #[error("Prompt error: {0}")]
    Prompt(String),

    // === Configuration ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    // === Infrastructure errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl BridgeError {
    /// Wrap a negotiation step failure.
    pub fn negotiation(step: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Negotiation {
            step,
            reason: err.to_string(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. })
    }

    /// Errors after which the signaling channel can no longer carry requests.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::NotConnected | Self::ChannelClosed)
    }

    /// Error code string for programmatic handling and log aggregation.
    pub fn error_code(&self) -> &str {
        match self {
            Self::RequestTimeout { .. } => "REQUEST_TIMEOUT",
            Self::NotConnected => "NOT_CONNECTED",
            Self::ChannelClosed => "CHANNEL_CLOSED",
            Self::Rejected { .. } => "REJECTED",
            Self::MalformedFrame(_) => "MALFORMED_FRAME",
            Self::Negotiation { .. } => "NEGOTIATION_FAILED",
            Self::CannotProduce(_) => "CANNOT_PRODUCE",
            Self::NotJoined => "NOT_JOINED",
            Self::Media(_) => "MEDIA_ERROR",
            Self::InvalidDtmf(_) => "INVALID_DTMF",
            Self::CallControl(_) => "CALL_CONTROL_ERROR",
            Self::Prompt(_) => "PROMPT_ERROR",
            Self::InvalidConfig(_) | Self::Config(_) => "CONFIG_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::WebSocket(_) => "WEBSOCKET_ERROR",
            Self::Url(_) => "URL_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Convenience type alias for Results using BridgeError.
pub type BridgeResult<T> = Result<T, BridgeError>;
