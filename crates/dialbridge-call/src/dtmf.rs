//! `application/dtmf-relay` INFO payloads.
//!
//! ```text
//! Content-Type: application/dtmf-relay
//!
//! Signal=5\r\n
//! Duration=160\r\n
//! ```

use std::sync::LazyLock;

use regex::Regex;

use dialbridge_common::BridgeError;

static CONTENT_TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^application/dtmf-relay").unwrap());
static SIGNAL_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Signal\s*=\s*([0-9A-D#*])(?:\s.*)?$").unwrap());
static DURATION_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Duration\s?=\s?([0-9]{1,4})(?:\s.*)?$").unwrap());

/// A single telephone keypad tone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtmfTone {
    Digit(u8),
    Star,
    Pound,
    A,
    B,
    C,
    D,
}

impl DtmfTone {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '0'..='9' => c.to_digit(10).map(|d| Self::Digit(d as u8)),
            '*' => Some(Self::Star),
            '#' => Some(Self::Pound),
            'A' => Some(Self::A),
            'B' => Some(Self::B),
            'C' => Some(Self::C),
            'D' => Some(Self::D),
            _ => None,
        }
    }

    pub fn to_char(self) -> char {
        match self {
            Self::Digit(d) => char::from(b'0' + d),
            Self::Star => '*',
            Self::Pound => '#',
            Self::A => 'A',
            Self::B => 'B',
            Self::C => 'C',
            Self::D => 'D',
        }
    }

    /// The decimal digit, if this is one.
    pub fn digit(self) -> Option<char> {
        matches!(self, Self::Digit(_)).then(|| self.to_char())
    }
}

impl std::fmt::Display for DtmfTone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_char())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtmfEvent {
    pub tone: DtmfTone,
    pub duration_ms: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DtmfError {
    #[error("content type is not application/dtmf-relay")]
    ContentType,
    #[error("body must carry a Signal line and a Duration line")]
    Body,
    #[error("missing or invalid Signal")]
    Tone,
    #[error("missing or invalid Duration")]
    Duration,
}

impl From<DtmfError> for BridgeError {
    fn from(err: DtmfError) -> Self {
        BridgeError::InvalidDtmf(err.to_string())
    }
}

/// Parse an INFO request carrying a relayed tone.
pub fn parse_info(content_type: Option<&str>, body: &str) -> Result<DtmfEvent, DtmfError> {
    match content_type {
        Some(ct) if CONTENT_TYPE.is_match(ct) => {}
        _ => return Err(DtmfError::ContentType),
    }

    let mut lines = body.split("\r\n");
    let (Some(signal), Some(duration)) = (lines.next(), lines.next()) else {
        return Err(DtmfError::Body);
    };

    let tone = SIGNAL_LINE
        .captures(signal)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().chars().next())
        .and_then(DtmfTone::from_char)
        .ok_or(DtmfError::Tone)?;

    let duration_ms = DURATION_LINE
        .captures(duration)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok())
        .filter(|d| *d > 0)
        .ok_or(DtmfError::Duration)?;

    Ok(DtmfEvent { tone, duration_ms })
}
