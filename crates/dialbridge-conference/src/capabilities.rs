//! Typed router capability negotiation.
//!
//! The room server describes what its router can carry; the device loads a
//! filtered copy. Fields the bridge does not interpret are kept verbatim so
//! the device receives exactly what the server sent minus the filtered bits.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use dialbridge_common::{BridgeError, BridgeResult, MediaKind};

/// Header extension the bridge's media stack does not honour.
pub const VIDEO_ORIENTATION: &str = "urn:3gpp:video-orientation";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default)]
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderExtension {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MediaKind>,
    pub uri: String,
    #[serde(default)]
    pub preferred_id: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterCapabilities {
    #[serde(default)]
    pub codecs: Vec<CodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<HeaderExtension>,
}

impl RouterCapabilities {
    pub fn from_value(value: Value) -> BridgeResult<Self> {
        serde_json::from_value(value).map_err(|e| BridgeError::negotiation("capabilities", e))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Drop every header extension with `uri`.
    pub fn without_header_extension(mut self, uri: &str) -> Self {
        self.header_extensions.retain(|ext| ext.uri != uri);
        self
    }

    /// Whether any codec of `kind` is offered.
    pub fn supports(&self, kind: MediaKind) -> bool {
        self.codecs.iter().any(|c| c.kind == kind)
    }

    /// One-line summary for logs and the `probe` command.
    pub fn summary(&self) -> String {
        let codecs: Vec<&str> = self.codecs.iter().map(|c| c.mime_type.as_str()).collect();
        format!(
            "codecs=[{}] header_extensions={}",
            codecs.join(", "),
            self.header_extensions.len()
        )
    }
}
