//! Conference signaling protocol: frame envelope and typed payloads.
//!
//! Every WebSocket text frame is one of three JSON shapes:
//! ```text
//!   {"request":true,      "id":7, "method":"join", "data":{...}}
//!   {"response":true,     "id":7, "ok":true,  "data":{...}}
//!   {"response":true,     "id":7, "ok":false, "errorCode":500, "errorReason":"..."}
//!   {"notification":true, "method":"activeSpeaker", "data":{...}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use dialbridge_common::config::TurnServer;
use dialbridge_common::{BridgeError, BridgeResult, MediaKind};

/// RPC and notification method names.
pub mod method {
    // Client → server requests
    pub const GET_ROUTER_RTP_CAPABILITIES: &str = "getRouterRtpCapabilities";
    pub const CREATE_WEBRTC_TRANSPORT: &str = "createWebRtcTransport";
    pub const CONNECT_WEBRTC_TRANSPORT: &str = "connectWebRtcTransport";
    pub const PRODUCE: &str = "produce";
    pub const CLOSE_PRODUCER: &str = "closeProducer";
    pub const JOIN: &str = "join";
    pub const PAUSE_CONSUMER: &str = "pauseConsumer";
    pub const RESUME_CONSUMER: &str = "resumeConsumer";
    pub const CHANGE_DISPLAY_NAME: &str = "changeDisplayName";

    // Server → client
    pub const ENTERED_LOBBY: &str = "enteredLobby";
    pub const ROOM_READY: &str = "roomReady";
    pub const ROOM_BACK: &str = "roomBack";
    pub const ACTIVE_SPEAKER: &str = "activeSpeaker";
    pub const NEW_CONSUMER: &str = "newConsumer";
    pub const CONSUMER_CLOSED: &str = "consumerClosed";
    pub const CONSUMER_PAUSED: &str = "consumerPaused";
    pub const CONSUMER_RESUMED: &str = "consumerResumed";
    pub const CONSUMER_SCORE: &str = "consumerScore";
    pub const NEW_PEER: &str = "newPeer";
    pub const PEER_CLOSED: &str = "peerClosed";
    pub const MODERATOR_KICK: &str = "moderator:kick";
}

/// Error half of a response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub code: u16,
    pub reason: String,
}

impl RemoteError {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// One signaling frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request {
        id: u64,
        method: String,
        data: Value,
    },
    Response {
        id: u64,
        result: Result<Value, RemoteError>,
    },
    Notification {
        method: String,
        data: Value,
    },
}

impl Frame {
    pub fn parse(text: &str) -> BridgeResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        let flag = |name: &str| value.get(name).and_then(Value::as_bool).unwrap_or(false);
        let data = value.get("data").cloned().unwrap_or(Value::Null);

        if flag("request") {
            Ok(Self::Request {
                id: frame_id(&value)?,
                method: frame_method(&value)?,
                data,
            })
        } else if flag("response") {
            let id = frame_id(&value)?;
            let result = if flag("ok") {
                Ok(data)
            } else {
                let code = value
                    .get("errorCode")
                    .and_then(Value::as_u64)
                    .and_then(|c| u16::try_from(c).ok())
                    .unwrap_or(500);
                let reason = value
                    .get("errorReason")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Err(RemoteError { code, reason })
            };
            Ok(Self::Response { id, result })
        } else if flag("notification") {
            Ok(Self::Notification {
                method: frame_method(&value)?,
                data,
            })
        } else {
            Err(BridgeError::MalformedFrame(
                "frame is neither request, response nor notification".into(),
            ))
        }
    }

    pub fn to_json(&self) -> String {
        let value = match self {
            Self::Request { id, method, data } => json!({
                "request": true,
                "id": id,
                "method": method,
                "data": data,
            }),
            Self::Response { id, result: Ok(data) } => json!({
                "response": true,
                "id": id,
                "ok": true,
                "data": data,
            }),
            Self::Response { id, result: Err(err) } => json!({
                "response": true,
                "id": id,
                "ok": false,
                "errorCode": err.code,
                "errorReason": err.reason,
            }),
            Self::Notification { method, data } => json!({
                "notification": true,
                "method": method,
                "data": data,
            }),
        };
        value.to_string()
    }
}

fn frame_id(value: &Value) -> BridgeResult<u64> {
    value
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| BridgeError::MalformedFrame("missing numeric id".into()))
}

fn frame_method(value: &Value) -> BridgeResult<String> {
    value
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| BridgeError::MalformedFrame("missing method".into()))
}

/// Decode a payload, naming the method in the error.
pub fn decode<T: serde::de::DeserializeOwned>(method: &str, data: Value) -> BridgeResult<T> {
    serde_json::from_value(data)
        .map_err(|e| BridgeError::MalformedFrame(format!("{method}: {e}")))
}

// === Payloads ===

/// `createWebRtcTransport` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: String,
    #[serde(default)]
    pub ice_parameters: Value,
    #[serde(default)]
    pub ice_candidates: Value,
    #[serde(default)]
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// `join` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
    /// Recently active speakers, most recent first.
    #[serde(default)]
    pub last_n_history: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConsumer {
    pub peer_id: String,
    pub producer_id: String,
    pub id: String,
    pub kind: MediaKind,
    #[serde(default)]
    pub rtp_parameters: Value,
    #[serde(default)]
    pub app_data: Value,
    #[serde(default)]
    pub producer_paused: bool,
}

/// Payload of `consumerClosed`, `consumerPaused` and `consumerResumed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRef {
    pub consumer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerScore {
    pub consumer_id: String,
    #[serde(default)]
    pub score: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSpeaker {
    #[serde(default)]
    pub peer_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomReady {
    #[serde(default)]
    pub turn_servers: Vec<TurnServer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerClosed {
    pub peer_id: String,
}

/// `produce` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProduceResponse {
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_three_shapes() {
        let req = Frame::parse(r#"{"request":true,"id":3,"method":"newConsumer","data":{"a":1}}"#)
            .unwrap();
        assert_eq!(
            req,
            Frame::Request {
                id: 3,
                method: "newConsumer".into(),
                data: json!({"a": 1}),
            }
        );

        let ok = Frame::parse(r#"{"response":true,"id":3,"ok":true,"data":{}}"#).unwrap();
        assert_eq!(ok, Frame::Response { id: 3, result: Ok(json!({})) });

        let err = Frame::parse(
            r#"{"response":true,"id":4,"ok":false,"errorCode":403,"errorReason":"locked"}"#,
        )
        .unwrap();
        assert_eq!(
            err,
            Frame::Response {
                id: 4,
                result: Err(RemoteError::new(403, "locked")),
            }
        );

        let note = Frame::parse(r#"{"notification":true,"method":"roomBack"}"#).unwrap();
        assert_eq!(
            note,
            Frame::Notification {
                method: "roomBack".into(),
                data: Value::Null,
            }
        );
    }

    #[test]
    fn rejects_unknown_shapes() {
        assert!(matches!(
            Frame::parse(r#"{"hello":true}"#),
            Err(BridgeError::MalformedFrame(_))
        ));
        assert!(matches!(
            Frame::parse(r#"{"request":true,"method":"join"}"#),
            Err(BridgeError::MalformedFrame(_))
        ));
        assert!(matches!(Frame::parse("not json"), Err(BridgeError::Json(_))));
    }

    #[test]
    fn error_response_serializes_error_fields() {
        let frame = Frame::Response {
            id: 9,
            result: Err(RemoteError::new(500, "unknown request.method \"x\"")),
        };
        let value: Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(value["ok"], json!(false));
        assert_eq!(value["errorCode"], json!(500));
        assert_eq!(Frame::parse(&frame.to_json()).unwrap(), frame);
    }

    #[test]
    fn new_consumer_payload_is_camel_case() {
        let consumer: NewConsumer = decode(
            method::NEW_CONSUMER,
            json!({
                "peerId": "p1",
                "producerId": "prod",
                "id": "c1",
                "kind": "video",
                "rtpParameters": {},
                "appData": {"source": "webcam"},
                "producerPaused": false
            }),
        )
        .unwrap();
        assert_eq!(consumer.kind, MediaKind::Video);
        assert_eq!(consumer.peer_id, "p1");
    }

    #[test]
    fn join_response_tolerates_missing_history() {
        let join: JoinResponse =
            decode(method::JOIN, json!({"peers": [{"id": "a", "displayName": "Ann"}]})).unwrap();
        assert_eq!(join.peers[0].display_name.as_deref(), Some("Ann"));
        assert!(join.last_n_history.is_empty());
    }
}
