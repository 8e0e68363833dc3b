//! Call-control seam.
//!
//! The SIP user agent lives behind [`CallLeg`]; a session only needs to
//! accept, terminate, read a few invite properties, and receive state changes
//! and INFO requests as [`CallEvent`]s in arrival order.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::oneshot;

use dialbridge_common::{BridgeResult, MediaTrack};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Initial,
    Establishing,
    Established,
    Terminating,
    Terminated,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminating | Self::Terminated)
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initial => "initial",
            Self::Establishing => "establishing",
            Self::Established => "established",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Media offered when accepting the invite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoReply {
    Accepted,
    Rejected,
}

/// An in-dialog INFO request awaiting a reply.
#[derive(Debug)]
pub struct InfoRequest {
    pub content_type: Option<String>,
    pub body: String,
    reply: oneshot::Sender<InfoReply>,
}

impl InfoRequest {
    pub fn new(
        content_type: Option<String>,
        body: impl Into<String>,
    ) -> (Self, oneshot::Receiver<InfoReply>) {
        let (reply, rx) = oneshot::channel();
        let request = Self {
            content_type,
            body: body.into(),
            reply,
        };
        (request, rx)
    }

    pub fn accept(self) {
        let _ = self.reply.send(InfoReply::Accepted);
    }

    pub fn reject(self) {
        let _ = self.reply.send(InfoReply::Rejected);
    }
}

#[derive(Debug)]
pub enum CallEvent {
    StateChanged(CallState),
    Info(InfoRequest),
}

/// One inbound call as seen by the bridge.
#[async_trait]
pub trait CallLeg: Send + Sync {
    /// Protocol-assigned session id.
    fn id(&self) -> &str;

    /// Display name from the caller's identity, if any.
    fn remote_display_name(&self) -> Option<String>;

    /// Header from the initial INVITE.
    fn header(&self, name: &str) -> Option<String>;

    /// Answer the call. The adapter looks up the session's outbound media
    /// in the [`SessionRegistry`](crate::registry::SessionRegistry).
    async fn accept(&self, constraints: MediaConstraints) -> BridgeResult<()>;

    /// The caller's inbound audio, once media is flowing.
    fn remote_audio(&self) -> Option<MediaTrack>;

    async fn terminate(&self) -> BridgeResult<()>;
}
