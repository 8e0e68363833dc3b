//! Persistent, reconnecting signaling channel.
//!
//! The conference client only sees [`SignalingChannel`] (RPC with timeout)
//! and a stream of [`ChannelEvent`]s. [`WsChannel`] is the WebSocket
//! implementation: one background task owns the socket, reconnects with
//! exponential backoff, and feeds inbound frames to the RPC table or the
//! event stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use dialbridge_common::config::ConferenceConfig;
use dialbridge_common::{BridgeError, BridgeResult};

use crate::protocol::{Frame, RemoteError};
use crate::request::Requester;

/// Maximum reconnect backoff.
const MAX_BACKOFF_SECS: u64 = 30;

/// RPC side of a signaling channel.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn request(&self, method: &str, data: Value) -> BridgeResult<Value>;

    /// Stop the channel. In-flight requests fail with `ChannelClosed`.
    fn close(&self);
}

/// Everything the channel reports besides RPC responses.
#[derive(Debug)]
pub enum ChannelEvent {
    Connected,
    /// The connection dropped; a reconnect attempt follows.
    Disconnected,
    /// The channel gave up or was closed. No further events follow.
    Closed,
    Notification {
        method: String,
        data: Value,
    },
    /// Server-originated request; answer through `responder`.
    Request {
        method: String,
        data: Value,
        responder: Responder,
    },
}

/// Reply slot for one server-originated request.
#[derive(Debug)]
pub struct Responder {
    id: u64,
    reply: mpsc::UnboundedSender<Frame>,
}

impl Responder {
    pub fn new(id: u64, reply: mpsc::UnboundedSender<Frame>) -> Self {
        Self { id, reply }
    }

    pub fn ok(self, data: Value) {
        let _ = self.reply.send(Frame::Response {
            id: self.id,
            result: Ok(data),
        });
    }

    pub fn error(self, code: u16, reason: impl Into<String>) {
        let _ = self.reply.send(Frame::Response {
            id: self.id,
            result: Err(RemoteError::new(code, reason)),
        });
    }
}

/// A connected channel plus its event stream.
pub struct ChannelHandle {
    pub channel: Arc<dyn SignalingChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Opens a signaling channel for a peer in a room.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, peer_id: &str, room_id: &str) -> BridgeResult<ChannelHandle>;
}

/// Route one inbound frame to the RPC table or the event stream.
pub fn dispatch_inbound(
    frame: Frame,
    requester: &Requester,
    events: &mpsc::UnboundedSender<ChannelEvent>,
) {
    match frame {
        Frame::Response { id, result } => {
            requester.resolve(id, result);
        }
        Frame::Request { id, method, data } => {
            tracing::debug!(id, method = %method, "Signaling request from server");
            let responder = Responder::new(id, requester.outbound());
            let _ = events.send(ChannelEvent::Request {
                method,
                data,
                responder,
            });
        }
        Frame::Notification { method, data } => {
            tracing::debug!(method = %method, "Signaling notification");
            let _ = events.send(ChannelEvent::Notification { method, data });
        }
    }
}

/// Signaling URL for a peer joining `room_id`.
pub fn signaling_url(host: &str, port: u16, peer_id: &str, room_id: &str) -> BridgeResult<String> {
    let mut url = url::Url::parse(&format!("wss://{host}:{port}/"))?;
    url.query_pairs_mut()
        .append_pair("peerId", peer_id)
        .append_pair("roomId", room_id);
    Ok(url.into())
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub request_timeout: Duration,
    pub max_reconnect: u32,
}

impl ChannelOptions {
    pub fn from_config(config: &ConferenceConfig) -> Self {
        Self {
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            max_reconnect: config.max_reconnect,
        }
    }
}

/// WebSocket signaling channel.
pub struct WsChannel {
    requester: Arc<Requester>,
    cancel: CancellationToken,
}

impl WsChannel {
    /// Spawn the connection task and return immediately.
    ///
    /// `Connected` is reported once the socket is up; requests made before
    /// that fail with `NotConnected`.
    pub fn connect(url: impl Into<String>, options: ChannelOptions) -> ChannelHandle {
        let url = url.into();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let requester = Arc::new(Requester::new(options.request_timeout, out_tx));
        let cancel = CancellationToken::new();

        tokio::spawn(run_channel(
            url,
            options.max_reconnect,
            requester.clone(),
            out_rx,
            events_tx,
            cancel.clone(),
        ));

        ChannelHandle {
            channel: Arc::new(Self { requester, cancel }),
            events: events_rx,
        }
    }
}

#[async_trait]
impl SignalingChannel for WsChannel {
    async fn request(&self, method: &str, data: Value) -> BridgeResult<Value> {
        self.requester.request(method, data).await
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_channel(
    url: String,
    max_reconnect: u32,
    requester: Arc<Requester>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    cancel: CancellationToken,
) {
    let mut attempts = 0u32;
    loop {
        match run_once(&url, &requester, &mut outbound, &events, &cancel, &mut attempts).await {
            Ok(()) => break,
            Err(e) => {
                attempts += 1;
                if attempts > max_reconnect {
                    tracing::error!(url = %url, error = %e, "Signaling: max reconnect attempts reached");
                    break;
                }
                let delay = Duration::from_secs(backoff_secs(attempts));
                tracing::warn!(
                    error = %e,
                    attempt = attempts,
                    "Signaling: disconnected, reconnecting in {delay:?}"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(delay) => {}
                }
            }
        }
    }

    requester.disconnect();
    let _ = events.send(ChannelEvent::Closed);
    tracing::debug!(url = %url, "Signaling channel closed");
}

/// 2^attempts seconds, capped at [`MAX_BACKOFF_SECS`] for any attempt count.
fn backoff_secs(attempts: u32) -> u64 {
    1u64.checked_shl(attempts)
        .unwrap_or(u64::MAX)
        .min(MAX_BACKOFF_SECS)
}

/// One connection lifetime. `Ok` means the channel was closed locally.
async fn run_once(
    url: &str,
    requester: &Requester,
    outbound: &mut mpsc::UnboundedReceiver<Frame>,
    events: &mpsc::UnboundedSender<ChannelEvent>,
    cancel: &CancellationToken,
    attempts: &mut u32,
) -> BridgeResult<()> {
    let ws = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        conn = connect_async(url) => conn?.0,
    };
    let (mut sink, mut stream) = ws.split();

    // Replies queued for the previous connection are meaningless now.
    while outbound.try_recv().is_ok() {}

    *attempts = 0;
    requester.set_connected(true);
    let _ = events.send(ChannelEvent::Connected);
    tracing::info!(url = %url, "Signaling connected");

    let result: BridgeResult<()> = async {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                frame = outbound.recv() => {
                    let Some(frame) = frame else { return Ok(()) };
                    sink.send(Message::Text(frame.to_json().into())).await?;
                }
                msg = stream.next() => {
                    let Some(msg) = msg else { return Err(BridgeError::ChannelClosed) };
                    let text = match msg? {
                        Message::Text(t) => t.as_str().to_owned(),
                        Message::Close(_) => return Err(BridgeError::ChannelClosed),
                        _ => continue,
                    };
                    match Frame::parse(&text) {
                        Ok(frame) => dispatch_inbound(frame, requester, events),
                        Err(e) => tracing::warn!(error = %e, "Dropping malformed signaling frame"),
                    }
                }
            }
        }
    }
    .await;

    requester.disconnect();
    if result.is_err() {
        let _ = events.send(ChannelEvent::Disconnected);
    }
    result
}

/// Connects to the configured conference server over WebSocket.
pub struct WsConnector {
    host: String,
    port: u16,
    options: ChannelOptions,
}

impl WsConnector {
    pub fn new(config: &ConferenceConfig) -> Self {
        Self {
            host: config.host_name.clone(),
            port: config.port,
            options: ChannelOptions::from_config(config),
        }
    }
}

#[async_trait]
impl ChannelConnector for WsConnector {
    async fn connect(&self, peer_id: &str, room_id: &str) -> BridgeResult<ChannelHandle> {
        let url = signaling_url(&self.host, self.port, peer_id, room_id)?;
        tracing::debug!(url = %url, "Opening signaling channel");
        Ok(WsChannel::connect(url, self.options.clone()))
    }
}
