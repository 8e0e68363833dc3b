//! In-process room server and simulated device.
//!
//! [`loopback_pair`] gives a client-side [`ChannelHandle`] backed by the real
//! [`Requester`], plus a [`LoopbackServer`] that sees every frame the client
//! sends and can push notifications, server requests and connection changes.
//! The simulated device records what the client asks of it and produces
//! tracks that can be fed by hand.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use dialbridge_common::{BridgeResult, MediaKind, MediaTrack};

use crate::capabilities::RouterCapabilities;
use crate::channel::{ChannelConnector, ChannelEvent, ChannelHandle, Responder, SignalingChannel};
use crate::device::{
    ConsumeParams, DeviceFactory, ProduceParams, RecvTransport, RtcDevice, SendTransport,
    TransportOptions, TransportSignaling,
};
use crate::protocol::{Frame, PeerInfo, RemoteError, method};
use crate::request::Requester;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct LoopbackChannel {
    requester: Arc<Requester>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl SignalingChannel for LoopbackChannel {
    async fn request(&self, method: &str, data: Value) -> BridgeResult<Value> {
        self.requester.request(method, data).await
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.requester.disconnect();
    }
}

/// Create a connected client channel and the server end that drives it.
pub fn loopback_pair(request_timeout: Duration) -> (ChannelHandle, LoopbackServer) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let requester = Arc::new(Requester::new(request_timeout, out_tx));
    let closed = Arc::new(AtomicBool::new(false));

    requester.set_connected(true);
    let _ = events_tx.send(ChannelEvent::Connected);

    let handle = ChannelHandle {
        channel: Arc::new(LoopbackChannel {
            requester: requester.clone(),
            closed: closed.clone(),
        }),
        events: events_rx,
    };
    let server = LoopbackServer {
        frames: out_rx,
        control: LoopbackControl {
            requester,
            events: events_tx,
            log: Arc::new(Mutex::new(Vec::new())),
            closed,
            next_id: Arc::new(AtomicU64::new(1)),
        },
    };
    (handle, server)
}

/// Server end of a loopback channel before it starts answering.
pub struct LoopbackServer {
    /// Frames sent by the client.
    pub frames: mpsc::UnboundedReceiver<Frame>,
    control: LoopbackControl,
}

impl LoopbackServer {
    pub fn control(&self) -> LoopbackControl {
        self.control.clone()
    }

    /// Answer every client request with `handler` on a background task.
    pub fn serve<F>(self, mut handler: F) -> (LoopbackControl, JoinHandle<()>)
    where
        F: FnMut(&str, &Value) -> Option<Result<Value, RemoteError>> + Send + 'static,
    {
        let Self { mut frames, control } = self;
        let task_control = control.clone();
        let task = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                let Frame::Request { id, method, data } = frame else {
                    continue;
                };
                lock(&task_control.log).push((method.clone(), data.clone()));
                if let Some(result) = handler(&method, &data) {
                    task_control.requester.resolve(id, result);
                }
            }
        });
        (control, task)
    }
}

/// Reply to one server-originated request.
pub struct ServerRequest {
    replies: mpsc::UnboundedReceiver<Frame>,
}

impl ServerRequest {
    /// Wait for the client's answer. `None` if the client dropped the request.
    pub async fn response(mut self) -> Option<Result<Value, RemoteError>> {
        match self.replies.recv().await {
            Some(Frame::Response { result, .. }) => Some(result),
            _ => None,
        }
    }
}

/// Handle for pushing server-side traffic at the client.
#[derive(Clone)]
pub struct LoopbackControl {
    requester: Arc<Requester>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    log: Arc<Mutex<Vec<(String, Value)>>>,
    closed: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
}

impl LoopbackControl {
    pub fn notify(&self, method: &str, data: Value) {
        let _ = self.events.send(ChannelEvent::Notification {
            method: method.to_string(),
            data,
        });
    }

    pub fn request(&self, method: &str, data: Value) -> ServerRequest {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(ChannelEvent::Request {
            method: method.to_string(),
            data,
            responder: Responder::new(id, tx),
        });
        ServerRequest { replies: rx }
    }

    /// Drop the connection; the client should expect a reconnect.
    pub fn disconnect(&self) {
        self.requester.disconnect();
        let _ = self.events.send(ChannelEvent::Disconnected);
    }

    pub fn reconnect(&self) {
        self.requester.set_connected(true);
        let _ = self.events.send(ChannelEvent::Connected);
    }

    /// Give up on the connection for good.
    pub fn close(&self) {
        self.requester.disconnect();
        let _ = self.events.send(ChannelEvent::Closed);
    }

    /// Whether the client closed its channel.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Every request the server answered, in order.
    pub fn requests(&self) -> Vec<(String, Value)> {
        lock(&self.log).clone()
    }

    pub fn count(&self, method: &str) -> usize {
        lock(&self.log).iter().filter(|(m, _)| m == method).count()
    }

    pub fn clear_log(&self) {
        lock(&self.log).clear();
    }
}

/// Router capabilities with one audio and one video codec plus the
/// orientation extension the client is expected to strip.
pub fn default_capabilities() -> Value {
    json!({
        "codecs": [
            { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
            { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }
        ],
        "headerExtensions": [
            { "kind": "audio", "uri": "urn:ietf:params:rtp-hdrext:sdes:mid", "preferredId": 1 },
            { "kind": "video", "uri": "urn:ietf:params:rtp-hdrext:sdes:mid", "preferredId": 1 },
            { "kind": "video", "uri": "urn:3gpp:video-orientation", "preferredId": 4 }
        ]
    })
}

/// Canned answers for a room with a fixed membership.
#[derive(Debug, Clone)]
pub struct RoomScript {
    pub capabilities: Value,
    pub peers: Vec<PeerInfo>,
    pub last_n_history: Vec<String>,
    /// Method answered with a 500 instead of its canned reply.
    pub fail_on: Option<String>,
    /// Method logged but never answered, so the client's request times out.
    pub withhold: Option<String>,
}

impl Default for RoomScript {
    fn default() -> Self {
        Self {
            capabilities: default_capabilities(),
            peers: Vec::new(),
            last_n_history: Vec::new(),
            fail_on: None,
            withhold: None,
        }
    }
}

impl RoomScript {
    pub fn with_peers(peers: &[&str]) -> Self {
        Self {
            peers: peers
                .iter()
                .map(|id| PeerInfo {
                    id: id.to_string(),
                    display_name: None,
                })
                .collect(),
            ..Self::default()
        }
    }

    /// Reply for `method`, or `None` to leave the request unanswered.
    pub fn respond(&mut self, method: &str, data: &Value) -> Option<Result<Value, RemoteError>> {
        if self.withhold.as_deref() == Some(method) {
            return None;
        }
        if self.fail_on.as_deref() == Some(method) {
            return Some(Err(RemoteError::new(500, "scripted failure")));
        }
        Some(Ok(match method {
            method::GET_ROUTER_RTP_CAPABILITIES => self.capabilities.clone(),
            method::CREATE_WEBRTC_TRANSPORT => {
                let producing = data.get("producing").and_then(Value::as_bool).unwrap_or(false);
                json!({
                    "id": if producing { "send-transport" } else { "recv-transport" },
                    "iceParameters": { "usernameFragment": "u", "password": "p" },
                    "iceCandidates": [],
                    "dtlsParameters": { "role": "auto", "fingerprints": [] }
                })
            }
            method::PRODUCE => {
                let kind = data.get("kind").and_then(Value::as_str).unwrap_or("unknown");
                json!({ "id": format!("producer-{kind}") })
            }
            method::JOIN => json!({
                "peers": self.peers,
                "lastNHistory": self.last_n_history,
            }),
            _ => json!({}),
        }))
    }

    pub fn into_handler(
        mut self,
    ) -> impl FnMut(&str, &Value) -> Option<Result<Value, RemoteError>> + Send + 'static {
        move |method: &str, data: &Value| self.respond(method, data)
    }
}

/// Hands out one prepared channel.
pub struct LoopbackConnector {
    handle: Mutex<Option<ChannelHandle>>,
}

impl LoopbackConnector {
    pub fn new(handle: ChannelHandle) -> Self {
        Self {
            handle: Mutex::new(Some(handle)),
        }
    }
}

#[async_trait]
impl ChannelConnector for LoopbackConnector {
    async fn connect(&self, _peer_id: &str, _room_id: &str) -> BridgeResult<ChannelHandle> {
        lock(&self.handle)
            .take()
            .ok_or(dialbridge_common::BridgeError::NotConnected)
    }
}

#[derive(Default)]
struct DeviceRecord {
    entries: Vec<String>,
    loaded: Vec<RouterCapabilities>,
    app_data: Vec<Value>,
    signaling: Vec<(String, Arc<dyn TransportSignaling>)>,
}

/// Shared record of everything simulated devices were asked to do.
#[derive(Clone, Default)]
pub struct DeviceLog {
    inner: Arc<Mutex<DeviceRecord>>,
}

impl DeviceLog {
    fn push(&self, entry: impl Into<String>) {
        lock(&self.inner).entries.push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.inner).entries.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        lock(&self.inner)
            .entries
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    /// Capabilities passed to the most recent `load`.
    pub fn loaded_capabilities(&self) -> Option<RouterCapabilities> {
        lock(&self.inner).loaded.last().cloned()
    }

    /// `appData` of every produced track, in order.
    pub fn produced_app_data(&self) -> Vec<Value> {
        lock(&self.inner).app_data.clone()
    }

    /// Report transport `id` as closed underneath the client.
    pub fn close_transport(&self, id: &str) {
        let signaling = lock(&self.inner)
            .signaling
            .iter()
            .rev()
            .find(|(t, _)| t == id)
            .map(|(_, s)| s.clone());
        if let Some(signaling) = signaling {
            signaling.transport_closed(id);
        }
    }
}

pub struct SimulatedDeviceFactory {
    log: DeviceLog,
    video: bool,
}

impl SimulatedDeviceFactory {
    pub fn new() -> Self {
        Self {
            log: DeviceLog::default(),
            video: true,
        }
    }

    /// Devices that refuse to produce video.
    pub fn audio_only() -> Self {
        Self {
            video: false,
            ..Self::new()
        }
    }

    pub fn log(&self) -> DeviceLog {
        self.log.clone()
    }
}

impl Default for SimulatedDeviceFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceFactory for SimulatedDeviceFactory {
    fn create(&self) -> Box<dyn RtcDevice> {
        self.log.push("create");
        Box::new(SimulatedDevice {
            log: self.log.clone(),
            video: self.video,
            capabilities: None,
        })
    }
}

struct SimulatedDevice {
    log: DeviceLog,
    video: bool,
    capabilities: Option<RouterCapabilities>,
}

#[async_trait]
impl RtcDevice for SimulatedDevice {
    async fn load(&mut self, capabilities: &RouterCapabilities) -> BridgeResult<()> {
        self.log.push("load");
        lock(&self.log.inner).loaded.push(capabilities.clone());
        self.capabilities = Some(capabilities.clone());
        Ok(())
    }

    fn rtp_capabilities(&self) -> Value {
        self.capabilities
            .as_ref()
            .map(RouterCapabilities::to_value)
            .unwrap_or(Value::Null)
    }

    fn can_produce(&self, kind: MediaKind) -> bool {
        let offered = self.capabilities.as_ref().is_some_and(|c| c.supports(kind));
        offered && (kind == MediaKind::Audio || self.video)
    }

    async fn create_send_transport(
        &self,
        options: TransportOptions,
        signaling: Arc<dyn TransportSignaling>,
    ) -> BridgeResult<Box<dyn SendTransport>> {
        self.log.push(format!("send-transport:{}", options.id));
        lock(&self.log.inner)
            .signaling
            .push((options.id.clone(), signaling.clone()));
        Ok(Box::new(SimulatedTransport::new(options, signaling, self.log.clone())))
    }

    async fn create_recv_transport(
        &self,
        options: TransportOptions,
        signaling: Arc<dyn TransportSignaling>,
    ) -> BridgeResult<Box<dyn RecvTransport>> {
        self.log.push(format!("recv-transport:{}", options.id));
        lock(&self.log.inner)
            .signaling
            .push((options.id.clone(), signaling.clone()));
        Ok(Box::new(SimulatedTransport::new(options, signaling, self.log.clone())))
    }
}

struct SimulatedTransport {
    id: String,
    dtls_parameters: Value,
    signaling: Arc<dyn TransportSignaling>,
    connected: bool,
    log: DeviceLog,
}

impl SimulatedTransport {
    fn new(options: TransportOptions, signaling: Arc<dyn TransportSignaling>, log: DeviceLog) -> Self {
        Self {
            id: options.id,
            dtls_parameters: options.dtls_parameters,
            signaling,
            connected: false,
            log,
        }
    }

    /// DTLS connect happens on first use, as a real transport does.
    async fn ensure_connected(&mut self) -> BridgeResult<()> {
        if !self.connected {
            self.signaling
                .connect(&self.id, self.dtls_parameters.clone())
                .await?;
            self.connected = true;
        }
        Ok(())
    }
}

#[async_trait]
impl SendTransport for SimulatedTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn produce(&mut self, params: ProduceParams) -> BridgeResult<String> {
        self.ensure_connected().await?;
        let kind = params.track.kind();
        let id = self
            .signaling
            .produce(&self.id, kind, json!({ "codecs": [] }), params.app_data.clone())
            .await?;
        self.log.push(format!("produce:{kind}"));
        lock(&self.log.inner).app_data.push(params.app_data);
        Ok(id)
    }

    fn close_producer(&mut self, producer_id: &str) {
        self.log.push(format!("close-producer:{producer_id}"));
    }

    fn close(&mut self) {
        self.log.push(format!("close:{}", self.id));
    }
}

#[async_trait]
impl RecvTransport for SimulatedTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn consume(&mut self, params: ConsumeParams) -> BridgeResult<MediaTrack> {
        self.ensure_connected().await?;
        self.log.push(format!("consume:{}", params.id));
        Ok(MediaTrack::with_id(params.id, params.kind))
    }

    fn pause_consumer(&mut self, consumer_id: &str) {
        self.log.push(format!("pause:{consumer_id}"));
    }

    fn resume_consumer(&mut self, consumer_id: &str) {
        self.log.push(format!("resume:{consumer_id}"));
    }

    fn close_consumer(&mut self, consumer_id: &str) {
        self.log.push(format!("close-consumer:{consumer_id}"));
    }

    fn close(&mut self) {
        self.log.push(format!("close:{}", self.id));
    }
}
