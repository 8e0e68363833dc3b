//! Conference gateway client.
//!
//! One actor task per session owns the signaling channel, the device, both
//! transports, the producers and the consumers. Channel events, transport
//! callbacks and handle commands are processed one at a time in arrival
//! order; RPCs made while handling an event suspend only this actor.
//!
//! ```text
//!   ConferenceHandle ──Command──▶ ┌────────────┐ ──RPC──▶ SignalingChannel
//!   SignalingChannel ──Event────▶ │ ClientActor│ ──add/remove──▶ MixerHandle
//!   Transports ──TransportEvent─▶ └────────────┘ ──ConferenceEvent──▶ session
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use dialbridge_common::config::{ConferenceConfig, TurnServer};
use dialbridge_common::{BridgeError, BridgeResult, MediaKind, MediaTrack};
use dialbridge_mixer::MixerHandle;

use crate::capabilities::{RouterCapabilities, VIDEO_ORIENTATION};
use crate::channel::{ChannelConnector, ChannelEvent, ChannelHandle, Responder, SignalingChannel};
use crate::device::{
    CodecOptions, ConsumeParams, DeviceFactory, ProduceParams, RecvTransport, RtcDevice,
    SendTransport, TransportDirection, TransportOptions, TransportSignaling,
};
use crate::protocol::{
    self, ActiveSpeaker, ConsumerRef, ConsumerScore, JoinResponse, NewConsumer, PeerClosed,
    PeerInfo, ProduceResponse, RoomReady, TransportInfo, method,
};
use crate::spotlight::SpotlightSelector;

/// Per-session parameters for joining a room.
#[derive(Debug, Clone)]
pub struct ConferenceOptions {
    pub room_id: String,
    pub peer_id: String,
    pub display_name: String,
    pub force_tcp: bool,
    /// Spotlight bound.
    pub last_n: usize,
    /// ICE servers used until `roomReady` provides its own.
    pub turn_servers: Vec<TurnServer>,
}

impl ConferenceOptions {
    pub fn new(
        config: &ConferenceConfig,
        room_id: impl Into<String>,
        peer_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            peer_id: peer_id.into(),
            display_name: display_name.into(),
            force_tcp: config.force_tcp,
            last_n: config.last_n,
            turn_servers: config.turn_servers.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Closed through [`ConferenceHandle::close`].
    Requested,
    /// A negotiation step of the join sequence failed.
    JoinFailed,
    /// Removed by a room moderator.
    Kicked,
    /// The signaling channel gave up reconnecting.
    ChannelClosed,
}

/// Reported to the owning session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConferenceEvent {
    /// The join sequence completed (also after a `roomBack` re-join).
    Joined { peer_count: usize },
    /// The client tore everything down. Always the last event.
    Closed { reason: CloseReason },
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerSnapshot {
    pub id: String,
    pub kind: MediaKind,
    pub peer_id: String,
    pub producer_id: String,
    pub paused: bool,
    pub remotely_paused: bool,
    pub score: Option<Value>,
}

/// Point-in-time view of the client, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    pub peer_id: String,
    pub room_id: String,
    pub joined: bool,
    pub spotlights: Vec<String>,
    pub consumers: Vec<ConsumerSnapshot>,
    pub producers: Vec<MediaKind>,
}

enum Command {
    Enable {
        kind: MediaKind,
        track: MediaTrack,
        reply: oneshot::Sender<BridgeResult<()>>,
    },
    Disable {
        kind: MediaKind,
        reply: oneshot::Sender<BridgeResult<()>>,
    },
    PauseConsumer {
        id: String,
        reply: oneshot::Sender<BridgeResult<bool>>,
    },
    ResumeConsumer {
        id: String,
        reply: oneshot::Sender<BridgeResult<bool>>,
    },
    Snapshot {
        reply: oneshot::Sender<ClientSnapshot>,
    },
}

#[derive(Debug)]
enum TransportEvent {
    Closed { transport_id: String },
}

enum Step {
    Channel(ChannelEvent),
    Transport(TransportEvent),
    Command(Command),
    Close(CloseReason),
}

/// Builds conference clients for sessions.
#[derive(Clone)]
pub struct ConferenceClient {
    connector: Arc<dyn ChannelConnector>,
    devices: Arc<dyn DeviceFactory>,
}

impl ConferenceClient {
    pub fn new(connector: Arc<dyn ChannelConnector>, devices: Arc<dyn DeviceFactory>) -> Self {
        Self { connector, devices }
    }

    /// Open the signaling channel and start the client actor.
    ///
    /// Returns as soon as the channel is opening; the join sequence runs when
    /// the room reports ready and its outcome arrives as a [`ConferenceEvent`].
    pub async fn join(
        &self,
        options: ConferenceOptions,
        mixer: MixerHandle,
    ) -> BridgeResult<(ConferenceHandle, mpsc::UnboundedReceiver<ConferenceEvent>)> {
        let ChannelHandle {
            channel,
            events: channel_events,
        } = self
            .connector
            .connect(&options.peer_id, &options.room_id)
            .await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let signaling: Arc<dyn TransportSignaling> = Arc::new(ClientSignaling {
            channel: channel.clone(),
            transport_events: transport_tx,
        });

        tracing::info!(
            room = %options.room_id,
            peer = %options.peer_id,
            "Conference client started"
        );

        let handle = ConferenceHandle {
            commands: commands_tx,
            cancel: cancel.clone(),
            task: Arc::new(Mutex::new(None)),
            peer_id: options.peer_id.clone(),
            room_id: options.room_id.clone(),
        };

        let actor = ClientActor {
            spotlight: SpotlightSelector::new(options.last_n),
            turn_servers: options.turn_servers.clone(),
            options,
            channel,
            signaling,
            devices: self.devices.clone(),
            mixer,
            events: events_tx,
            device: None,
            send: None,
            recv: None,
            producers: HashMap::new(),
            local_tracks: HashMap::new(),
            consumers: HashMap::new(),
            joined: false,
        };
        let task = tokio::spawn(actor.run(channel_events, commands_rx, transport_rx, cancel));
        *handle.task.lock().await = Some(task);

        Ok((handle, events_rx))
    }
}

/// Cloneable control handle for one conference client.
#[derive(Clone)]
pub struct ConferenceHandle {
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
    peer_id: String,
    room_id: String,
}

impl ConferenceHandle {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Produce `track` as the microphone. Deferred until joined; kept for re-joins.
    pub async fn enable_audio(&self, track: MediaTrack) -> BridgeResult<()> {
        self.call(|reply| Command::Enable {
            kind: MediaKind::Audio,
            track,
            reply,
        })
        .await?
    }

    pub async fn enable_video(&self, track: MediaTrack) -> BridgeResult<()> {
        self.call(|reply| Command::Enable {
            kind: MediaKind::Video,
            track,
            reply,
        })
        .await?
    }

    pub async fn disable_audio(&self) -> BridgeResult<()> {
        self.call(|reply| Command::Disable {
            kind: MediaKind::Audio,
            reply,
        })
        .await?
    }

    pub async fn disable_video(&self) -> BridgeResult<()> {
        self.call(|reply| Command::Disable {
            kind: MediaKind::Video,
            reply,
        })
        .await?
    }

    /// Pause a consumer. `Ok(false)` if it was already paused or is unknown.
    pub async fn pause_consumer(&self, id: &str) -> BridgeResult<bool> {
        let id = id.to_string();
        self.call(|reply| Command::PauseConsumer { id, reply }).await?
    }

    /// Resume a consumer. `Ok(false)` if it was already active or is unknown.
    pub async fn resume_consumer(&self, id: &str) -> BridgeResult<bool> {
        let id = id.to_string();
        self.call(|reply| Command::ResumeConsumer { id, reply }).await?
    }

    pub async fn snapshot(&self) -> BridgeResult<ClientSnapshot> {
        self.call(|reply| Command::Snapshot { reply }).await
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.commands.is_closed()
    }

    /// Tear the client down and wait for the actor to finish.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> BridgeResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| BridgeError::ChannelClosed)?;
        rx.await.map_err(|_| BridgeError::ChannelClosed)
    }
}

/// Transport callbacks routed to the signaling channel and the actor.
struct ClientSignaling {
    channel: Arc<dyn SignalingChannel>,
    transport_events: mpsc::UnboundedSender<TransportEvent>,
}

#[async_trait]
impl TransportSignaling for ClientSignaling {
    async fn connect(&self, transport_id: &str, dtls_parameters: Value) -> BridgeResult<()> {
        self.channel
            .request(
                method::CONNECT_WEBRTC_TRANSPORT,
                json!({ "transportId": transport_id, "dtlsParameters": dtls_parameters }),
            )
            .await
            .map(|_| ())
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> BridgeResult<String> {
        let response = self
            .channel
            .request(
                method::PRODUCE,
                json!({
                    "transportId": transport_id,
                    "kind": kind,
                    "rtpParameters": rtp_parameters,
                    "appData": app_data,
                }),
            )
            .await?;
        let produced: ProduceResponse = protocol::decode(method::PRODUCE, response)?;
        Ok(produced.id)
    }

    fn transport_closed(&self, transport_id: &str) {
        let _ = self.transport_events.send(TransportEvent::Closed {
            transport_id: transport_id.to_string(),
        });
    }
}

struct LocalProducer {
    id: String,
}

struct Consumer {
    id: String,
    kind: MediaKind,
    peer_id: String,
    producer_id: String,
    track: MediaTrack,
    paused: bool,
    remotely_paused: bool,
    score: Option<Value>,
}

struct ClientActor {
    options: ConferenceOptions,
    channel: Arc<dyn SignalingChannel>,
    signaling: Arc<dyn TransportSignaling>,
    devices: Arc<dyn DeviceFactory>,
    mixer: MixerHandle,
    events: mpsc::UnboundedSender<ConferenceEvent>,
    spotlight: SpotlightSelector,
    turn_servers: Vec<TurnServer>,
    device: Option<Box<dyn RtcDevice>>,
    send: Option<Box<dyn SendTransport>>,
    recv: Option<Box<dyn RecvTransport>>,
    producers: HashMap<MediaKind, LocalProducer>,
    /// Tracks handed to `enable_*`, produced again after every join.
    local_tracks: HashMap<MediaKind, MediaTrack>,
    consumers: HashMap<String, Consumer>,
    joined: bool,
}

impl ClientActor {
    async fn run(
        mut self,
        mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Close(CloseReason::Requested),
                event = channel_events.recv() => match event {
                    Some(event) => Step::Channel(event),
                    None => Step::Close(CloseReason::ChannelClosed),
                },
                Some(event) = transport_events.recv() => Step::Transport(event),
                command = commands.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => Step::Close(CloseReason::Requested),
                },
            };

            let outcome = match step {
                Step::Close(reason) => Some(reason),
                step => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Some(CloseReason::Requested),
                    outcome = self.handle(step) => outcome,
                },
            };

            if let Some(reason) = outcome {
                self.teardown(reason);
                break;
            }
        }
    }

    async fn handle(&mut self, step: Step) -> Option<CloseReason> {
        match step {
            Step::Channel(event) => self.on_channel_event(event).await,
            Step::Transport(event) => {
                self.on_transport_event(event);
                None
            }
            Step::Command(command) => {
                self.on_command(command).await;
                None
            }
            Step::Close(reason) => Some(reason),
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Enable { kind, track, reply } => {
                let _ = reply.send(self.enable(kind, track).await);
            }
            Command::Disable { kind, reply } => {
                let _ = reply.send(self.disable(kind).await);
            }
            Command::PauseConsumer { id, reply } => {
                let _ = reply.send(self.pause_consumer(&id).await);
            }
            Command::ResumeConsumer { id, reply } => {
                let _ = reply.send(self.resume_consumer(&id).await);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn on_channel_event(&mut self, event: ChannelEvent) -> Option<CloseReason> {
        match event {
            ChannelEvent::Connected => {
                tracing::debug!(room = %self.options.room_id, "Signaling connected");
                None
            }
            ChannelEvent::Disconnected => {
                tracing::warn!(room = %self.options.room_id, "Signaling disconnected, dropping media");
                self.teardown_media();
                None
            }
            ChannelEvent::Closed => Some(CloseReason::ChannelClosed),
            ChannelEvent::Notification { method, data } => self.on_notification(&method, data).await,
            ChannelEvent::Request {
                method,
                data,
                responder,
            } => {
                self.on_request(&method, data, responder).await;
                None
            }
        }
    }

    async fn on_request(&mut self, method: &str, data: Value, responder: Responder) {
        match method {
            method::NEW_CONSUMER => match self.create_consumer(data).await {
                Ok(id) => {
                    responder.ok(Value::Null);
                    self.route_consumer(&id).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to create consumer");
                    responder.error(500, e.to_string());
                }
            },
            other => {
                tracing::debug!(method = %other, "Unknown request method");
                responder.error(500, format!("unknown request.method \"{other}\""));
            }
        }
    }

    async fn on_notification(&mut self, method: &str, data: Value) -> Option<CloseReason> {
        match method {
            method::ENTERED_LOBBY => {
                let name = json!({ "displayName": self.options.display_name });
                if let Err(e) = self.channel.request(method::CHANGE_DISPLAY_NAME, name).await {
                    tracing::warn!(error = %e, "changeDisplayName failed");
                }
            }
            method::ROOM_READY => {
                let ready = parse::<RoomReady>(method, data).unwrap_or_default();
                if !ready.turn_servers.is_empty() {
                    self.turn_servers = ready.turn_servers;
                }
                return self.join_or_fail().await;
            }
            method::ROOM_BACK => return self.join_or_fail().await,
            method::ACTIVE_SPEAKER => {
                let Some(ActiveSpeaker { peer_id: Some(peer) }) = parse::<ActiveSpeaker>(method, data) else {
                    return None;
                };
                if peer != self.options.peer_id {
                    let update = self.spotlight.handle_active_speaker(&peer);
                    self.apply_spotlights(update).await;
                }
            }
            method::NEW_CONSUMER => match self.create_consumer(data).await {
                Ok(id) => self.route_consumer(&id).await,
                Err(e) => tracing::warn!(error = %e, "Failed to create consumer"),
            },
            method::CONSUMER_CLOSED => {
                if let Some(ConsumerRef { consumer_id }) = parse::<ConsumerRef>(method, data) {
                    self.close_consumer(&consumer_id);
                }
            }
            method::CONSUMER_PAUSED | method::CONSUMER_RESUMED => {
                if let Some(ConsumerRef { consumer_id }) = parse::<ConsumerRef>(method, data) {
                    if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
                        consumer.remotely_paused = method == method::CONSUMER_PAUSED;
                        tracing::debug!(
                            consumer = %consumer_id,
                            paused = consumer.remotely_paused,
                            "Remote producer pause state changed"
                        );
                    }
                }
            }
            method::CONSUMER_SCORE => {
                if let Some(ConsumerScore { consumer_id, score }) = parse::<ConsumerScore>(method, data) {
                    if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
                        tracing::debug!(consumer = %consumer_id, score = %score, "Consumer score");
                        consumer.score = Some(score);
                    }
                }
            }
            method::NEW_PEER => {
                if let Some(PeerInfo { id, .. }) = parse::<PeerInfo>(method, data) {
                    if id != self.options.peer_id {
                        let update = self.spotlight.add_peers([id]);
                        self.apply_spotlights(update).await;
                    }
                }
            }
            method::PEER_CLOSED => {
                if let Some(PeerClosed { peer_id }) = parse::<PeerClosed>(method, data) {
                    let update = self.spotlight.remove_peer(&peer_id);
                    self.apply_spotlights(update).await;
                }
            }
            method::MODERATOR_KICK => {
                tracing::warn!(room = %self.options.room_id, "Removed from room by moderator");
                return Some(CloseReason::Kicked);
            }
            other => tracing::debug!(method = %other, "Unknown notification method"),
        }
        None
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        let TransportEvent::Closed { transport_id } = event;
        if self.recv.as_ref().is_some_and(|t| t.id() == transport_id) {
            tracing::warn!(transport = %transport_id, "Receive transport closed");
            for (_, consumer) in self.consumers.drain() {
                self.mixer.remove(consumer.track.id());
                consumer.track.stop();
            }
            self.recv = None;
        }
        if self.send.as_ref().is_some_and(|t| t.id() == transport_id) {
            tracing::warn!(transport = %transport_id, "Send transport closed");
            self.producers.clear();
            self.send = None;
        }
    }

    async fn join_or_fail(&mut self) -> Option<CloseReason> {
        match self.join_room().await {
            Ok(()) => None,
            Err(e) => {
                tracing::error!(
                    room = %self.options.room_id,
                    error = %e,
                    code = e.error_code(),
                    "Joining conference room failed"
                );
                Some(CloseReason::JoinFailed)
            }
        }
    }

    /// Full join sequence: capabilities, both transports, `join`, spotlights,
    /// then re-produce any remembered local tracks.
    async fn join_room(&mut self) -> BridgeResult<()> {
        self.teardown_media();

        let mut device = self.devices.create();

        let caps = self
            .channel
            .request(method::GET_ROUTER_RTP_CAPABILITIES, json!({}))
            .await?;
        let caps = RouterCapabilities::from_value(caps)?.without_header_extension(VIDEO_ORIENTATION);
        device
            .load(&caps)
            .await
            .map_err(|e| BridgeError::negotiation("load", e))?;

        let info = self.create_transport(true).await?;
        let options = TransportOptions::new(info, TransportDirection::Send, self.turn_servers.clone());
        let send = device
            .create_send_transport(options, self.signaling.clone())
            .await
            .map_err(|e| BridgeError::negotiation("createSendTransport", e))?;
        self.send = Some(send);

        let info = self.create_transport(false).await?;
        let options = TransportOptions::new(info, TransportDirection::Recv, self.turn_servers.clone());
        let recv = device
            .create_recv_transport(options, self.signaling.clone())
            .await
            .map_err(|e| BridgeError::negotiation("createRecvTransport", e))?;
        self.recv = Some(recv);

        let response = self
            .channel
            .request(
                method::JOIN,
                json!({
                    "displayName": self.options.display_name,
                    "picture": Value::Null,
                    "rtpCapabilities": device.rtp_capabilities(),
                }),
            )
            .await?;
        let join: JoinResponse = protocol::decode(method::JOIN, response)?;

        self.device = Some(device);
        self.joined = true;

        let me = self.options.peer_id.clone();
        let peers: Vec<String> = join
            .peers
            .iter()
            .map(|p| p.id.clone())
            .filter(|id| *id != me)
            .collect();
        self.spotlight.add_peers(peers);
        if !join.last_n_history.is_empty() {
            tracing::debug!(history = ?join.last_n_history, "Seeding spotlights from lastN history");
            self.spotlight
                .add_speaker_list(join.last_n_history.into_iter().filter(|id| *id != me));
        }
        let initial = self.spotlight.start();

        tracing::info!(
            room = %self.options.room_id,
            peers = join.peers.len(),
            "Joined conference room"
        );
        let _ = self.events.send(ConferenceEvent::Joined {
            peer_count: join.peers.len(),
        });

        self.apply_spotlights(Some(initial)).await;

        for kind in [MediaKind::Audio, MediaKind::Video] {
            let Some(track) = self.local_tracks.get(&kind).cloned() else {
                continue;
            };
            if let Err(e) = self.produce(kind, track).await {
                tracing::warn!(kind = %kind, error = %e, "Failed to produce remembered track");
            }
        }
        Ok(())
    }

    async fn create_transport(&self, producing: bool) -> BridgeResult<TransportInfo> {
        let response = self
            .channel
            .request(
                method::CREATE_WEBRTC_TRANSPORT,
                json!({
                    "forceTcp": self.options.force_tcp,
                    "producing": producing,
                    "consuming": !producing,
                }),
            )
            .await?;
        protocol::decode(method::CREATE_WEBRTC_TRANSPORT, response)
    }

    async fn enable(&mut self, kind: MediaKind, track: MediaTrack) -> BridgeResult<()> {
        self.local_tracks.insert(kind, track.clone());
        if !self.joined {
            tracing::debug!(kind = %kind, "Not joined yet, producing after join");
            return Ok(());
        }
        self.produce(kind, track).await
    }

    async fn produce(&mut self, kind: MediaKind, track: MediaTrack) -> BridgeResult<()> {
        if self.producers.contains_key(&kind) {
            tracing::debug!(kind = %kind, "Producer already exists");
            return Ok(());
        }
        let (Some(device), Some(send)) = (self.device.as_ref(), self.send.as_mut()) else {
            return Err(BridgeError::NotJoined);
        };
        if !device.can_produce(kind) {
            tracing::warn!(kind = %kind, "Device cannot produce this kind");
            return Err(BridgeError::CannotProduce(kind));
        }

        let params = ProduceParams {
            track,
            codec_options: (kind == MediaKind::Audio).then(CodecOptions::voice),
            app_data: match kind {
                MediaKind::Audio => json!({ "source": "mic" }),
                MediaKind::Video => json!({ "source": "webcam" }),
            },
        };
        let id = send.produce(params).await?;
        tracing::info!(kind = %kind, producer = %id, "Producer created");
        self.producers.insert(kind, LocalProducer { id });
        Ok(())
    }

    async fn disable(&mut self, kind: MediaKind) -> BridgeResult<()> {
        self.local_tracks.remove(&kind);
        let Some(producer) = self.producers.remove(&kind) else {
            return Ok(());
        };
        if let Some(send) = self.send.as_mut() {
            send.close_producer(&producer.id);
        }
        // Local state is already clean; the notification is best-effort.
        if let Err(e) = self
            .channel
            .request(method::CLOSE_PRODUCER, json!({ "producerId": producer.id }))
            .await
        {
            tracing::warn!(producer = %producer.id, error = %e, "closeProducer failed");
        }
        Ok(())
    }

    /// Create the local consumer. Routing to the mixer happens in [`Self::route_consumer`].
    async fn create_consumer(&mut self, data: Value) -> BridgeResult<String> {
        let params: NewConsumer = protocol::decode(method::NEW_CONSUMER, data)?;
        if self.consumers.contains_key(&params.id) {
            tracing::debug!(consumer = %params.id, "Consumer already exists");
            return Ok(params.id);
        }
        let Some(recv) = self.recv.as_mut() else {
            return Err(BridgeError::NotJoined);
        };

        let mut app_data = match params.app_data {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        app_data.insert("peerId".into(), Value::String(params.peer_id.clone()));

        let track = recv
            .consume(ConsumeParams {
                id: params.id.clone(),
                producer_id: params.producer_id.clone(),
                kind: params.kind,
                rtp_parameters: params.rtp_parameters,
                app_data: Value::Object(app_data),
            })
            .await?;

        tracing::info!(
            consumer = %params.id,
            peer = %params.peer_id,
            kind = %params.kind,
            "Consumer created"
        );
        self.consumers.insert(
            params.id.clone(),
            Consumer {
                id: params.id.clone(),
                kind: params.kind,
                peer_id: params.peer_id,
                producer_id: params.producer_id,
                track,
                paused: false,
                remotely_paused: params.producer_paused,
                score: None,
            },
        );
        Ok(params.id)
    }

    /// Hand a new consumer's track to the mixer, gated by the spotlights for video.
    async fn route_consumer(&mut self, id: &str) {
        let Some(consumer) = self.consumers.get(id) else {
            return;
        };
        let (kind, peer, track) = (consumer.kind, consumer.peer_id.clone(), consumer.track.clone());

        if kind == MediaKind::Audio {
            self.mixer.add_audio(track);
            return;
        }

        // Peers first seen through their consumer join the ranking.
        if self.spotlight.is_started() {
            let update = self.spotlight.add_peers([peer.clone()]);
            self.apply_spotlights(update).await;
        }

        if self.spotlight.contains(&peer) {
            if self.consumers.get(id).is_some_and(|c| !c.paused) {
                self.mixer.add_video(track);
            }
        } else if let Err(e) = self.pause_consumer(id).await {
            tracing::warn!(consumer = %id, error = %e, "Failed to pause consumer outside spotlights");
        }
    }

    /// Pause or resume every video consumer to match `update`.
    async fn apply_spotlights(&mut self, update: Option<Vec<String>>) {
        let Some(spotlights) = update else {
            return;
        };
        tracing::debug!(spotlights = ?spotlights, "Spotlights updated");

        let targets: Vec<(String, bool)> = self
            .consumers
            .values()
            .filter(|c| c.kind == MediaKind::Video)
            .map(|c| (c.id.clone(), spotlights.contains(&c.peer_id)))
            .collect();

        for (id, wanted) in targets {
            let result = if wanted {
                self.resume_consumer(&id).await
            } else {
                self.pause_consumer(&id).await
            };
            if let Err(e) = result {
                tracing::warn!(consumer = %id, error = %e, "Spotlight update failed for consumer");
            }
        }
    }

    async fn pause_consumer(&mut self, id: &str) -> BridgeResult<bool> {
        if !self.consumers.get(id).is_some_and(|c| !c.paused) {
            return Ok(false);
        }
        self.channel
            .request(method::PAUSE_CONSUMER, json!({ "consumerId": id }))
            .await?;

        let Some(consumer) = self.consumers.get_mut(id) else {
            return Ok(false);
        };
        consumer.paused = true;
        if let Some(recv) = self.recv.as_mut() {
            recv.pause_consumer(id);
        }
        if consumer.kind == MediaKind::Video {
            self.mixer.remove_video(consumer.track.id());
        }
        tracing::debug!(consumer = %id, "Consumer paused");
        Ok(true)
    }

    async fn resume_consumer(&mut self, id: &str) -> BridgeResult<bool> {
        if !self.consumers.get(id).is_some_and(|c| c.paused) {
            return Ok(false);
        }
        self.channel
            .request(method::RESUME_CONSUMER, json!({ "consumerId": id }))
            .await?;

        let Some(consumer) = self.consumers.get_mut(id) else {
            return Ok(false);
        };
        consumer.paused = false;
        if let Some(recv) = self.recv.as_mut() {
            recv.resume_consumer(id);
        }
        if consumer.kind == MediaKind::Video {
            self.mixer.add_video(consumer.track.clone());
        }
        tracing::debug!(consumer = %id, "Consumer resumed");
        Ok(true)
    }

    fn close_consumer(&mut self, id: &str) {
        let Some(consumer) = self.consumers.remove(id) else {
            return;
        };
        self.mixer.remove(consumer.track.id());
        if let Some(recv) = self.recv.as_mut() {
            recv.close_consumer(id);
        }
        consumer.track.stop();
        tracing::info!(consumer = %id, peer = %consumer.peer_id, "Consumer closed");
    }

    /// Drop producers, consumers, transports and the device without any RPC.
    fn teardown_media(&mut self) {
        for (_, producer) in self.producers.drain() {
            if let Some(send) = self.send.as_mut() {
                send.close_producer(&producer.id);
            }
        }
        for (_, consumer) in self.consumers.drain() {
            self.mixer.remove(consumer.track.id());
            consumer.track.stop();
        }
        if let Some(mut send) = self.send.take() {
            send.close();
        }
        if let Some(mut recv) = self.recv.take() {
            recv.close();
        }
        self.device = None;
        self.joined = false;
        self.spotlight.clear();
    }

    fn teardown(&mut self, reason: CloseReason) {
        self.teardown_media();
        self.channel.close();
        tracing::info!(room = %self.options.room_id, reason = ?reason, "Conference client closed");
        let _ = self.events.send(ConferenceEvent::Closed { reason });
    }

    fn snapshot(&self) -> ClientSnapshot {
        let mut consumers: Vec<ConsumerSnapshot> = self
            .consumers
            .values()
            .map(|c| ConsumerSnapshot {
                id: c.id.clone(),
                kind: c.kind,
                peer_id: c.peer_id.clone(),
                producer_id: c.producer_id.clone(),
                paused: c.paused,
                remotely_paused: c.remotely_paused,
                score: c.score.clone(),
            })
            .collect();
        consumers.sort_by(|a, b| a.id.cmp(&b.id));

        let mut producers: Vec<MediaKind> = self.producers.keys().copied().collect();
        producers.sort_by_key(|k| *k == MediaKind::Video);

        ClientSnapshot {
            peer_id: self.options.peer_id.clone(),
            room_id: self.options.room_id.clone(),
            joined: self.joined,
            spotlights: self.spotlight.current().to_vec(),
            consumers,
            producers,
        }
    }
}

/// Decode a notification payload, logging instead of failing.
fn parse<T: serde::de::DeserializeOwned>(method: &str, data: Value) -> Option<T> {
    protocol::decode(method, data)
        .map_err(|e| tracing::warn!(error = %e, "Ignoring malformed notification"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use dialbridge_common::config::MixerConfig;
    use dialbridge_mixer::MixingEngine;

    use crate::loopback::{
        DeviceLog, LoopbackConnector, LoopbackControl, RoomScript, SimulatedDeviceFactory,
        loopback_pair,
    };
    use crate::protocol::RemoteError;

    const SELF_ID: &str = "bridge01";

    struct Harness {
        handle: ConferenceHandle,
        events: mpsc::UnboundedReceiver<ConferenceEvent>,
        server: LoopbackControl,
        devices: DeviceLog,
        mixer: MixerHandle,
        _engine: MixingEngine,
    }

    impl Harness {
        async fn start(script: RoomScript) -> Self {
            let (channel, server) = loopback_pair(Duration::from_secs(5));
            let (server, _task) = server.serve(script.into_handler());
            let factory = Arc::new(SimulatedDeviceFactory::new());
            let devices = factory.log();
            let engine = MixingEngine::start(&MixerConfig::default()).unwrap();
            let mixer = engine.handle();

            let client = ConferenceClient::new(Arc::new(LoopbackConnector::new(channel)), factory);
            let options = ConferenceOptions {
                room_id: "test".into(),
                peer_id: SELF_ID.into(),
                display_name: "Dial-In User".into(),
                force_tcp: true,
                last_n: 2,
                turn_servers: Vec::new(),
            };
            let (handle, events) = client.join(options, mixer.clone()).await.unwrap();
            Self {
                handle,
                events,
                server,
                devices,
                mixer,
                _engine: engine,
            }
        }

        async fn joined(script: RoomScript) -> Self {
            let mut h = Self::start(script).await;
            h.server.notify(method::ROOM_READY, json!({ "turnServers": [] }));
            assert!(matches!(h.next_event().await, ConferenceEvent::Joined { .. }));
            h
        }

        async fn next_event(&mut self) -> ConferenceEvent {
            tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("event in time")
                .expect("event stream open")
        }

        /// Commands queue behind channel events, so a snapshot waits for them.
        async fn settle(&self) -> ClientSnapshot {
            self.handle.snapshot().await.unwrap()
        }

        fn consumer(&self, id: &str, peer: &str, kind: &str) {
            self.server.notify(
                method::NEW_CONSUMER,
                json!({
                    "peerId": peer,
                    "producerId": format!("p-{id}"),
                    "id": id,
                    "kind": kind,
                    "rtpParameters": {},
                    "appData": {},
                    "producerPaused": false
                }),
            );
        }
    }

    #[tokio::test]
    async fn join_sequence_negotiates_both_transports() {
        let h = Harness::joined(RoomScript::with_peers(&["alice"])).await;
        h.settle().await;

        let methods: Vec<String> = h.server.requests().into_iter().map(|(m, _)| m).collect();
        assert_eq!(
            methods,
            vec![
                method::GET_ROUTER_RTP_CAPABILITIES,
                method::CREATE_WEBRTC_TRANSPORT,
                method::CREATE_WEBRTC_TRANSPORT,
                method::JOIN,
            ]
        );

        let requests = h.server.requests();
        assert_eq!(requests[1].1, json!({ "forceTcp": true, "producing": true, "consuming": false }));
        assert_eq!(requests[2].1, json!({ "forceTcp": true, "producing": false, "consuming": true }));
        assert_eq!(requests[3].1["displayName"], "Dial-In User");
        assert_eq!(requests[3].1["picture"], Value::Null);

        let loaded = h.devices.loaded_capabilities().unwrap();
        assert_eq!(loaded.header_extensions.len(), 2);
        assert!(loaded.header_extensions.iter().all(|e| e.uri != VIDEO_ORIENTATION));
    }

    #[tokio::test]
    async fn lobby_sets_display_name() {
        let h = Harness::start(RoomScript::default()).await;
        h.server.notify(method::ENTERED_LOBBY, json!({}));
        h.settle().await;
        assert_eq!(
            h.server.requests(),
            vec![(
                method::CHANGE_DISPLAY_NAME.to_string(),
                json!({ "displayName": "Dial-In User" })
            )]
        );
    }

    #[tokio::test]
    async fn audio_enabled_before_join_is_produced_after() {
        let mut h = Harness::start(RoomScript::default()).await;
        h.handle.enable_audio(MediaTrack::new(MediaKind::Audio)).await.unwrap();
        assert_eq!(h.server.count(method::PRODUCE), 0);

        h.server.notify(method::ROOM_READY, json!({}));
        assert_eq!(h.next_event().await, ConferenceEvent::Joined { peer_count: 0 });
        let snapshot = h.settle().await;

        assert_eq!(snapshot.producers, vec![MediaKind::Audio]);
        assert_eq!(h.server.count(method::CONNECT_WEBRTC_TRANSPORT), 1);
        let produce = h
            .server
            .requests()
            .into_iter()
            .find(|(m, _)| m == method::PRODUCE)
            .unwrap()
            .1;
        assert_eq!(produce["transportId"], "send-transport");
        assert_eq!(produce["kind"], "audio");
        assert_eq!(h.devices.produced_app_data(), vec![json!({ "source": "mic" })]);

        // A second enable for the same kind is a no-op.
        h.handle.enable_audio(MediaTrack::new(MediaKind::Audio)).await.unwrap();
        assert_eq!(h.server.count(method::PRODUCE), 1);
    }

    #[tokio::test]
    async fn device_without_video_cannot_produce_it() {
        let (channel, server) = loopback_pair(Duration::from_secs(5));
        let (server, _task) = server.serve(RoomScript::default().into_handler());
        let engine = MixingEngine::start(&MixerConfig::default()).unwrap();
        let client = ConferenceClient::new(
            Arc::new(LoopbackConnector::new(channel)),
            Arc::new(SimulatedDeviceFactory::audio_only()),
        );
        let options = ConferenceOptions {
            room_id: "test".into(),
            peer_id: SELF_ID.into(),
            display_name: "Dial-In User".into(),
            force_tcp: false,
            last_n: 4,
            turn_servers: Vec::new(),
        };
        let (handle, mut events) = client.join(options, engine.handle()).await.unwrap();
        server.notify(method::ROOM_READY, json!({}));
        assert!(matches!(events.recv().await, Some(ConferenceEvent::Joined { .. })));

        let result = handle.enable_video(MediaTrack::new(MediaKind::Video)).await;
        assert!(matches!(result, Err(BridgeError::CannotProduce(MediaKind::Video))));
        assert_eq!(server.count(method::PRODUCE), 0);
    }

    #[tokio::test]
    async fn disable_closes_producer() {
        let h = Harness::joined(RoomScript::default()).await;
        h.handle.enable_audio(MediaTrack::new(MediaKind::Audio)).await.unwrap();
        h.handle.disable_audio().await.unwrap();

        let snapshot = h.settle().await;
        assert!(snapshot.producers.is_empty());
        let close = h
            .server
            .requests()
            .into_iter()
            .find(|(m, _)| m == method::CLOSE_PRODUCER)
            .unwrap();
        assert_eq!(close.1, json!({ "producerId": "producer-audio" }));
        assert!(h.devices.entries().contains(&"close-producer:producer-audio".to_string()));
    }

    #[tokio::test]
    async fn video_consumers_follow_spotlights() {
        let h = Harness::joined(RoomScript::with_peers(&["alice", "bob", "carol"])).await;
        assert_eq!(h.settle().await.spotlights, vec!["alice", "bob"]);

        h.consumer("v-alice", "alice", "video");
        h.consumer("v-carol", "carol", "video");
        h.consumer("a-carol", "carol", "audio");
        h.settle().await;

        assert_eq!(h.mixer.admitted_video_ids(), vec!["v-alice"]);
        assert_eq!(h.mixer.admitted_audio_ids(), vec!["a-carol"]);
        assert_eq!(h.server.count(method::PAUSE_CONSUMER), 1);

        // carol speaks: bob (no consumers) drops out, carol's video resumes.
        h.server.notify(method::ACTIVE_SPEAKER, json!({ "peerId": "carol" }));
        let snapshot = h.settle().await;
        assert_eq!(snapshot.spotlights, vec!["carol", "alice"]);
        let mut video = h.mixer.admitted_video_ids();
        video.sort();
        assert_eq!(video, vec!["v-alice", "v-carol"]);
        assert_eq!(h.server.count(method::RESUME_CONSUMER), 1);

        // bob speaks: alice is now least recent and her video pauses.
        h.server.notify(method::ACTIVE_SPEAKER, json!({ "peerId": "bob" }));
        let snapshot = h.settle().await;
        assert_eq!(snapshot.spotlights, vec!["bob", "carol"]);
        assert_eq!(h.mixer.admitted_video_ids(), vec!["v-carol"]);
        assert_eq!(h.server.count(method::PAUSE_CONSUMER), 2);
        let alice = snapshot.consumers.iter().find(|c| c.id == "v-alice").unwrap();
        assert!(alice.paused);
    }

    #[tokio::test]
    async fn own_active_speaker_is_ignored() {
        let h = Harness::joined(RoomScript::with_peers(&["alice", "bob", "carol"])).await;
        h.server.notify(method::ACTIVE_SPEAKER, json!({ "peerId": SELF_ID }));
        assert_eq!(h.settle().await.spotlights, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn peer_departure_backfills_spotlights() {
        let h = Harness::joined(RoomScript::with_peers(&["alice", "bob", "carol"])).await;
        h.consumer("v-carol", "carol", "video");
        h.settle().await;
        assert!(h.mixer.admitted_video_ids().is_empty());

        h.server.notify(method::PEER_CLOSED, json!({ "peerId": "alice" }));
        let snapshot = h.settle().await;
        assert_eq!(snapshot.spotlights, vec!["bob", "carol"]);
        assert_eq!(h.mixer.admitted_video_ids(), vec!["v-carol"]);
    }

    #[tokio::test]
    async fn pause_and_resume_are_idempotent() {
        let h = Harness::joined(RoomScript::with_peers(&["alice"])).await;
        h.consumer("v1", "alice", "video");
        h.settle().await;

        assert!(h.handle.pause_consumer("v1").await.unwrap());
        assert!(!h.handle.pause_consumer("v1").await.unwrap());
        assert_eq!(h.server.count(method::PAUSE_CONSUMER), 1);
        assert!(h.mixer.admitted_video_ids().is_empty());

        assert!(h.handle.resume_consumer("v1").await.unwrap());
        assert!(!h.handle.resume_consumer("v1").await.unwrap());
        assert_eq!(h.server.count(method::RESUME_CONSUMER), 1);
        assert_eq!(h.mixer.admitted_video_ids(), vec!["v1"]);

        assert!(!h.handle.pause_consumer("nope").await.unwrap());
    }

    #[tokio::test]
    async fn consumer_closed_leaves_the_mixer() {
        let h = Harness::joined(RoomScript::with_peers(&["alice"])).await;
        h.consumer("v1", "alice", "video");
        h.consumer("a1", "alice", "audio");
        h.settle().await;
        assert_eq!(h.mixer.admitted_video_ids(), vec!["v1"]);

        h.server.notify(method::CONSUMER_CLOSED, json!({ "consumerId": "v1" }));
        h.server.notify(method::CONSUMER_CLOSED, json!({ "consumerId": "a1" }));
        let snapshot = h.settle().await;
        assert!(snapshot.consumers.is_empty());
        assert!(h.mixer.admitted_video_ids().is_empty());
        assert!(h.mixer.admitted_audio_ids().is_empty());
        assert!(h.devices.entries().contains(&"close-consumer:v1".to_string()));
    }

    #[tokio::test]
    async fn remote_pause_and_score_are_recorded() {
        let h = Harness::joined(RoomScript::with_peers(&["alice"])).await;
        h.consumer("a1", "alice", "audio");
        h.server.notify(method::CONSUMER_PAUSED, json!({ "consumerId": "a1" }));
        h.server.notify(
            method::CONSUMER_SCORE,
            json!({ "consumerId": "a1", "score": { "score": 9 } }),
        );
        let snapshot = h.settle().await;
        let consumer = &snapshot.consumers[0];
        assert!(consumer.remotely_paused);
        assert!(!consumer.paused);
        assert_eq!(consumer.score, Some(json!({ "score": 9 })));
    }

    #[tokio::test]
    async fn server_requests_are_answered() {
        let h = Harness::joined(RoomScript::with_peers(&["alice"])).await;
        let ack = h.server.request(
            method::NEW_CONSUMER,
            json!({
                "peerId": "alice",
                "producerId": "p1",
                "id": "a1",
                "kind": "audio",
                "rtpParameters": {}
            }),
        );
        assert_eq!(ack.response().await, Some(Ok(Value::Null)));
        h.settle().await;
        assert_eq!(h.mixer.admitted_audio_ids(), vec!["a1"]);

        let unknown = h.server.request("mystery", json!({}));
        assert_eq!(
            unknown.response().await,
            Some(Err(RemoteError::new(500, "unknown request.method \"mystery\"")))
        );
    }

    #[tokio::test]
    async fn disconnect_drops_media_and_room_back_rejoins() {
        let mut h = Harness::joined(RoomScript::with_peers(&["alice"])).await;
        h.handle.enable_audio(MediaTrack::new(MediaKind::Audio)).await.unwrap();
        h.consumer("a1", "alice", "audio");
        h.settle().await;
        assert_eq!(h.mixer.admitted_audio_ids(), vec!["a1"]);

        h.server.disconnect();
        let snapshot = h.settle().await;
        assert!(!snapshot.joined);
        assert!(snapshot.consumers.is_empty());
        assert!(snapshot.producers.is_empty());
        assert!(snapshot.spotlights.is_empty());
        assert!(h.mixer.admitted_audio_ids().is_empty());

        h.server.reconnect();
        h.server.notify(method::ROOM_BACK, json!({}));
        assert_eq!(h.next_event().await, ConferenceEvent::Joined { peer_count: 1 });
        let snapshot = h.settle().await;
        assert!(snapshot.joined);
        assert_eq!(snapshot.producers, vec![MediaKind::Audio]);
        assert_eq!(h.server.count(method::PRODUCE), 2);
        assert_eq!(h.server.count(method::JOIN), 2);
        assert_eq!(h.devices.count("create"), 2);
    }

    #[tokio::test]
    async fn closed_receive_transport_drops_consumers() {
        let h = Harness::joined(RoomScript::with_peers(&["alice"])).await;
        h.consumer("a1", "alice", "audio");
        h.settle().await;

        h.devices.close_transport("recv-transport");
        let snapshot = h.settle().await;
        assert!(snapshot.consumers.is_empty());
        assert!(h.mixer.admitted_audio_ids().is_empty());
    }

    #[tokio::test]
    async fn moderator_kick_closes_the_client() {
        let mut h = Harness::joined(RoomScript::default()).await;
        h.server.notify(method::MODERATOR_KICK, json!({}));
        assert_eq!(
            h.next_event().await,
            ConferenceEvent::Closed { reason: CloseReason::Kicked }
        );
        assert!(h.server.is_closed());
    }

    #[tokio::test]
    async fn failed_join_reports_join_failed() {
        let script = RoomScript {
            fail_on: Some(method::JOIN.to_string()),
            ..RoomScript::default()
        };
        let mut h = Harness::start(script).await;
        h.server.notify(method::ROOM_READY, json!({}));
        assert_eq!(
            h.next_event().await,
            ConferenceEvent::Closed { reason: CloseReason::JoinFailed }
        );
        // Transports created before the failure are closed too.
        let entries = h.devices.entries();
        assert!(entries.contains(&"close:send-transport".to_string()));
        assert!(entries.contains(&"close:recv-transport".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_join_times_out_and_fails() {
        let script = RoomScript {
            withhold: Some(method::JOIN.to_string()),
            ..RoomScript::default()
        };
        let mut h = Harness::start(script).await;
        let started = tokio::time::Instant::now();
        h.server.notify(method::ROOM_READY, json!({}));

        let event = tokio::time::timeout(Duration::from_secs(60), h.events.recv())
            .await
            .expect("close reported")
            .expect("event stream open");
        assert_eq!(event, ConferenceEvent::Closed { reason: CloseReason::JoinFailed });
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(h.server.count(method::JOIN), 1);

        let entries = h.devices.entries();
        assert!(entries.contains(&"close:send-transport".to_string()));
        assert!(entries.contains(&"close:recv-transport".to_string()));
        assert!(h.server.is_closed());
    }

    #[tokio::test]
    async fn last_n_history_seeds_spotlights_at_join() {
        let script = RoomScript {
            last_n_history: vec!["carol".into(), "alice".into()],
            ..RoomScript::with_peers(&["alice", "bob", "carol"])
        };
        let h = Harness::joined(script).await;
        assert_eq!(h.settle().await.spotlights, vec!["carol", "alice"]);

        h.consumer("v-bob", "bob", "video");
        h.consumer("v-carol", "carol", "video");
        let snapshot = h.settle().await;
        assert_eq!(h.mixer.admitted_video_ids(), vec!["v-carol"]);
        let bob = snapshot.consumers.iter().find(|c| c.id == "v-bob").unwrap();
        assert!(bob.paused);
        assert_eq!(h.server.count(method::PAUSE_CONSUMER), 1);
    }

    #[tokio::test]
    async fn channel_loss_closes_the_client() {
        let mut h = Harness::joined(RoomScript::default()).await;
        h.server.close();
        assert_eq!(
            h.next_event().await,
            ConferenceEvent::Closed { reason: CloseReason::ChannelClosed }
        );
    }

    #[tokio::test]
    async fn close_tears_everything_down() {
        let mut h = Harness::joined(RoomScript::with_peers(&["alice"])).await;
        h.handle.enable_audio(MediaTrack::new(MediaKind::Audio)).await.unwrap();
        h.consumer("v1", "alice", "video");
        h.consumer("a1", "alice", "audio");
        h.settle().await;

        h.handle.close().await;
        assert_eq!(
            h.next_event().await,
            ConferenceEvent::Closed { reason: CloseReason::Requested }
        );
        assert!(h.handle.is_closed());
        assert!(h.server.is_closed());
        assert!(h.mixer.admitted_video_ids().is_empty());
        assert!(h.mixer.admitted_audio_ids().is_empty());

        let entries = h.devices.entries();
        for expected in ["close-producer:producer-audio", "close:send-transport", "close:recv-transport"] {
            assert!(entries.contains(&expected.to_string()), "missing {expected}");
        }
        assert!(matches!(h.handle.snapshot().await, Err(BridgeError::ChannelClosed)));
    }
}
