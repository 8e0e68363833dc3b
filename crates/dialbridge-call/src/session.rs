//! Call bridging session.
//!
//! One task per inbound call. It answers the call, collects the room code
//! from relayed tones, joins the conference and forwards the caller's audio
//! as the conference producer, while the session mixer's output goes back
//! to the caller.
//!
//! ```text
//!   Initial ─invite─▶ Establishing ─▶ Established ─code─▶ (joining) ─▶ joined
//!      └──────────────────┴──────────────┴─── terminate / close ──▶ Terminated
//! ```

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use dialbridge_common::config::{
    AppConfig, BridgeConfig, BridgeMode, CODE_LENGTH, ConferenceConfig, MixerConfig, RoomsConfig,
};
use dialbridge_common::id::{generate_peer_id, mask_caller_id};
use dialbridge_common::{BridgeResult, MediaStream};
use dialbridge_conference::{
    CloseReason, ConferenceClient, ConferenceEvent, ConferenceHandle, ConferenceOptions,
};
use dialbridge_mixer::MixingEngine;

use crate::directory::RoomDirectory;
use crate::dtmf::{self, DtmfTone};
use crate::leg::{CallEvent, CallLeg, CallState, InfoRequest, MediaConstraints};
use crate::prompts::{Prompt, PromptLibrary, PromptPlayer};
use crate::registry::SessionRegistry;

/// Toggles mute once the caller is in a room.
pub const MUTE_TONE: DtmfTone = DtmfTone::Digit(0);

/// Everything sessions share.
#[derive(Clone)]
pub struct SessionContext {
    pub bridge: BridgeConfig,
    pub rooms: RoomsConfig,
    pub conference: ConferenceConfig,
    pub mixer: MixerConfig,
    pub client: ConferenceClient,
    pub directory: Arc<dyn RoomDirectory>,
    pub prompts: Arc<PromptLibrary>,
    pub registry: SessionRegistry,
}

impl SessionContext {
    pub fn new(
        config: &AppConfig,
        client: ConferenceClient,
        directory: Arc<dyn RoomDirectory>,
        prompts: Arc<PromptLibrary>,
        registry: SessionRegistry,
    ) -> Self {
        Self {
            bridge: config.bridge.clone(),
            rooms: config.rooms.clone(),
            conference: config.conference.clone(),
            mixer: config.mixer.clone(),
            client,
            directory,
            prompts,
            registry,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub peer_id: String,
    pub display_name: String,
    pub state: CallState,
    /// Digits collected toward the room code.
    pub tones: String,
    pub muted: bool,
    pub joining: bool,
    pub joined: bool,
    pub room: Option<String>,
    pub last_prompt: Option<Prompt>,
    pub created_at: DateTime<Utc>,
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    output: MediaStream,
    snapshot: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Mixed media for the caller.
    pub fn output(&self) -> MediaStream {
        self.output.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.snapshot.borrow().state == CallState::Terminated
    }

    /// End the call and wait until everything is released.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

pub struct CallBridgeSession {
    id: String,
    peer_id: String,
    display_name: String,
    leg: Arc<dyn CallLeg>,
    ctx: SessionContext,
    mixer: MixingEngine,
    prompts: PromptPlayer,
    conference: Option<ConferenceHandle>,
    conference_events: Option<mpsc::UnboundedReceiver<ConferenceEvent>>,
    snapshot: watch::Sender<SessionSnapshot>,
    state: CallState,
    tones: String,
    muted: bool,
    joining: bool,
    joined: bool,
    room: Option<String>,
    last_prompt: Option<Prompt>,
    accept_at: Option<Instant>,
    next_prompt: Option<Instant>,
}

impl CallBridgeSession {
    /// Start a session for a freshly received invite.
    pub async fn spawn(
        ctx: SessionContext,
        leg: Arc<dyn CallLeg>,
        events: mpsc::UnboundedReceiver<CallEvent>,
    ) -> BridgeResult<SessionHandle> {
        let id = leg.id().to_string();
        let mixer = MixingEngine::start(&ctx.mixer)?;
        let prompts = PromptPlayer::new(ctx.prompts.clone(), mixer.handle(), &ctx.mixer);
        let peer_id = generate_peer_id();
        let display_name = mask_caller_id(leg.remote_display_name().as_deref());

        let (snapshot, snapshot_rx) = watch::channel(SessionSnapshot {
            id: id.clone(),
            peer_id: peer_id.clone(),
            display_name: display_name.clone(),
            state: CallState::Initial,
            tones: String::new(),
            muted: false,
            joining: false,
            joined: false,
            room: None,
            last_prompt: None,
            created_at: Utc::now(),
        });
        let cancel = CancellationToken::new();
        let handle = SessionHandle {
            id: id.clone(),
            output: mixer.output(),
            snapshot: snapshot_rx,
            cancel: cancel.clone(),
            task: Arc::new(Mutex::new(None)),
        };
        ctx.registry.insert(handle.clone()).await;

        tracing::info!(session = %id, peer = %peer_id, caller = %display_name, "Inbound call");

        let accept_at = Instant::now() + Duration::from_millis(ctx.bridge.accept_delay_ms);
        let session = Self {
            id,
            peer_id,
            display_name,
            leg,
            ctx,
            mixer,
            prompts,
            conference: None,
            conference_events: None,
            snapshot,
            state: CallState::Initial,
            tones: String::new(),
            muted: false,
            joining: false,
            joined: false,
            room: None,
            last_prompt: None,
            accept_at: Some(accept_at),
            next_prompt: None,
        };
        let task = tokio::spawn(session.run(events, cancel));
        *handle.task.lock().await = Some(task);
        Ok(handle)
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<CallEvent>, cancel: CancellationToken) {
        let mut leg_ended = false;
        loop {
            let flow = tokio::select! {
                biased;
                _ = cancel.cancelled() => ControlFlow::Break(()),
                event = events.recv() => match event {
                    Some(CallEvent::StateChanged(state)) => {
                        leg_ended |= state.is_terminal();
                        self.on_state(state).await
                    }
                    Some(CallEvent::Info(info)) => self.on_info(info).await,
                    None => {
                        tracing::warn!(session = %self.id, "Call leg event stream ended");
                        leg_ended = true;
                        ControlFlow::Break(())
                    }
                },
                Some(event) = next_conference_event(&mut self.conference_events) => {
                    self.on_conference_event(event).await
                }
                _ = wait_until(self.accept_at) => self.accept().await,
                _ = wait_until(self.next_prompt) => {
                    self.on_prompt_timer();
                    ControlFlow::Continue(())
                }
            };
            if flow.is_break() {
                break;
            }
        }
        self.close(leg_ended).await;
    }

    async fn accept(&mut self) -> ControlFlow<()> {
        self.accept_at = None;
        let constraints = MediaConstraints {
            audio: true,
            video: true,
        };
        match self.leg.accept(constraints).await {
            Ok(()) => {
                tracing::info!(session = %self.id, "Call accepted");
                ControlFlow::Continue(())
            }
            Err(e) => {
                tracing::error!(session = %self.id, error = %e, "Failed to accept call");
                ControlFlow::Break(())
            }
        }
    }

    async fn on_state(&mut self, state: CallState) -> ControlFlow<()> {
        tracing::debug!(session = %self.id, state = %state, "Call state changed");
        let previous = self.state;
        self.state = state;
        self.publish();

        match state {
            CallState::Initial | CallState::Establishing => ControlFlow::Continue(()),
            CallState::Established if previous == CallState::Established => ControlFlow::Continue(()),
            CallState::Established => match self.ctx.bridge.mode {
                BridgeMode::CodeRouted => {
                    let delay = Duration::from_millis(self.ctx.bridge.prompt_delay_ms);
                    self.next_prompt = Some(Instant::now() + delay);
                    ControlFlow::Continue(())
                }
                BridgeMode::DirectRoom => self.join_direct().await,
            },
            CallState::Terminating | CallState::Terminated => ControlFlow::Break(()),
        }
    }

    async fn on_info(&mut self, info: InfoRequest) -> ControlFlow<()> {
        match dtmf::parse_info(info.content_type.as_deref(), &info.body) {
            Ok(event) => {
                info.accept();
                self.on_tone(event.tone, event.duration_ms).await
            }
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "Rejecting INFO request");
                info.reject();
                ControlFlow::Continue(())
            }
        }
    }

    async fn on_tone(&mut self, tone: DtmfTone, duration_ms: u16) -> ControlFlow<()> {
        tracing::debug!(session = %self.id, tone = %tone, duration_ms, "DTMF received");
        if self.joining {
            return ControlFlow::Continue(());
        }

        if self.joined {
            if tone == MUTE_TONE {
                self.muted = !self.muted;
                tracing::info!(session = %self.id, muted = self.muted, "Mute toggled");
                self.play(if self.muted {
                    Prompt::Muted
                } else {
                    Prompt::Unmuted
                });
            }
            return ControlFlow::Continue(());
        }

        let Some(digit) = tone.digit() else {
            return ControlFlow::Continue(());
        };
        self.tones.push(digit);
        self.publish();
        if self.tones.len() == CODE_LENGTH {
            return self.handle_code().await;
        }
        ControlFlow::Continue(())
    }

    /// Resolve the collected code. The buffer is empty afterwards whatever the outcome.
    async fn handle_code(&mut self) -> ControlFlow<()> {
        self.joining = true;
        self.publish();

        let flow = match self.ctx.directory.resolve(&self.tones).await {
            Ok(Some(room)) => {
                self.next_prompt = None;
                self.joined = true;
                self.connect(room).await
            }
            Ok(None) => {
                tracing::info!(session = %self.id, "Unknown room code");
                self.play(Prompt::InvalidCode);
                ControlFlow::Continue(())
            }
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "Room lookup failed");
                self.play(Prompt::InvalidCode);
                ControlFlow::Continue(())
            }
        };

        self.tones.clear();
        self.joining = false;
        self.publish();
        flow
    }

    async fn join_direct(&mut self) -> ControlFlow<()> {
        let room = self
            .leg
            .header(&self.ctx.bridge.room_header)
            .map(|r| r.trim().to_lowercase())
            .filter(|r| !r.is_empty())
            .or_else(|| self.ctx.rooms.default_room.clone());
        let Some(room) = room else {
            tracing::warn!(
                session = %self.id,
                header = %self.ctx.bridge.room_header,
                "No room header and no default room, ending call"
            );
            return ControlFlow::Break(());
        };
        self.joined = true;
        self.connect(room).await
    }

    async fn connect(&mut self, room: String) -> ControlFlow<()> {
        self.play(Prompt::Joined);
        self.room = Some(room.clone());
        self.publish();

        let options = ConferenceOptions::new(
            &self.ctx.conference,
            room.clone(),
            self.peer_id.clone(),
            self.display_name.clone(),
        );
        match self.ctx.client.join(options, self.mixer.handle()).await {
            Ok((handle, events)) => {
                tracing::info!(session = %self.id, room = %room, "Connecting to conference room");
                self.conference = Some(handle);
                self.conference_events = Some(events);
                ControlFlow::Continue(())
            }
            Err(e) => {
                tracing::error!(session = %self.id, room = %room, error = %e, "Failed to open conference signaling");
                ControlFlow::Break(())
            }
        }
    }

    async fn on_conference_event(&mut self, event: ConferenceEvent) -> ControlFlow<()> {
        match event {
            ConferenceEvent::Joined { peer_count } => {
                tracing::info!(
                    session = %self.id,
                    room = ?self.room,
                    peers = peer_count,
                    "Joined conference room"
                );
                let Some(conference) = self.conference.clone() else {
                    return ControlFlow::Continue(());
                };
                match self.leg.remote_audio() {
                    Some(track) => {
                        if let Err(e) = conference.enable_audio(track).await {
                            tracing::warn!(session = %self.id, error = %e, "Failed to forward caller audio");
                        }
                    }
                    None => tracing::warn!(session = %self.id, "Caller audio track unavailable"),
                }
                ControlFlow::Continue(())
            }
            ConferenceEvent::Closed { reason } => {
                self.conference_events = None;
                if reason == CloseReason::Requested {
                    return ControlFlow::Continue(());
                }
                tracing::warn!(session = %self.id, reason = ?reason, "Conference closed, ending call");
                ControlFlow::Break(())
            }
        }
    }

    fn on_prompt_timer(&mut self) {
        if self.joined {
            self.next_prompt = None;
            return;
        }
        if !self.joining {
            self.play(Prompt::EnterCode);
        }
        let interval = Duration::from_millis(self.ctx.bridge.prompt_interval_ms);
        self.next_prompt = Some(Instant::now() + interval);
    }

    fn play(&mut self, prompt: Prompt) {
        self.prompts.play(prompt);
        self.last_prompt = Some(prompt);
        self.publish();
    }

    fn publish(&self) {
        self.snapshot.send_modify(|s| {
            s.state = self.state;
            s.tones.clone_from(&self.tones);
            s.muted = self.muted;
            s.joining = self.joining;
            s.joined = self.joined;
            s.room.clone_from(&self.room);
            s.last_prompt = self.last_prompt;
        });
    }

    async fn close(mut self, leg_ended: bool) {
        if !self.state.is_terminal() {
            self.state = CallState::Terminating;
            self.publish();
        }
        self.accept_at = None;
        self.next_prompt = None;
        self.prompts.close();

        if let Some(conference) = self.conference.take() {
            conference.close().await;
        }
        self.mixer.close();

        if !leg_ended {
            if let Err(e) = self.leg.terminate().await {
                tracing::warn!(session = %self.id, error = %e, "Failed to terminate call leg");
            }
        }

        self.ctx.registry.remove(&self.id).await;
        self.state = CallState::Terminated;
        self.publish();
        tracing::info!(session = %self.id, room = ?self.room, "Session closed");
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_conference_event(
    events: &mut Option<mpsc::UnboundedReceiver<ConferenceEvent>>,
) -> Option<ConferenceEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::oneshot;

    use dialbridge_common::{MediaKind, MediaTrack};
    use dialbridge_conference::loopback::{
        DeviceLog, LoopbackConnector, LoopbackControl, RoomScript, SimulatedDeviceFactory,
        loopback_pair,
    };
    use dialbridge_conference::protocol::method;

    use crate::directory::StaticRoomDirectory;
    use crate::leg::InfoReply;

    const CODE_ROUTED: &str = r#"
        [rooms.mapping]
        "00000" = "test"

        [mixer]
        width = 64
        height = 48
        frame_rate = 10
    "#;

    const DIRECT_ROOM: &str = r#"
        [bridge]
        mode = "direct_room"

        [mixer]
        width = 64
        height = 48
        frame_rate = 10
    "#;

    struct FakeLeg {
        id: String,
        display_name: Option<String>,
        headers: HashMap<String, String>,
        audio: MediaTrack,
        registry: SessionRegistry,
        accepted: StdMutex<Vec<(MediaConstraints, bool)>>,
        terminated: AtomicBool,
    }

    #[async_trait]
    impl CallLeg for FakeLeg {
        fn id(&self) -> &str {
            &self.id
        }

        fn remote_display_name(&self) -> Option<String> {
            self.display_name.clone()
        }

        fn header(&self, name: &str) -> Option<String> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        }

        async fn accept(&self, constraints: MediaConstraints) -> BridgeResult<()> {
            let media = self.registry.media(&self.id).await.is_some();
            self.accepted.lock().unwrap().push((constraints, media));
            Ok(())
        }

        fn remote_audio(&self) -> Option<MediaTrack> {
            Some(self.audio.clone())
        }

        async fn terminate(&self) -> BridgeResult<()> {
            self.terminated.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        session: SessionHandle,
        leg: Arc<FakeLeg>,
        calls: mpsc::UnboundedSender<CallEvent>,
        room: LoopbackControl,
        devices: DeviceLog,
        registry: SessionRegistry,
    }

    impl Harness {
        async fn start(toml: &str, headers: &[(&str, &str)]) -> Self {
            Self::with_room(toml, headers, RoomScript::with_peers(&["alice"])).await
        }

        async fn with_room(toml: &str, headers: &[(&str, &str)], script: RoomScript) -> Self {
            let config = AppConfig::from_toml_str(toml).unwrap();
            let (channel, server) = loopback_pair(Duration::from_secs(10));
            let (room, _task) = server.serve(script.into_handler());
            let factory = Arc::new(SimulatedDeviceFactory::new());
            let devices = factory.log();
            let client = ConferenceClient::new(Arc::new(LoopbackConnector::new(channel)), factory);

            let spf = config.mixer.samples_per_frame();
            let prompts = PromptLibrary::from_clips(
                Prompt::ALL.map(|p| (p, vec![500; spf * 5])),
                config.mixer.sample_rate,
                config.mixer.channels,
            );
            let registry = SessionRegistry::new();
            let ctx = SessionContext::new(
                &config,
                client,
                Arc::new(StaticRoomDirectory::from_config(&config.rooms)),
                Arc::new(prompts),
                registry.clone(),
            );

            let leg = Arc::new(FakeLeg {
                id: "call-1".into(),
                display_name: Some("Alexander".into()),
                headers: headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                audio: MediaTrack::new(MediaKind::Audio),
                registry: registry.clone(),
                accepted: StdMutex::new(Vec::new()),
                terminated: AtomicBool::new(false),
            });
            let (calls, events) = mpsc::unbounded_channel();
            let session = CallBridgeSession::spawn(ctx, leg.clone(), events)
                .await
                .unwrap();

            Self {
                session,
                leg,
                calls,
                room,
                devices,
                registry,
            }
        }

        fn state(&self, state: CallState) {
            self.calls.send(CallEvent::StateChanged(state)).unwrap();
        }

        fn info(&self, content_type: &str, body: &str) -> oneshot::Receiver<InfoReply> {
            let (request, reply) = InfoRequest::new(Some(content_type.to_string()), body);
            self.calls.send(CallEvent::Info(request)).unwrap();
            reply
        }

        async fn press(&self, keys: &str) {
            for c in keys.chars() {
                let reply = self.info("application/dtmf-relay", &format!("Signal={c}\r\nDuration=160\r\n"));
                assert_eq!(reply.await.unwrap(), InfoReply::Accepted);
            }
        }

        async fn wait(&self, f: impl FnMut(&SessionSnapshot) -> bool) -> SessionSnapshot {
            let mut rx = self.session.subscribe();
            let snapshot = tokio::time::timeout(Duration::from_secs(120), rx.wait_for(f))
                .await
                .expect("session did not reach the expected state")
                .unwrap()
                .clone();
            snapshot
        }

        async fn eventually(&self, mut f: impl FnMut(&Self) -> bool) {
            for _ in 0..200 {
                if f(self) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            panic!("condition not reached");
        }

        async fn establish(&self) -> SessionSnapshot {
            self.state(CallState::Establishing);
            self.state(CallState::Established);
            self.wait(|s| s.last_prompt == Some(Prompt::EnterCode)).await
        }

        async fn join(&self) {
            self.establish().await;
            self.press("00000").await;
            self.wait(|s| s.joined && !s.joining).await;
            self.room.notify(method::ROOM_READY, json!({ "turnServers": [] }));
            self.eventually(|h| h.room.count(method::PRODUCE) == 1).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn accepts_with_audio_and_video_after_delay() {
        let h = Harness::start(CODE_ROUTED, &[]).await;
        let snapshot = h.session.snapshot();
        assert_eq!(snapshot.display_name, "Alexxxxer");
        assert_eq!(snapshot.peer_id.len(), 8);
        assert!(h.leg.accepted.lock().unwrap().is_empty());

        h.eventually(|h| !h.leg.accepted.lock().unwrap().is_empty()).await;
        let accepted = h.leg.accepted.lock().unwrap().clone();
        assert_eq!(accepted, vec![(MediaConstraints { audio: true, video: true }, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn prompts_for_code_and_repeats() {
        let h = Harness::start(CODE_ROUTED, &[]).await;
        let started = Instant::now();
        h.establish().await;
        assert!(started.elapsed() >= Duration::from_millis(4_000));

        h.press("12345").await;
        let snapshot = h
            .wait(|s| s.last_prompt == Some(Prompt::InvalidCode) && !s.joining)
            .await;
        assert_eq!(snapshot.tones, "");
        assert!(!snapshot.joined);
        assert_eq!(snapshot.state, CallState::Established);

        h.wait(|s| s.last_prompt == Some(Prompt::EnterCode)).await;
        assert!(started.elapsed() >= Duration::from_millis(19_000));
    }

    #[tokio::test(start_paused = true)]
    async fn collects_digits_only() {
        let h = Harness::start(CODE_ROUTED, &[]).await;
        h.establish().await;
        h.press("12#*3").await;
        let snapshot = h.wait(|s| s.tones == "123").await;
        assert!(!snapshot.joining);
        assert!(!snapshot.joined);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_info_is_rejected() {
        let h = Harness::start(CODE_ROUTED, &[]).await;
        h.establish().await;
        let reply = h.info("text/plain", "Signal=1\r\nDuration=160");
        assert_eq!(reply.await.unwrap(), InfoReply::Rejected);
        let reply = h.info("application/dtmf-relay", "Signal=1\r\nDuration=0");
        assert_eq!(reply.await.unwrap(), InfoReply::Rejected);
        h.press("7").await;
        assert_eq!(h.wait(|s| !s.tones.is_empty()).await.tones, "7");
    }

    #[tokio::test(start_paused = true)]
    async fn valid_code_joins_room_and_forwards_audio() {
        let h = Harness::start(CODE_ROUTED, &[]).await;
        h.join().await;

        let snapshot = h.session.snapshot();
        assert_eq!(snapshot.room.as_deref(), Some("test"));
        assert_eq!(snapshot.tones, "");
        assert_eq!(snapshot.last_prompt, Some(Prompt::Joined));
        let (_, join) = h
            .room
            .requests()
            .into_iter()
            .find(|(m, _)| m == method::JOIN)
            .unwrap();
        assert_eq!(join["displayName"], "Alexxxxer");
        assert_eq!(h.devices.produced_app_data(), vec![json!({ "source": "mic" })]);

        // No further code prompts once joined.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.session.snapshot().last_prompt, Some(Prompt::Joined));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_toggles_mute_once_joined() {
        let h = Harness::start(CODE_ROUTED, &[]).await;
        h.join().await;

        h.press("0").await;
        let snapshot = h.wait(|s| s.muted).await;
        assert_eq!(snapshot.last_prompt, Some(Prompt::Muted));

        h.press("5").await;
        h.press("0").await;
        let snapshot = h.wait(|s| !s.muted).await;
        assert_eq!(snapshot.last_prompt, Some(Prompt::Unmuted));
        assert_eq!(snapshot.tones, "");
    }

    #[tokio::test(start_paused = true)]
    async fn direct_room_uses_header() {
        let h = Harness::start(DIRECT_ROOM, &[("x-room", " MyRoom ")]).await;
        h.state(CallState::Established);
        let snapshot = h.wait(|s| s.joined).await;
        assert_eq!(snapshot.room.as_deref(), Some("myroom"));
        assert_eq!(snapshot.last_prompt, Some(Prompt::Joined));
    }

    #[tokio::test(start_paused = true)]
    async fn direct_room_without_room_ends_call() {
        let h = Harness::start(DIRECT_ROOM, &[]).await;
        h.state(CallState::Established);
        h.wait(|s| s.state == CallState::Terminated).await;
        assert!(h.leg.terminated.load(Ordering::SeqCst));
        assert!(h.registry.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_hangup_releases_everything() {
        let h = Harness::start(CODE_ROUTED, &[]).await;
        h.join().await;
        let output = h.session.output();

        h.state(CallState::Terminated);
        h.wait(|s| s.state == CallState::Terminated).await;
        assert!(h.session.is_closed());
        assert!(h.registry.is_empty().await);
        assert!(h.room.is_closed());
        assert!(output.audio.is_ended());
        assert!(output.video.is_ended());
        assert!(!h.leg.terminated.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn close_terminates_the_leg() {
        let h = Harness::start(CODE_ROUTED, &[]).await;
        h.establish().await;
        h.session.close().await;
        assert!(h.session.is_closed());
        assert!(h.leg.terminated.load(Ordering::SeqCst));
        assert!(h.registry.get("call-1").await.is_none());
        // Idempotent.
        h.session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn kick_ends_the_call() {
        let h = Harness::start(CODE_ROUTED, &[]).await;
        h.join().await;
        h.room.notify(method::MODERATOR_KICK, json!({}));
        h.wait(|s| s.state == CallState::Terminated).await;
        assert!(h.leg.terminated.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_conference_join_ends_the_call() {
        let script = RoomScript {
            fail_on: Some(method::JOIN.to_string()),
            ..RoomScript::with_peers(&["alice"])
        };
        let h = Harness::with_room(CODE_ROUTED, &[], script).await;
        h.establish().await;
        h.press("00000").await;
        h.wait(|s| s.joined && !s.joining).await;

        h.room.notify(method::ROOM_READY, json!({ "turnServers": [] }));
        let snapshot = h.wait(|s| s.state == CallState::Terminated).await;
        assert_eq!(snapshot.room.as_deref(), Some("test"));
        assert!(h.leg.terminated.load(Ordering::SeqCst));
        assert!(h.registry.is_empty().await);
        assert!(h.room.is_closed());
        assert_eq!(h.room.count(method::PRODUCE), 0);
        assert!(h.session.output().audio.is_ended());
    }
}
