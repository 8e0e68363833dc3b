//! WebRTC device and transport seam.
//!
//! ICE, DTLS, RTP and the codecs live in whatever media stack backs these
//! traits. The conference client drives them. A transport calls back through
//! [`TransportSignaling`] whenever it needs the room server: DTLS connect,
//! producer registration, or notice that it closed underneath us.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use dialbridge_common::config::TurnServer;
use dialbridge_common::{BridgeResult, MediaKind, MediaTrack};

use crate::capabilities::RouterCapabilities;
use crate::protocol::TransportInfo;

/// Opus parameters for produced audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodecOptions {
    pub opus_stereo: bool,
    pub opus_dtx: bool,
    pub opus_fec: bool,
    pub opus_ptime: u32,
    pub opus_max_playback_rate: u32,
}

impl CodecOptions {
    /// Profile for a single telephone voice: mono, DTX, in-band FEC.
    pub fn voice() -> Self {
        Self {
            opus_stereo: false,
            opus_dtx: true,
            opus_fec: true,
            opus_ptime: 3,
            opus_max_playback_rate: 48_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportDirection {
    Send,
    Recv,
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub id: String,
    pub direction: TransportDirection,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
    pub ice_servers: Vec<TurnServer>,
}

impl TransportOptions {
    pub fn new(info: TransportInfo, direction: TransportDirection, ice_servers: Vec<TurnServer>) -> Self {
        Self {
            id: info.id,
            direction,
            ice_parameters: info.ice_parameters,
            ice_candidates: info.ice_candidates,
            dtls_parameters: info.dtls_parameters,
            ice_servers,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProduceParams {
    pub track: MediaTrack,
    pub codec_options: Option<CodecOptions>,
    pub app_data: Value,
}

#[derive(Debug, Clone)]
pub struct ConsumeParams {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub app_data: Value,
}

/// Callbacks from a transport into the room signaling.
#[async_trait]
pub trait TransportSignaling: Send + Sync {
    /// Complete the DTLS handshake parameters with the server.
    async fn connect(&self, transport_id: &str, dtls_parameters: Value) -> BridgeResult<()>;

    /// Register a new producer and return its server-side id.
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> BridgeResult<String>;

    /// The transport closed on its own (ICE failure, DTLS teardown).
    fn transport_closed(&self, transport_id: &str);
}

#[async_trait]
pub trait SendTransport: Send + Sync {
    fn id(&self) -> &str;

    /// Start sending `params.track`; returns the producer id.
    async fn produce(&mut self, params: ProduceParams) -> BridgeResult<String>;

    fn close_producer(&mut self, producer_id: &str);

    fn close(&mut self);
}

#[async_trait]
pub trait RecvTransport: Send + Sync {
    fn id(&self) -> &str;

    /// Start receiving a remote producer; the returned track carries decoded media.
    async fn consume(&mut self, params: ConsumeParams) -> BridgeResult<MediaTrack>;

    fn pause_consumer(&mut self, consumer_id: &str);

    fn resume_consumer(&mut self, consumer_id: &str);

    fn close_consumer(&mut self, consumer_id: &str);

    fn close(&mut self);
}

/// One negotiated media device, created fresh for every join.
#[async_trait]
pub trait RtcDevice: Send + Sync {
    async fn load(&mut self, capabilities: &RouterCapabilities) -> BridgeResult<()>;

    /// Local capabilities sent with `join`.
    fn rtp_capabilities(&self) -> Value;

    fn can_produce(&self, kind: MediaKind) -> bool;

    async fn create_send_transport(
        &self,
        options: TransportOptions,
        signaling: Arc<dyn TransportSignaling>,
    ) -> BridgeResult<Box<dyn SendTransport>>;

    async fn create_recv_transport(
        &self,
        options: TransportOptions,
        signaling: Arc<dyn TransportSignaling>,
    ) -> BridgeResult<Box<dyn RecvTransport>>;
}

pub trait DeviceFactory: Send + Sync {
    fn create(&self) -> Box<dyn RtcDevice>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn voice_profile_matches_wire_names() {
        let value = serde_json::to_value(CodecOptions::voice()).unwrap();
        assert_eq!(
            value,
            json!({
                "opusStereo": false,
                "opusDtx": true,
                "opusFec": true,
                "opusPtime": 3,
                "opusMaxPlaybackRate": 48000
            })
        );
    }
}
