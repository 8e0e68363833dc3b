//! Conference room side of the bridge.
//!
//! The [`ConferenceClient`] joins one room per call over a reconnecting
//! signaling channel, drives a WebRTC device through the [`device`] traits,
//! and feeds remote tracks into the session's mixer, gated by the
//! [`SpotlightSelector`].

pub mod capabilities;
pub mod channel;
pub mod client;
pub mod device;
pub mod protocol;
pub mod request;
pub mod spotlight;

#[cfg(any(test, feature = "test-util"))]
pub mod loopback;

pub use capabilities::RouterCapabilities;
pub use channel::{ChannelConnector, ChannelEvent, ChannelHandle, SignalingChannel, WsConnector};
pub use client::{
    ClientSnapshot, CloseReason, ConferenceClient, ConferenceEvent, ConferenceHandle,
    ConferenceOptions,
};
pub use device::{DeviceFactory, RtcDevice};
pub use spotlight::SpotlightSelector;
