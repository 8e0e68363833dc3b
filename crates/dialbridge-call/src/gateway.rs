//! Entry point for inbound calls.
//!
//! The embedding call-control adapter supplies each [`CallLeg`] and its event
//! stream, and a [`DeviceFactory`](dialbridge_conference::DeviceFactory) for
//! the [`ConferenceClient`]; this crate ships neither.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use dialbridge_common::config::AppConfig;
use dialbridge_common::{BridgeResult, MediaStream};
use dialbridge_conference::ConferenceClient;

use crate::directory::RoomDirectory;
use crate::leg::{CallEvent, CallLeg};
use crate::prompts::PromptLibrary;
use crate::registry::SessionRegistry;
use crate::session::{CallBridgeSession, SessionContext, SessionHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    pub active_sessions: usize,
    pub joined_sessions: usize,
}

/// Owns the session registry and spawns one session per invite.
#[derive(Clone)]
pub struct Gateway {
    ctx: SessionContext,
}

impl Gateway {
    pub fn new(
        config: &AppConfig,
        client: ConferenceClient,
        directory: Arc<dyn RoomDirectory>,
        prompts: Arc<PromptLibrary>,
    ) -> Self {
        let ctx = SessionContext::new(config, client, directory, prompts, SessionRegistry::new());
        Self { ctx }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.ctx.registry
    }

    pub async fn handle_invite(
        &self,
        leg: Arc<dyn CallLeg>,
        events: mpsc::UnboundedReceiver<CallEvent>,
    ) -> BridgeResult<SessionHandle> {
        CallBridgeSession::spawn(self.ctx.clone(), leg, events).await
    }

    /// Outbound media of a live session, for the call-control adapter.
    pub async fn media_for(&self, session_id: &str) -> Option<MediaStream> {
        self.ctx.registry.media(session_id).await
    }

    pub async fn stats(&self) -> GatewayStats {
        let handles = self.ctx.registry.handles().await;
        GatewayStats {
            active_sessions: handles.len(),
            joined_sessions: handles.iter().filter(|h| h.snapshot().joined).count(),
        }
    }

    /// Hang up every call.
    pub async fn disconnect_all(&self) {
        let handles = self.ctx.registry.handles().await;
        if handles.is_empty() {
            return;
        }
        tracing::info!(sessions = handles.len(), "Disconnecting all sessions");
        for handle in handles {
            handle.close().await;
        }
    }
}
