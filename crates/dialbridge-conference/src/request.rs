//! Request/response correlation with a per-request timeout.
//!
//! Each request registers a one-shot slot keyed by its id. Exactly one of
//! {response, timeout, channel loss} takes the slot out of the table; whoever
//! arrives second finds nothing and is ignored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use dialbridge_common::{BridgeError, BridgeResult};

use crate::protocol::{Frame, RemoteError};

struct Pending {
    method: String,
    reply: oneshot::Sender<BridgeResult<Value>>,
}

/// In-flight requests keyed by id.
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<u64, Pending>>,
}

impl PendingRequests {
    pub fn register(&self, id: u64, method: &str) -> oneshot::Receiver<BridgeResult<Value>> {
        let (reply, rx) = oneshot::channel();
        self.lock().insert(
            id,
            Pending {
                method: method.to_string(),
                reply,
            },
        );
        rx
    }

    /// Complete request `id`. Returns `false` if it already completed or timed out.
    pub fn resolve(&self, id: u64, result: Result<Value, RemoteError>) -> bool {
        let Some(pending) = self.lock().remove(&id) else {
            tracing::debug!(id, "Ignoring response for unknown or expired request");
            return false;
        };
        let result = result.map_err(|err| BridgeError::Rejected {
            method: pending.method,
            code: err.code,
            reason: err.reason,
        });
        let _ = pending.reply.send(result);
        true
    }

    /// Forget request `id` without completing it.
    pub fn cancel(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Fail every in-flight request.
    pub fn fail_all(&self, err: impl Fn() -> BridgeError) {
        let drained: Vec<Pending> = self.lock().drain().map(|(_, p)| p).collect();
        for pending in drained {
            let _ = pending.reply.send(Err(err()));
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Pending>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Client half of the RPC layer shared by every channel implementation.
pub struct Requester {
    pending: PendingRequests,
    next_id: AtomicU64,
    timeout: Duration,
    connected: AtomicBool,
    outbound: mpsc::UnboundedSender<Frame>,
}

impl Requester {
    pub fn new(timeout: Duration, outbound: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            pending: PendingRequests::default(),
            next_id: AtomicU64::new(1),
            timeout,
            connected: AtomicBool::new(false),
            outbound,
        }
    }

    /// Send `method` and wait for its response or the timeout, whichever comes first.
    pub async fn request(&self, method: &str, data: Value) -> BridgeResult<Value> {
        if !self.is_connected() {
            return Err(BridgeError::NotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.pending.register(id, method);
        let frame = Frame::Request {
            id,
            method: method.to_string(),
            data,
        };
        if self.outbound.send(frame).is_err() {
            self.pending.cancel(id);
            return Err(BridgeError::ChannelClosed);
        }
        tracing::debug!(id, method, "Signaling request sent");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::ChannelClosed),
            Err(_) => {
                self.pending.cancel(id);
                tracing::warn!(id, method, timeout = ?self.timeout, "Signaling request timed out");
                Err(BridgeError::RequestTimeout {
                    method: method.to_string(),
                })
            }
        }
    }

    pub fn resolve(&self, id: u64, result: Result<Value, RemoteError>) -> bool {
        self.pending.resolve(id, result)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Mark the channel down and fail everything still waiting.
    pub fn disconnect(&self) {
        self.set_connected(false);
        self.pending.fail_all(|| BridgeError::ChannelClosed);
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Sender for frames that go out on this channel (used for replies).
    pub fn outbound(&self) -> mpsc::UnboundedSender<Frame> {
        self.outbound.clone()
    }
}
