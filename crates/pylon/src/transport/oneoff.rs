//! One-off outbound worker: a transient connection used to originate a
//! single call toward the host from outside any worker's request loop
//! (startup code, background jobs). Code running *inside* a worker should
//! use [`CallContext::send_action`](crate::dispatch::CallContext::send_action)
//! instead, which rides the worker's existing connection as a nested call.

use std::time::Instant;

use serde_json::{json, Value};
use uuid::Uuid;

use super::wire::{Envelope, EnvelopeKind, Message};
use super::worker::{Conn, ProtocolConfig};
use crate::dispatch::HostChannel;
use crate::error::{code, PluginError};
use crate::registry::PluginResult;

/// Performs the connect handshake, sends exactly one `REQUEST`, blocks for
/// the correlated `RESPONSE`, then tears the connection down. It never
/// enters the long-lived heartbeat loop.
pub struct OneOffWorker {
    addr: String,
    config: ProtocolConfig,
}

impl OneOffWorker {
    pub fn new(addr: impl Into<String>) -> Self {
        Self::with_config(addr, ProtocolConfig::default())
    }

    pub fn with_config(addr: impl Into<String>, config: ProtocolConfig) -> Self {
        Self {
            addr: addr.into(),
            config,
        }
    }

    /// Send one action and wait for its response.
    ///
    /// The wait has no deadline: a host that never answers blocks the
    /// caller indefinitely. Heartbeats are still sent while waiting so the
    /// host does not cull the connection as dead.
    pub fn send_action(&self, action: &str, payload: Value) -> PluginResult<Value> {
        let mut conn = Conn::open(&self.addr, &self.config).map_err(|e| {
            PluginError::new(
                format!("failed to reach host at {}: {e}", self.addr),
                code::PLUGIN_UNAVAILABLE,
            )
        })?;

        let request_id = Uuid::new_v4().to_string().into_bytes();
        let body = json!({ "action": action, "payload": payload });
        let env = Envelope::request(
            conn.identity.clone().into_bytes(),
            0,
            request_id.clone(),
            body.to_string().into_bytes(),
        );
        conn.send(&Message::Envelope(env)).map_err(|e| {
            PluginError::new(
                format!("failed to send action '{action}': {e}"),
                code::PLUGIN_UNAVAILABLE,
            )
        })?;

        let mut heartbeat_at = Instant::now() + self.config.heartbeat_interval;
        loop {
            let msg = conn.poll().map_err(|e| {
                PluginError::new(
                    format!("connection lost while waiting for action '{action}': {e}"),
                    code::PLUGIN_UNAVAILABLE,
                )
            })?;

            match msg {
                Some(Message::Heartbeat) | None => {}
                Some(Message::Envelope(env))
                    if env.kind == EnvelopeKind::Response && env.request_id == request_id =>
                {
                    let _ = conn.send(&Message::Shutdown);
                    return serde_json::from_slice(&env.payload).map_err(|e| {
                        PluginError::unexpected(format!("malformed action response: {e}"))
                    });
                }
                Some(other) => {
                    tracing::warn!(?other, "ignoring unrelated message on one-off connection");
                }
            }

            if Instant::now() >= heartbeat_at {
                heartbeat_at = Instant::now() + self.config.heartbeat_interval;
                let _ = conn.send(&Message::Heartbeat);
            }
        }
    }
}

impl HostChannel for OneOffWorker {
    fn send_action(&self, action: &str, payload: Value) -> PluginResult<Value> {
        OneOffWorker::send_action(self, action, payload)
    }
}
