//! Worker: one thread, one connection, running the reliability protocol.
//!
//! The worker is a Paranoid-Pirate style peer: it announces itself with
//! `READY`, exchanges heartbeats with the host's routing endpoint, services
//! `REQUEST` envelopes through the dispatch core, and reconnects with a
//! fresh identity and exponential backoff when the host goes quiet. Nested
//! outbound calls made by a running callable re-enter the same receive loop,
//! which routes the matching `RESPONSE` back to the call site instead of
//! treating it as new inbound work.

use std::cell::RefCell;
use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::{json, Value};

use super::wire::{self, Envelope, EnvelopeKind, Message};
use crate::dispatch::{Dispatcher, HostChannel};
use crate::error::{code, PluginError, Result};
use crate::registry::PluginResult;

/// Timing knobs of the reliability protocol. The defaults match the wire
/// contract with the host; tests shrink them.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Heartbeat interval `H`; also the poll timeout.
    pub heartbeat_interval: Duration,
    /// Missed intervals tolerated before the connection is considered dead.
    pub heartbeat_liveness: u32,
    /// Initial reconnect backoff.
    pub interval_init: Duration,
    /// Reconnect backoff ceiling.
    pub interval_max: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_liveness: 3,
            interval_init: Duration::from_secs(1),
            interval_max: Duration::from_secs(32),
        }
    }
}

impl ProtocolConfig {
    /// How long the pool waits on a worker thread per maintenance round.
    pub fn join_timeout(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_liveness
    }
}

static IDENTITY_PREFIX: OnceLock<u16> = OnceLock::new();

/// A fresh socket identity: a process-wide random prefix plus a random
/// suffix per connection.
pub(crate) fn random_identity() -> String {
    let prefix = *IDENTITY_PREFIX.get_or_init(|| rand::thread_rng().gen());
    format!("{prefix:04X}-{:04X}", rand::thread_rng().gen::<u16>())
}

/// One connection to the host's routing endpoint. Owned by exactly one
/// thread; connections are never shared.
pub(crate) struct Conn {
    stream: TcpStream,
    pub(crate) identity: String,
}

impl Conn {
    pub(crate) fn open(addr: &str, config: &ProtocolConfig) -> Result<Conn> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(config.heartbeat_interval))?;
        let identity = random_identity();
        wire::write_identity(&mut stream, &identity)?;
        wire::write_message(&mut stream, &Message::Ready)?;
        tracing::debug!(%identity, addr, "connected to host");
        Ok(Conn { stream, identity })
    }

    pub(crate) fn send(&mut self, msg: &Message) -> io::Result<()> {
        wire::write_message(&mut self.stream, msg)
    }

    /// Wait up to the heartbeat interval for one message.
    pub(crate) fn poll(&mut self) -> Result<Option<Message>> {
        wire::poll_message(&mut self.stream)
    }
}

/// State shared between the pool and its workers.
pub(crate) struct WorkerShared {
    pub(crate) addr: String,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) stop: Arc<AtomicBool>,
    /// Count of workers currently servicing a top-level (zero-bounce) call.
    pub(crate) busy: Arc<AtomicUsize>,
    pub(crate) config: ProtocolConfig,
}

/// Why the message loop ended.
enum LoopExit {
    /// Stop signal observed; `SHUTDOWN` was sent.
    Stopped,
    /// Connection unusable; the pool is responsible for respawning.
    Dead,
    /// A nested outbound call received its correlated response.
    Response(Vec<u8>),
}

/// Holds the pool-wide busy count up for the duration of a top-level call.
struct BusyGuard(Arc<AtomicUsize>);

impl BusyGuard {
    fn acquire(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct Worker {
    shared: Arc<WorkerShared>,
    conn: Conn,
    liveness: u32,
    interval: Duration,
    heartbeat_at: Instant,
    /// Nesting depth of the in-flight outbound call chain. Zero except
    /// while a callable is waiting on a nested response.
    bounce_count: u64,
    request_id: Vec<u8>,
}

impl Worker {
    pub(crate) fn connect(shared: Arc<WorkerShared>) -> Result<Worker> {
        let conn = Conn::open(&shared.addr, &shared.config)?;
        let liveness = shared.config.heartbeat_liveness;
        let interval = shared.config.interval_init;
        let heartbeat_at = Instant::now() + shared.config.heartbeat_interval;
        Ok(Worker {
            shared,
            conn,
            liveness,
            interval,
            heartbeat_at,
            bounce_count: 0,
            request_id: Vec::new(),
        })
    }

    pub(crate) fn run(mut self) {
        match self.message_loop() {
            LoopExit::Stopped => {
                tracing::debug!(identity = %self.conn.identity, "worker shut down cleanly")
            }
            LoopExit::Dead => {
                tracing::warn!(identity = %self.conn.identity, "worker connection dead, exiting")
            }
            LoopExit::Response(_) => {
                tracing::warn!(identity = %self.conn.identity, "stray response at top level, exiting")
            }
        }
    }

    /// The protocol loop. Handles heartbeats, services requests, and - when
    /// called re-entrantly from `send_action` - returns the response that
    /// terminates the current blocking send.
    fn message_loop(&mut self) -> LoopExit {
        let config = self.shared.config.clone();
        loop {
            match self.conn.poll() {
                Ok(Some(msg)) => {
                    self.interval = config.interval_init;
                    match msg {
                        Message::Heartbeat => {
                            self.liveness = config.heartbeat_liveness;
                        }
                        Message::Envelope(env) if env.kind == EnvelopeKind::Request => {
                            self.liveness = config.heartbeat_liveness;
                            if let Err(e) = self.handle_request(env) {
                                tracing::warn!(error = %e, "failed to answer request");
                                return LoopExit::Dead;
                            }
                        }
                        Message::Envelope(env) => {
                            self.liveness = config.heartbeat_liveness;
                            if self.bounce_count == 0 {
                                tracing::warn!("response arrived with no call in flight");
                                return LoopExit::Dead;
                            }
                            if env.request_id != self.request_id {
                                tracing::warn!("response for a different request id");
                                return LoopExit::Dead;
                            }
                            if env.bounce_count != self.bounce_count {
                                tracing::warn!(
                                    got = env.bounce_count,
                                    want = self.bounce_count,
                                    "response for a different bounce depth"
                                );
                                return LoopExit::Dead;
                            }
                            self.bounce_count -= 1;
                            return LoopExit::Response(env.payload);
                        }
                        other => {
                            tracing::warn!(?other, "invalid message, assuming connection dead");
                            return LoopExit::Dead;
                        }
                    }
                }
                Ok(None) => {
                    // Poll timeout: the host missed an interval.
                    self.liveness = self.liveness.saturating_sub(1);
                    if self.liveness == 0 {
                        tracing::warn!(
                            backoff = ?self.interval,
                            "heartbeat failure, can't reach host; reconnecting"
                        );
                        thread::sleep(self.interval);
                        if self.interval < config.interval_max {
                            self.interval =
                                std::cmp::min(self.interval * 2, config.interval_max);
                        }
                        match Conn::open(&self.shared.addr, &config) {
                            Ok(conn) => {
                                // Old identity is abandoned, never reused.
                                self.conn = conn;
                                self.liveness = config.heartbeat_liveness;
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "reconnect failed");
                                return LoopExit::Dead;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "receive failed, assuming connection dead");
                    return LoopExit::Dead;
                }
            }

            if Instant::now() >= self.heartbeat_at {
                self.heartbeat_at = Instant::now() + config.heartbeat_interval;
                if self.conn.send(&Message::Heartbeat).is_err() {
                    return LoopExit::Dead;
                }
            }

            if self.shared.stop.load(Ordering::SeqCst) {
                let _ = self.conn.send(&Message::Shutdown);
                return LoopExit::Stopped;
            }
        }
    }

    /// Service one inbound `REQUEST` and write back its `RESPONSE`.
    fn handle_request(&mut self, env: Envelope) -> Result<()> {
        // A request can arrive while an outer call is still waiting on its
        // nested response, so the correlation state is stacked, not replaced.
        let saved_request_id = std::mem::replace(&mut self.request_id, env.request_id.clone());
        let saved_bounce = self.bounce_count;
        self.bounce_count = env.bounce_count;

        let dispatcher = Arc::clone(&self.shared.dispatcher);
        let _busy = (env.bounce_count == 0)
            .then(|| BusyGuard::acquire(Arc::clone(&self.shared.busy)));

        let response = {
            let cell = RefCell::new(&mut *self);
            let channel = NestedChannel { worker: &cell };
            dispatcher.dispatch_payload(&env.payload, Some(&channel))
        };

        self.request_id = saved_request_id;
        self.bounce_count = saved_bounce;

        self.conn.send(&Message::Envelope(Envelope::response(
            env.client,
            env.bounce_count,
            env.request_id,
            response,
        )))?;
        Ok(())
    }

    /// Originate a nested outbound call on this worker's live connection,
    /// then re-enter the receive loop until the correlated response arrives.
    fn send_action(&mut self, action: &str, payload: Value) -> PluginResult<Value> {
        self.bounce_count += 1;
        let body = json!({ "action": action, "payload": payload });
        let env = Envelope::request(
            self.conn.identity.clone().into_bytes(),
            self.bounce_count,
            self.request_id.clone(),
            body.to_string().into_bytes(),
        );
        if let Err(e) = self.conn.send(&Message::Envelope(env)) {
            self.bounce_count -= 1;
            return Err(PluginError::new(
                format!("failed to send action '{action}': {e}"),
                code::PLUGIN_UNAVAILABLE,
            ));
        }

        match self.message_loop() {
            LoopExit::Response(payload) => serde_json::from_slice(&payload).map_err(|e| {
                PluginError::unexpected(format!("malformed action response: {e}"))
            }),
            LoopExit::Stopped | LoopExit::Dead => Err(PluginError::new(
                format!("connection lost while waiting for action '{action}'"),
                code::PLUGIN_UNAVAILABLE,
            )),
        }
    }
}

/// Routes a callable's outbound calls through the worker that is currently
/// executing it. The `RefCell` hands the worker's connection back to the
/// call site without aliasing the exclusive borrow held by the loop.
struct NestedChannel<'a, 'b> {
    worker: &'a RefCell<&'b mut Worker>,
}

impl HostChannel for NestedChannel<'_, '_> {
    fn send_action(&self, action: &str, payload: Value) -> PluginResult<Value> {
        let mut worker = self.worker.try_borrow_mut().map_err(|_| {
            PluginError::new(
                "outbound call attempted while another is in flight",
                code::NOT_SUPPORTED,
            )
        })?;
        worker.send_action(action, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_format() {
        let id = random_identity();
        assert_eq!(id.len(), 9);
        let (prefix, suffix) = id.split_once('-').unwrap();
        assert!(u16::from_str_radix(prefix, 16).is_ok());
        assert!(u16::from_str_radix(suffix, 16).is_ok());
    }

    #[test]
    fn test_identities_are_unique_per_connection() {
        let a = random_identity();
        let b = random_identity();
        // Same process prefix, fresh suffix.
        assert_eq!(a.split_once('-').unwrap().0, b.split_once('-').unwrap().0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_join_timeout_is_interval_times_liveness() {
        let config = ProtocolConfig {
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_liveness: 3,
            ..Default::default()
        };
        assert_eq!(config.join_timeout(), Duration::from_millis(150));
    }
}
