//! Worker pool: owns the worker threads, replaces dead ones, and grows
//! capacity when every worker is saturated.
//!
//! The pool never shrinks. Growth is bounded by a configurable slot limit;
//! respawn is unbounded because a dead worker usually means the host went
//! away and came back.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::worker::{ProtocolConfig, Worker, WorkerShared};
use crate::dispatch::Dispatcher;

/// Pool sizing and protocol timing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker slots at startup.
    pub workers: usize,
    /// Ceiling for growth; the pool never exceeds this many slots.
    pub limit: usize,
    pub protocol: ProtocolConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            limit: 8,
            protocol: ProtocolConfig::default(),
        }
    }
}

struct WorkerSlot {
    handle: JoinHandle<()>,
}

/// Supervises a set of worker threads connected to one host endpoint.
pub struct WorkerPool {
    shared: Arc<WorkerShared>,
    slots: Mutex<Vec<WorkerSlot>>,
    limit: usize,
    /// Lifetime count of workers ever started; observability, not
    /// correctness.
    workers_opened: AtomicUsize,
    initial_workers: usize,
}

impl WorkerPool {
    pub fn new(addr: impl Into<String>, dispatcher: Arc<Dispatcher>, config: PoolConfig) -> Self {
        let shared = Arc::new(WorkerShared {
            addr: addr.into(),
            dispatcher,
            stop: Arc::new(AtomicBool::new(false)),
            busy: Arc::new(AtomicUsize::new(0)),
            config: config.protocol,
        });
        Self {
            shared,
            slots: Mutex::new(Vec::new()),
            limit: config.limit.max(config.workers),
            workers_opened: AtomicUsize::new(0),
            initial_workers: config.workers,
        }
    }

    fn spawn_worker(&self) -> WorkerSlot {
        let shared = Arc::clone(&self.shared);
        self.workers_opened.fetch_add(1, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name("pylon-worker".to_string())
            .spawn(move || match Worker::connect(shared) {
                Ok(worker) => worker.run(),
                Err(e) => tracing::warn!(error = %e, "worker failed to connect"),
            })
            .expect("failed to spawn worker thread");
        WorkerSlot { handle }
    }

    /// Start the initial worker threads.
    pub fn start(&self) {
        let mut slots = self.slots.lock();
        for _ in 0..self.initial_workers {
            slots.push(self.spawn_worker());
        }
        tracing::info!(workers = slots.len(), addr = %self.shared.addr, "worker pool started");
    }

    /// Start the pool and supervise it until [`WorkerPool::stop`] is called
    /// from another thread.
    pub fn run(&self) {
        self.start();
        self.maintain();
    }

    /// The maintenance loop: visit slots round-robin, wait up to `H*L` on
    /// each, replace dead occupants in place, and grow the pool by one slot
    /// when every worker is simultaneously busy with a top-level call.
    pub fn maintain(&self) {
        let join_timeout = self.shared.config.join_timeout();
        let mut i = 0usize;
        loop {
            self.wait_on_slot(i, join_timeout);

            if self.shared.stop.load(Ordering::SeqCst) {
                tracing::info!("workers are shutting down, stopping maintenance loop");
                return;
            }

            let mut slots = self.slots.lock();
            if slots.is_empty() {
                return;
            }
            if i >= slots.len() {
                i = 0;
            }

            if slots[i].handle.is_finished() {
                tracing::warn!(slot = i, "worker thread dead, starting a new one");
                let dead = std::mem::replace(&mut slots[i], self.spawn_worker());
                let _ = dead.handle.join();
            }

            let occupied = self.shared.busy.load(Ordering::SeqCst);
            if occupied >= slots.len() && slots.len() < self.limit {
                tracing::info!(
                    workers = slots.len(),
                    "all workers busy, growing pool by one"
                );
                let new_worker = self.spawn_worker();
                slots.push(new_worker);
            }

            i = (i + 1) % slots.len();
        }
    }

    /// Analog of joining a thread with a timeout: poll the slot's handle
    /// until it finishes, the stop signal is raised, or the wait elapses.
    fn wait_on_slot(&self, i: usize, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.stop.load(Ordering::SeqCst) || Instant::now() >= deadline {
                return;
            }
            {
                let slots = self.slots.lock();
                match slots.get(i) {
                    Some(slot) if slot.handle.is_finished() => return,
                    Some(_) => {}
                    None => return,
                }
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Signal every worker to shut down cleanly and join them all.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        let drained: Vec<WorkerSlot> = {
            let mut slots = self.slots.lock();
            slots.drain(..).collect()
        };
        for slot in drained {
            let _ = slot.handle.join();
        }
        tracing::info!("worker pool stopped");
    }

    /// Current number of worker slots.
    pub fn worker_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Number of slots whose occupant thread is still running.
    pub fn live_worker_count(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|slot| !slot.handle.is_finished())
            .count()
    }

    /// Lifetime count of workers ever started.
    pub fn workers_opened(&self) -> usize {
        self.workers_opened.load(Ordering::SeqCst)
    }

    /// Workers currently servicing a top-level call.
    pub fn busy_count(&self) -> usize {
        self.shared.busy.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("addr", &self.shared.addr)
            .field("slots", &self.worker_count())
            .field("limit", &self.limit)
            .field("workers_opened", &self.workers_opened())
            .finish()
    }
}
