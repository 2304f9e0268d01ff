//! Pylon - plugin runtime
//!
//! Register typed extension points (ops, data-mutation hooks, timers,
//! HTTP-like handlers, lifecycle events, and pluggable providers) and serve
//! them to a host process:
//! - over the reliable worker socket protocol (`transport::WorkerPool`), or
//! - over the equivalent HTTP interface (`transport::http`).
//!
//! ```rust,ignore
//! let mut registry = Registry::new();
//! registry.op("hello", |_ctx, _args| Ok(serde_json::json!("world")));
//!
//! let dispatcher = Arc::new(Dispatcher::new(registry));
//! let pool = WorkerPool::new("127.0.0.1:5555", dispatcher, PoolConfig::default());
//! pool.run();
//! ```

// Configuration
pub mod config;

// Dispatch core shared by every transport
pub mod dispatch;

// Error types and wire error codes
pub mod error;

// Record payload convention for hooks
pub mod record;

// Extension point registry
pub mod registry;

// Worker socket protocol and HTTP transports
pub mod transport;

pub use config::Config;
pub use dispatch::{CallContext, Dispatcher, HandlerRequest, HandlerResponse, HostChannel};
pub use error::{Error, PluginError, Result};
pub use record::{Record, RecordId};
pub use registry::{ExtensionKind, OpArgs, Provider, Registry};
pub use transport::{OneOffWorker, PoolConfig, ProtocolConfig, WorkerPool};
