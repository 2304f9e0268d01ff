//! Transports that carry requests into the dispatch core: the reliable
//! worker socket protocol (worker / pool / one-off) and the equivalent
//! HTTP interface.

pub mod http;
pub mod oneoff;
pub mod pool;
pub mod wire;
pub mod worker;

pub use oneoff::OneOffWorker;
pub use pool::{PoolConfig, WorkerPool};
pub use worker::ProtocolConfig;
