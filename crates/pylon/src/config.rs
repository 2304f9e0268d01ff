//! Runtime configuration, merged from defaults and `PYLON_*` environment
//! variables.

use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transport::{PoolConfig, ProtocolConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The host's routing endpoint for the worker socket transport.
    pub address: String,
    /// Serve the HTTP transport instead of the worker pool.
    pub http: bool,
    /// Listen address for the HTTP transport.
    pub http_addr: String,
    /// Initial worker-pool size.
    pub workers: usize,
    /// Pool growth ceiling.
    pub worker_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:5555".to_string(),
            http: false,
            http_addr: "0.0.0.0:8000".to_string(),
            workers: 4,
            worker_limit: 8,
        }
    }
}

impl Config {
    /// Load configuration: defaults overlaid with `PYLON_*` env vars
    /// (e.g. `PYLON_ADDRESS`, `PYLON_WORKERS`).
    pub fn load() -> Result<Self> {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Env::prefixed("PYLON_"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.workers,
            limit: self.worker_limit,
            protocol: ProtocolConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.address, "127.0.0.1:5555");
        assert!(!config.http);
        assert_eq!(config.workers, 4);
        assert_eq!(config.worker_limit, 8);
    }

    #[test]
    fn test_env_overrides() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("PYLON_ADDRESS", "10.0.0.1:7777");
            jail.set_env("PYLON_WORKERS", "2");
            let config = Config::load().expect("config");
            assert_eq!(config.address, "10.0.0.1:7777");
            assert_eq!(config.workers, 2);
            // Untouched keys keep their defaults.
            assert_eq!(config.worker_limit, 8);
            Ok(())
        });
    }

    #[test]
    fn test_pool_config_mapping() {
        let config = Config {
            workers: 3,
            worker_limit: 6,
            ..Default::default()
        };
        let pool = config.pool_config();
        assert_eq!(pool.workers, 3);
        assert_eq!(pool.limit, 6);
    }
}
