//! Pylon runner
//!
//! Starts an (empty) plugin runtime against the configured host endpoint.
//! Plugin crates normally depend on the `pylon` library, register their
//! extension points, and reuse this same startup sequence.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pylon::{Config, Dispatcher, Registry, WorkerPool};

fn main() -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("pylon=info,tower_http=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    info!("starting pylon v{}", env!("CARGO_PKG_VERSION"));

    let registry = Registry::new();
    let dispatcher = Arc::new(Dispatcher::new(registry));

    if config.http {
        let addr = config
            .http_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid http_addr '{}': {e}", config.http_addr))?;
        tokio::select! {
            result = pylon::transport::http::serve(addr, dispatcher) => result?,
            _ = tokio::signal::ctrl_c() => info!("shutting down http transport"),
        }
    } else {
        let pool = Arc::new(WorkerPool::new(
            &config.address,
            dispatcher,
            config.pool_config(),
        ));
        let runner = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.run())
        };
        tokio::signal::ctrl_c().await?;
        info!("shutting down all workers");
        pool.stop();
        let _ = runner.join();
    }

    Ok(())
}
