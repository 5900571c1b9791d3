use std::env;
use std::sync::Arc;

use rowmill_common::WorkerOptions;
use rowmill_coordinator::{Coordinator, MemCoordinator};
use rowmill_worker::Worker;
use tracing_subscriber::EnvFilter;

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let opt = WorkerOptions {
        listen_host: env_or_default("ROWMILL_LISTEN_HOST", "127.0.0.1:7466"),
        advertised_host: env_or_default("ROWMILL_ADVERTISED_HOST", "127.0.0.1:"),
        ..WorkerOptions::default()
    };

    // The in-memory coordinator scopes this binary to a single-process
    // cluster; deployments share a coordinator implementation behind the
    // same trait.
    let crd: Arc<dyn Coordinator> = Arc::new(MemCoordinator::new());
    let worker = Worker::new(crd, opt)?;
    worker.start().await?;
    println!(
        "rowmill-worker serving on {}",
        worker.advertised_host().unwrap_or_default()
    );

    tokio::signal::ctrl_c().await?;
    worker.stop().await?;
    Ok(())
}
