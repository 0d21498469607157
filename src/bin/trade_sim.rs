//! Simulated-broker worker. Launched by the gateway as `trade-sim <key>`.

use anyhow::Context;
use tracing_subscriber::{fmt, EnvFilter};

use trade_gateway::sim::SimWorker;
use trade_gateway::{shutdown, Config};

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,trade_gateway=debug"));
    fmt().with_env_filter(filter).with_target(true).init();

    let key = std::env::args().nth(1).context("usage: trade-sim <session-key>")?;
    let span = tracing::info_span!("trade-sim", key = %key);
    let _entered = span.enter();

    let config = Config::load_default();
    let stop = shutdown::watch()?;
    let mut worker = SimWorker::attach(&key, &config)
        .with_context(|| format!("attaching sim worker for {}", key))?;

    tracing::info!("⏳ Waiting for requests...");
    worker.run(&stop);
    Ok(())
}
