use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use trade_gateway::gateway::{Gateway, GatewayEvent, WsServer};
use trade_gateway::{shutdown, Config};

fn main() -> anyhow::Result<()> {
    // 1. Logger
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,trade_gateway=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    tracing::info!("🦀 Trade Gateway starting...");

    // 2. Config
    let config = Config::load_default();
    tracing::info!(
        "📋 {} broker(s): {}",
        config.brokers.len(),
        config.broker_names().join(", ")
    );

    // 3. Control plane on its own thread
    let (events_tx, events_rx) = flume::unbounded::<GatewayEvent>();
    let gateway = Gateway::new(config.clone(), events_tx.clone());
    let control = std::thread::Builder::new()
        .name("control-plane".to_string())
        .spawn(move || gateway.run(events_rx))?;

    // 4. Network front end until a signal arrives
    let runtime = tokio::runtime::Runtime::new()?;
    let server = Arc::new(WsServer::new(&config.server, events_tx.clone()));
    let served = runtime.block_on(async {
        tokio::select! {
            res = server.run() => res,
            _ = shutdown::signal() => {
                tracing::info!("🛑 Shutting down...");
                Ok(())
            }
        }
    });

    // 5. Stop every session before exit
    if events_tx.send(GatewayEvent::Shutdown).is_err() {
        tracing::warn!("control plane already gone");
    }
    if control.join().is_err() {
        tracing::error!("control plane panicked");
    }
    runtime.shutdown_timeout(std::time::Duration::from_secs(1));
    served?;

    tracing::info!("✅ Trade Gateway stopped");
    Ok(())
}
