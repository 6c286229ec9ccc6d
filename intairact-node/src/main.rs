// IntAirAct node daemon: serves a `ping` action and logs devices as they come and go.

use anyhow::Context;
use intairact_node::{config, IntAirAct};
use serde_json::json;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("intairact {}", VERSION);
            return Ok(());
        }
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = config::load();
    let engine = IntAirAct::new(cfg).context("creating engine")?;

    let name = engine.own_id().clone();
    engine.add_action("ping", move |action| {
        tracing::info!(action = action.name(), "ping received");
        Ok(Some(json!(format!("pong from {name}"))))
    });
    engine.add_handler_for_device_found(|device, own| {
        if !own {
            tracing::info!(device = %device.id(), addr = %device.addr(), "peer joined");
        }
    });
    engine.add_handler_for_device_lost(|device| {
        tracing::info!(device = %device.id(), "peer left");
    });

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let port = engine.start().context("starting engine")?;
        tracing::info!(port, device = %engine.own_id(), "ready");
        shutdown_signal().await?;
        engine.stop();
        Ok::<(), anyhow::Error>(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
