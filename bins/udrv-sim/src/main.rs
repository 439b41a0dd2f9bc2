use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use udrv_core::{Engine, EngineConfig, EngineHandle};
use udrv_verbs::sim::SimFabric;

/// UD rendezvous engine over a simulated fabric
#[derive(Parser, Debug)]
#[command(name = "udrv-sim", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dump default configuration and exit
    #[arg(long)]
    dump_default_config: bool,

    /// Stop after this many seconds; 0 runs until interrupted
    #[arg(long, default_value_t = 0)]
    duration_secs: u64,

    #[arg(long, default_value_t = 5)]
    status_interval_secs: u64,
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };
    tokio::select! {
        _ = ctrl_c => { tracing::info!("Received CTRL+C"); }
        _ = sigterm.recv() => { tracing::info!("Received SIGTERM"); }
    }
}

fn log_status(name: &str, handle: &EngineHandle) {
    let snapshot = serde_json::json!({
        "engine": name,
        "status": handle.status(),
        "stats": handle.stats(),
    });
    tracing::info!(status = %snapshot, "engine status");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.dump_default_config {
        print!("{}", EngineConfig::default().to_toml_string()?);
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let _guard = udrv_logging::init_logging(&config.log)?;

    let fabric = SimFabric::new();
    let listener_dev = fabric.add_device("sim0", 1);
    let connector_dev = fabric.add_device("sim1", 2);

    let (listener_engine, listener) = Engine::new(EngineConfig {
        peer_addr: None,
        ..config.clone()
    })?;
    let listener_task = tokio::spawn(listener_engine.run());
    listener.add_device(listener_dev)?;
    let port = listener
        .wait_for(|s| s.awaiting_peer)
        .await?
        .listen_addr
        .map(|addr| addr.port())
        .context("listener reported no address")?;

    let connector_config = EngineConfig {
        peer_addr: Some(Ipv4Addr::LOCALHOST),
        side_channel_port: port,
        ..config
    };
    let (connector_engine, connector) = Engine::new(connector_config)?;
    let connector_task = tokio::spawn(connector_engine.run());
    connector.add_device(connector_dev)?;

    tracing::info!(port, "udrv-sim running");

    let deadline = async {
        if args.duration_secs == 0 {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(Duration::from_secs(args.duration_secs)).await;
    };
    tokio::pin!(deadline);
    let mut status_tick =
        tokio::time::interval(Duration::from_secs(args.status_interval_secs.max(1)));
    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = &mut deadline => {
                tracing::info!(secs = args.duration_secs, "run duration elapsed");
                break;
            }
            _ = status_tick.tick() => {
                log_status("listener", &listener);
                log_status("connector", &connector);
            }
        }
    }

    tracing::info!("udrv-sim shutting down");
    connector.remove_device("sim1")?;
    listener.remove_device("sim0")?;
    connector.shutdown()?;
    listener.shutdown()?;
    connector_task.await?;
    listener_task.await?;
    log_status("listener", &listener);
    log_status("connector", &connector);

    Ok(())
}
