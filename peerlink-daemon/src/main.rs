// peerlink daemon: LAN discovery, TCP channels, console front-end.

mod config;
mod console;
mod discovery;
mod lan;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use peerlink_core::Session;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("peerlink-daemon {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("unknown argument {other:?}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load(config_path.as_deref())?;
    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(run(cfg));
    // The stdin reader thread never finishes on its own.
    rt.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let transport = Arc::new(lan::LanTransport::new(lan::LanSettings {
        multicast_group: cfg.multicast_group,
        discovery_port: cfg.discovery_port,
        channel_port: cfg.channel_port,
    }));
    let session = Arc::new(
        Session::start(cfg.session, transport, Arc::new(console::ConsoleObserver))
            .await
            .context("starting session")?,
    );
    info!(
        name = %session.identity().name,
        locator = %session.local_endpoint().locator,
        "session running"
    );

    let quit = CancellationToken::new();
    let console = tokio::spawn(console::run(session.clone(), quit.clone()));
    tokio::select! {
        r = shutdown_signal() => r?,
        _ = quit.cancelled() => {}
    }
    quit.cancel();
    session.stop().await;
    let _ = console.await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
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
