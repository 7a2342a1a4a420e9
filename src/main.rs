//! Hermes camera relay: MJPEG stream and still capture over HTTP

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hermes::capture::{self, CaptureGate, CaptureWorker};
use hermes::server::{self, AppState};
use hermes::{Config, Relay, Resolution, Verifier};

#[derive(Debug, Parser)]
#[command(version, about = "MJPEG streaming and still capture over HTTP")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// V4L2 device, e.g. /dev/video0 (test pattern when omitted)
    #[arg(short, long)]
    device: Option<String>,

    /// Stream resolution as WIDTHxHEIGHT
    #[arg(short, long)]
    resolution: Option<Resolution>,

    /// Frame rate, clamped to 1..=60
    #[arg(long)]
    fps: Option<u32>,

    #[arg(short, long)]
    port: Option<u16>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(device) = self.device {
            config.capture.device = Some(device);
        }
        if let Some(resolution) = self.resolution {
            config.capture.resolution = resolution;
        }
        if let Some(fps) = self.fps {
            config.capture.fps = fps;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hermes=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Hermes launching...");

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref()).wrap_err("loading configuration")?;
    args.apply(&mut config);

    let verifier = Verifier::from_env();
    let relay = Relay::new();

    let (gate, stills) = CaptureGate::new(
        config.capture.mode,
        relay.clone(),
        config.capture.still_timeout(),
    );
    info!(mode = ?gate.mode(), "Still capture gate ready");
    let source = capture::open_source(&config.capture).wrap_err("opening capture source")?;
    let worker = CaptureWorker::spawn(source, relay.clone(), stills)
        .wrap_err("starting capture worker")?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let state = AppState::new(
        relay,
        gate,
        verifier,
        config.stream.wait_timeout(),
        stop_rx,
    );

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .wrap_err("invalid bind address")?;
    let listener = TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;

    server::serve(listener, state, async move {
        shutdown_signal().await;
        info!("Shutdown requested");
        let _ = stop_tx.send(true);
    })
    .await
    .wrap_err("HTTP server error")?;

    tokio::task::spawn_blocking(move || worker.stop())
        .await
        .wrap_err("joining capture worker")?;

    info!("Hermes shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Ctrl-C handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
