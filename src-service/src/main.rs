//! asrbridge service
//!
//! Starts the configured decoding engines and serves them to clients until a
//! shutdown signal arrives.

use std::path::PathBuf;
use std::process::ExitCode;

use asrbridge_service::{server, ServiceConfig, ServiceContext, WorkerPool};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "asrbridge-service")]
#[command(version)]
#[command(about = "Bridges audio clients to external speech recognition engines", long_about = None)]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// HTTP upload / browser socket port
    #[arg(long)]
    http_port: Option<u16>,

    /// TCP streaming port
    #[arg(long)]
    tcp_port: Option<u16>,

    /// UDP streaming port
    #[arg(long)]
    udp_port: Option<u16>,
}

impl Args {
    fn apply(&self, config: &mut ServiceConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.http_port {
            config.http_port = port;
        }
        if let Some(port) = self.tcp_port {
            config.tcp_port = port;
        }
        if let Some(port) = self.udp_port {
            config.udp_port = port;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging with RUST_LOG env var support
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("asrbridge service starting (pid: {})...", std::process::id());

    let mut config = match ServiceConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    args.apply(&mut config);
    if let Err(e) = config.validate() {
        error!("{}", e);
        return ExitCode::FAILURE;
    }
    if config.batch_engines.is_empty() && config.stream_engine.is_none() {
        warn!("No engines configured; every decode request will be refused");
    }

    let pool = match WorkerPool::start(&config).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to start engines: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let ctx = ServiceContext::new(config, pool.clone(), shutdown.clone());
    let result = server::run(ctx.clone()).await;

    // A listener failure also takes the rest of the service down
    shutdown.cancel();
    ctx.sessions.close_all();
    pool.shutdown().await;

    match result {
        Ok(()) => {
            info!("asrbridge service stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Server error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Cancel `shutdown` on the first termination signal.
async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let streams = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
            signal(SignalKind::hangup()),
        );
        match streams {
            (Ok(mut sigterm), Ok(mut sigint), Ok(mut sighup)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                    _ = sighup.recv() => info!("Received SIGHUP"),
                }
            }
            _ => {
                warn!("Failed to install signal handlers, falling back to Ctrl+C");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Received Ctrl+C");
    }

    info!("Shutdown requested");
    shutdown.cancel();
}
