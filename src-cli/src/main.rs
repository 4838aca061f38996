//! asrbridge Command Line Interface
//!
//! Streams WAV files to the decoding service, uploads them for batch
//! decoding, and inspects running sessions.

mod capture;
mod client;
mod http;

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use asrbridge_common::protocol::{
    Framing, HypothesisEvent, DEFAULT_HTTP_PORT, DEFAULT_TCP_PORT, DEFAULT_UDP_PORT,
};
use asrbridge_common::{ServiceStatus, SessionId};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use capture::{WavCapture, FRAME_DURATION};
use client::{ClientError, HypothesisListener, StreamingClient, Transport};
use http::ServiceApi;

#[derive(Parser)]
#[command(name = "asrbridge")]
#[command(version)]
#[command(about = "Speech recognition bridge CLI", long_about = None)]
struct Cli {
    /// Output format
    #[arg(long, default_value = "text")]
    format: OutputFormat,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Increase verbosity
    #[arg(short, long)]
    verbose: bool,

    /// Service host
    #[arg(long, global = true, default_value = "127.0.0.1")]
    host: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum TransportArg {
    Tcp,
    Udp,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a WAV file and print hypotheses as they arrive
    Stream {
        /// 16-bit PCM WAV file
        file: PathBuf,

        /// Transport to stream over
        #[arg(short, long, default_value = "tcp")]
        transport: TransportArg,

        /// Service port (defaults to the transport's standard port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Expect newline-delimited events instead of length-prefixed ones
        #[arg(long)]
        line: bool,

        /// Send frames at recording speed instead of as fast as possible
        #[arg(long)]
        realtime: bool,

        /// How long to wait for late hypotheses after the last frame
        #[arg(long, default_value = "2000")]
        wait_ms: u64,
    },

    /// Upload a WAV file for batch decoding
    Upload {
        file: PathBuf,

        /// HTTP port
        #[arg(short, long, default_value_t = DEFAULT_HTTP_PORT)]
        port: u16,
    },

    /// Show engines and streaming sessions
    Status {
        /// HTTP port
        #[arg(short, long, default_value_t = DEFAULT_HTTP_PORT)]
        port: u16,
    },

    /// Stop a streaming session
    Stop {
        session: SessionId,

        /// HTTP port
        #[arg(short, long, default_value_t = DEFAULT_HTTP_PORT)]
        port: u16,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    match cli.command {
        Commands::Version => {
            println!("asrbridge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }

        Commands::Stream {
            ref file,
            transport,
            port,
            line,
            realtime,
            wait_ms,
        } => {
            let transport = match transport {
                TransportArg::Tcp if line => Transport::Tcp(Framing::Line),
                TransportArg::Tcp => Transport::Tcp(Framing::Length),
                TransportArg::Udp => Transport::Udp,
            };
            let port = port.unwrap_or(match transport {
                Transport::Tcp(_) => DEFAULT_TCP_PORT,
                Transport::Udp => DEFAULT_UDP_PORT,
            });
            let addr = resolve(&cli.host, port)?;
            stream_file(&cli, file, transport, addr, realtime, Duration::from_millis(wait_ms))
                .await
                .map_err(|e| e.to_string())
        }

        Commands::Upload { ref file, port } => {
            let api = ServiceApi::new(&cli.host, port);
            if !cli.quiet {
                eprintln!("Uploading {}...", file.display().to_string().cyan());
            }
            let hypothesis = api.upload(file).await.map_err(|e| e.to_string())?;
            match cli.format {
                OutputFormat::Json => println!("{}", json(&HypothesisEvent::sentence(hypothesis))),
                OutputFormat::Text => println!("{}", hypothesis),
            }
            Ok(())
        }

        Commands::Status { port } => {
            let api = ServiceApi::new(&cli.host, port);
            let status = api.status().await.map_err(|e| e.to_string())?;
            match cli.format {
                OutputFormat::Json => println!("{}", json_pretty(&status)),
                OutputFormat::Text => print_status(&status),
            }
            Ok(())
        }

        Commands::Stop { session, port } => {
            let api = ServiceApi::new(&cli.host, port);
            if api.stop_session(session).await.map_err(|e| e.to_string())? {
                if !cli.quiet {
                    println!("{}", format!("Session {} stopped", session).green());
                }
                Ok(())
            } else {
                Err(format!("No open session {}", session))
            }
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, String> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| format!("Cannot resolve {}:{}: {}", host, port, e))?
        .next()
        .ok_or_else(|| format!("No address for {}:{}", host, port))
}

/// Prints hypotheses to stdout.
struct PrintListener {
    format: OutputFormat,
    quiet: bool,
}

impl HypothesisListener for PrintListener {
    fn on_hypothesis(&self, event: &HypothesisEvent) {
        match self.format {
            OutputFormat::Json => println!("{}", json(event)),
            OutputFormat::Text => println!("{}", event.text()),
        }
    }

    fn on_disconnected(&self, error: Option<&ClientError>) {
        if let Some(e) = error {
            eprintln!("{}: {}", "Connection lost".yellow(), e);
        } else if !self.quiet {
            eprintln!("{}", "Service closed the session".dimmed());
        }
    }
}

async fn stream_file(
    cli: &Cli,
    file: &std::path::Path,
    transport: Transport,
    addr: SocketAddr,
    realtime: bool,
    wait: Duration,
) -> Result<(), ClientError> {
    let capture = WavCapture::open(file)?;
    if !cli.quiet {
        eprintln!(
            "Streaming {} ({} Hz, {} ch, {:.1}s) to {}",
            file.display().to_string().cyan(),
            capture.sample_rate(),
            capture.channels(),
            capture.duration().as_secs_f32(),
            addr
        );
    }

    let mut client = StreamingClient::new(transport);
    client.add_listener(Arc::new(PrintListener {
        format: cli.format,
        quiet: cli.quiet,
    }));
    client.connect(addr).await?;

    let mut pacing = tokio::time::interval(FRAME_DURATION);
    for frame in capture {
        let frame = frame?;
        if realtime {
            pacing.tick().await;
        }
        client.send_frame(&frame).await?;
    }
    client.finish(wait).await
}

fn print_status(status: &ServiceStatus) {
    println!("{}", "Workers".bold());
    if status.workers.is_empty() {
        println!("  none");
    }
    for worker in &status.workers {
        let alive = if worker.alive {
            "alive".green()
        } else {
            "dead".red()
        };
        let binding = match worker.bound_session {
            Some(session) => format!(" session {}", session),
            None => String::new(),
        };
        println!(
            "  #{} {:?} {} pending {}{}{}",
            worker.id,
            worker.mode,
            alive,
            worker.pending,
            binding.cyan(),
            if worker.exclusive { " (exclusive)".dimmed() } else { "".normal() }
        );
    }

    println!("{}", "Sessions".bold());
    if status.sessions.is_empty() {
        println!("  none");
    }
    for session in &status.sessions {
        let worker = session
            .worker
            .map(|w| format!("worker {}", w))
            .unwrap_or_else(|| "unbound".to_string());
        println!(
            "  #{} {} {:?} from {} on {} since {}",
            session.id,
            session.transport,
            session.state,
            session.peer,
            worker,
            session.opened_at.format("%H:%M:%S").to_string().dimmed()
        );
    }
}

fn json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn json_pretty<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}
