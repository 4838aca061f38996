//! Network listeners. All of them share one [`ServiceContext`](crate::state::ServiceContext)
//! and stop when its shutdown token is cancelled.

pub mod http;
pub mod tcp;
pub mod udp;

use std::io;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::error;

use crate::state::SharedContext;

pub use tcp::TcpServer;
pub use udp::UdpServer;

/// Bind every listener, then serve until shutdown.
///
/// Binding happens up front so a taken port fails startup instead of
/// surfacing later from a background task.
pub async fn run(ctx: SharedContext) -> io::Result<()> {
    let config = &ctx.config;
    let http = TcpListener::bind(address(&config.host, config.http_port)?).await?;
    let tcp = TcpServer::bind(ctx.clone(), address(&config.host, config.tcp_port)?).await?;
    let udp = UdpServer::bind(ctx.clone(), address(&config.host, config.udp_port)?).await?;

    let (http, (), ()) = tokio::join!(http::serve(ctx.clone(), http), tcp.serve(), udp.serve());
    if let Err(e) = &http {
        error!("[HttpServer] {}", e);
    }
    http
}

fn address(host: &str, port: u16) -> io::Result<SocketAddr> {
    format!("{}:{}", host, port).parse().map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid listen address {}:{}: {}", host, port, e),
        )
    })
}
