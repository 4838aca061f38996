//! Persistent-stream listener: raw PCM in, framed `{"sentence"}` events out.

use std::io;
use std::net::SocketAddr;

use asrbridge_common::protocol::{Framing, FramingError, HypothesisEvent};
use asrbridge_common::TransportKind;
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::session::{run_session, AudioSource, HypothesisSink, SessionError};
use crate::state::SharedContext;

pub struct TcpServer {
    listener: TcpListener,
    ctx: SharedContext,
}

impl TcpServer {
    pub async fn bind(ctx: SharedContext, addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("[TcpServer] Listening on {}", listener.local_addr()?);
        Ok(Self { listener, ctx })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients until shutdown. Each client runs as its own session task.
    pub async fn serve(self) {
        let shutdown = self.ctx.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_client(self.ctx.clone(), stream, peer));
                    }
                    Err(e) => error!("[TcpServer] Accept failed: {}", e),
                },
            }
        }
        info!("[TcpServer] Stopped");
    }
}

async fn handle_client(ctx: SharedContext, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("[TcpServer] Could not disable Nagle for {}: {}", peer, e);
    }
    let (reader, writer) = stream.into_split();
    let source = TcpAudio {
        reader,
        buf: vec![0u8; ctx.config.read_chunk_size],
    };
    let sink = TcpEvents {
        writer,
        framing: ctx.config.tcp_framing,
    };

    // Session errors are logged where the session ends
    let _ = run_session(
        &ctx.pool,
        &ctx.sessions,
        ctx.session_options(),
        TransportKind::Tcp,
        peer.to_string(),
        source,
        sink,
    )
    .await;
}

struct TcpAudio {
    reader: OwnedReadHalf,
    buf: Vec<u8>,
}

#[async_trait]
impl AudioSource for TcpAudio {
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        match self.reader.read(&mut self.buf).await {
            Ok(0) => Ok(None),
            Ok(n) => Ok(Some(self.buf[..n].to_vec())),
            Err(e) => Err(transport_error(e)),
        }
    }
}

struct TcpEvents {
    writer: OwnedWriteHalf,
    framing: Framing,
}

#[async_trait]
impl HypothesisSink for TcpEvents {
    async fn send(&mut self, hypothesis: &str) -> Result<(), SessionError> {
        let event = HypothesisEvent::sentence(hypothesis);
        match self.framing.write(&mut self.writer, &event).await {
            Ok(()) => Ok(()),
            Err(FramingError::Io(e)) => Err(transport_error(e)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Peer hang-ups are an ordinary way for a session to end.
pub(crate) fn transport_error(e: io::Error) -> SessionError {
    match e.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof => SessionError::TransportClosed,
        _ => SessionError::Io(e),
    }
}
