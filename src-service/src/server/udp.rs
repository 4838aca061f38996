//! Datagram listener.
//!
//! Every datagram is a chunk of raw PCM. Sessions are keyed by the sender's
//! address and end after a period with no audio. Hypotheses go back to the
//! sender as `{"backoff", "phrase"}` events, header and payload in two
//! datagrams.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use asrbridge_common::protocol::{encode_datagrams, HypothesisEvent};
use asrbridge_common::TransportKind;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::tcp::transport_error;
use crate::session::{run_session, AudioSource, HypothesisSink, SessionError};
use crate::state::SharedContext;

/// Datagrams buffered per peer before new ones are dropped.
const PEER_QUEUE_DEPTH: usize = 256;

/// Largest datagram accepted.
const MAX_DATAGRAM: usize = 65_536;

type Peers = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>>;

pub struct UdpServer {
    socket: Arc<UdpSocket>,
    ctx: SharedContext,
    peers: Peers,
}

impl UdpServer {
    pub async fn bind(ctx: SharedContext, addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("[UdpServer] Listening on {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
            ctx,
            peers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive datagrams until shutdown, routing each to its peer's session.
    pub async fn serve(self) {
        let shutdown = self.ctx.shutdown.clone();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((0, _)) => {}
                    Ok((n, peer)) => self.route(peer, buf[..n].to_vec()),
                    // ICMP port unreachable from a departed peer surfaces here
                    Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                        debug!("[UdpServer] {}", e);
                    }
                    Err(e) => error!("[UdpServer] Receive failed: {}", e),
                },
            }
        }
        info!("[UdpServer] Stopped");
    }

    fn route(&self, peer: SocketAddr, datagram: Vec<u8>) {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        let datagram = match peers.get(&peer) {
            Some(tx) => match tx.try_send(datagram) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    warn!("[UdpServer] Session for {} is behind, dropping audio", peer);
                    return;
                }
                // Session ended between datagrams; start a new one
                Err(TrySendError::Closed(datagram)) => datagram,
            },
            None => datagram,
        };

        let (tx, rx) = mpsc::channel(PEER_QUEUE_DEPTH);
        // Fresh channel with room to spare
        let _ = tx.try_send(datagram);
        peers.insert(peer, tx.clone());
        drop(peers);

        let ctx = self.ctx.clone();
        let socket = self.socket.clone();
        let registry = self.peers.clone();
        tokio::spawn(async move {
            let source = UdpAudio::new(rx, ctx.config.udp_idle_timeout());
            let sink = UdpEvents { socket, peer };
            let _ = run_session(
                &ctx.pool,
                &ctx.sessions,
                ctx.session_options(),
                TransportKind::Udp,
                peer.to_string(),
                source,
                sink,
            )
            .await;

            let mut peers = registry.lock().unwrap_or_else(|e| e.into_inner());
            if peers.get(&peer).is_some_and(|current| current.same_channel(&tx)) {
                peers.remove(&peer);
            }
        });
    }
}

/// Inbound datagrams for one peer; finishes once the peer goes quiet.
struct UdpAudio {
    receiver: mpsc::Receiver<Vec<u8>>,
    idle_timeout: Duration,
    deadline: Instant,
}

impl UdpAudio {
    fn new(receiver: mpsc::Receiver<Vec<u8>>, idle_timeout: Duration) -> Self {
        Self {
            receiver,
            idle_timeout,
            deadline: Instant::now() + idle_timeout,
        }
    }
}

#[async_trait]
impl AudioSource for UdpAudio {
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        match tokio::time::timeout_at(self.deadline, self.receiver.recv()).await {
            Ok(Some(datagram)) => {
                self.deadline = Instant::now() + self.idle_timeout;
                Ok(Some(datagram))
            }
            Ok(None) => Ok(None),
            Err(_) => {
                debug!("[UdpServer] No audio for {:?}, ending session", self.idle_timeout);
                self.receiver.close();
                Ok(None)
            }
        }
    }
}

struct UdpEvents {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

#[async_trait]
impl HypothesisSink for UdpEvents {
    async fn send(&mut self, hypothesis: &str) -> Result<(), SessionError> {
        let event = HypothesisEvent::phrase(0, hypothesis);
        let (header, payload) = encode_datagrams(&event)?;
        self.socket
            .send_to(&header, self.peer)
            .await
            .map_err(transport_error)?;
        self.socket
            .send_to(&payload, self.peer)
            .await
            .map_err(transport_error)?;
        Ok(())
    }
}
