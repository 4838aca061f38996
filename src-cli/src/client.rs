//! Streaming client: sends captured audio to the service and hands every
//! hypothesis it sends back to the registered listeners.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use asrbridge_common::protocol::{
    decode_header, decode_payload, Framing, FramingError, HypothesisEvent,
};
use asrbridge_common::AudioFrame;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Largest datagram the service sends.
const MAX_DATAGRAM: usize = 65_536;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,

    #[error("connection closed by the service")]
    TransportClosed,

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("service answered {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("failed to read audio: {0}")]
    Audio(#[from] hound::Error),
}

/// Receives hypotheses as they arrive.
pub trait HypothesisListener: Send + Sync {
    fn on_hypothesis(&self, event: &HypothesisEvent);

    /// The service closed the connection, cleanly (`None`) or not.
    fn on_disconnected(&self, _error: Option<&ClientError>) {}
}

type Listeners = Arc<Mutex<Vec<Arc<dyn HypothesisListener>>>>;

/// Which service listener to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp(Framing),
    Udp,
}

enum Writer {
    Tcp(OwnedWriteHalf),
    Udp(Arc<UdpSocket>),
}

struct Connection {
    writer: Writer,
    reader: JoinHandle<()>,
}

pub struct StreamingClient {
    transport: Transport,
    listeners: Listeners,
    connection: Option<Connection>,
}

impl StreamingClient {
    /// Create a new client (not connected).
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            listeners: Arc::new(Mutex::new(Vec::new())),
            connection: None,
        }
    }

    /// Register a listener. Listeners are called in registration order.
    pub fn add_listener(&self, listener: Arc<dyn HypothesisListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Connect to the service and start receiving hypotheses.
    pub async fn connect(&mut self, addr: SocketAddr) -> Result<(), ClientError> {
        self.disconnect().await;
        let connection = match self.transport {
            Transport::Tcp(framing) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                let reader = tokio::spawn(read_stream(reader, framing, self.listeners.clone()));
                Connection {
                    writer: Writer::Tcp(writer),
                    reader,
                }
            }
            Transport::Udp => {
                let local: SocketAddr = if addr.is_ipv4() {
                    ([0, 0, 0, 0], 0).into()
                } else {
                    (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
                };
                let socket = Arc::new(UdpSocket::bind(local).await?);
                socket.connect(addr).await?;
                let reader = tokio::spawn(read_datagrams(socket.clone(), self.listeners.clone()));
                Connection {
                    writer: Writer::Udp(socket),
                    reader,
                }
            }
        };
        debug!("Connected to {} over {:?}", addr, self.transport);
        self.connection = Some(connection);
        Ok(())
    }

    /// Send one frame of audio.
    pub async fn send_frame(&mut self, frame: &AudioFrame) -> Result<(), ClientError> {
        let connection = self.connection.as_mut().ok_or(ClientError::NotConnected)?;
        if frame.is_empty() {
            return Ok(());
        }
        match &mut connection.writer {
            Writer::Tcp(writer) => writer.write_all(frame.pcm()).await.map_err(closed_or_io),
            Writer::Udp(socket) => {
                socket.send(frame.pcm()).await.map_err(closed_or_io)?;
                Ok(())
            }
        }
    }

    /// Stop sending and wait up to `wait` for the remaining hypotheses.
    ///
    /// Over TCP this returns as soon as the service closes the connection.
    /// Datagrams have no close, so UDP always waits the full duration.
    pub async fn finish(&mut self, wait: Duration) -> Result<(), ClientError> {
        let mut connection = self.connection.take().ok_or(ClientError::NotConnected)?;
        if let Writer::Tcp(writer) = &mut connection.writer {
            writer.shutdown().await.map_err(closed_or_io)?;
        }
        if tokio::time::timeout(wait, &mut connection.reader).await.is_err() {
            connection.reader.abort();
        }
        Ok(())
    }

    /// Drop the connection immediately.
    pub async fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.reader.abort();
            // Join so no listener runs after this returns
            let _ = connection.reader.await;
            debug!("Disconnected");
        }
    }
}

fn closed_or_io(e: std::io::Error) -> ClientError {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted => ClientError::TransportClosed,
        _ => ClientError::Io(e),
    }
}

fn dispatch(listeners: &Listeners, event: &HypothesisEvent) {
    let listeners = listeners.lock().unwrap_or_else(|e| e.into_inner()).clone();
    for listener in listeners {
        listener.on_hypothesis(event);
    }
}

fn disconnected(listeners: &Listeners, error: Option<&ClientError>) {
    let listeners = listeners.lock().unwrap_or_else(|e| e.into_inner()).clone();
    for listener in listeners {
        listener.on_disconnected(error);
    }
}

async fn read_stream(reader: OwnedReadHalf, framing: Framing, listeners: Listeners) {
    let mut reader = BufReader::new(reader);
    loop {
        match framing.read::<_, HypothesisEvent>(&mut reader).await {
            Ok(Some(event)) => dispatch(&listeners, &event),
            Ok(None) => {
                disconnected(&listeners, None);
                break;
            }
            Err(e) => {
                // No partial-message recovery: a bad frame ends the stream
                let error = match e {
                    FramingError::Io(io) => closed_or_io(io),
                    other => ClientError::Framing(other),
                };
                warn!("Hypothesis stream failed: {}", error);
                disconnected(&listeners, Some(&error));
                break;
            }
        }
    }
}

/// Events arrive as a header datagram followed by a payload datagram.
async fn read_datagrams(socket: Arc<UdpSocket>, listeners: Listeners) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut expected: Option<usize> = None;
    loop {
        let n = match socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                let error = ClientError::TransportClosed;
                disconnected(&listeners, Some(&error));
                break;
            }
            Err(e) => {
                let error = ClientError::Io(e);
                disconnected(&listeners, Some(&error));
                break;
            }
        };
        let datagram = &buf[..n];

        // Unlike a byte stream, a bad datagram cannot desynchronise the ones
        // after it: each header/payload pair stands alone and loss is already
        // expected, so a malformed pair is dropped rather than ending the session.
        match expected.take() {
            Some(len) if len == n => match decode_payload::<HypothesisEvent>(datagram) {
                Ok(event) => dispatch(&listeners, &event),
                Err(e) => warn!("Dropping malformed event: {}", e),
            },
            // Loss is silent on datagrams; resynchronise on the next header
            _ if n == 2 => match decode_header(datagram) {
                Ok(len) => expected = Some(len),
                Err(e) => warn!("Dropping malformed header: {}", e),
            },
            _ => warn!("Dropping unexpected {} byte datagram", n),
        }
    }
}
