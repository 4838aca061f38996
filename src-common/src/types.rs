//! Shared types for asrbridge audio transport and decoding status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a streaming decoding session.
pub type SessionId = u64;

/// Identifier of a worker (engine process) within the pool.
pub type WorkerId = usize;

/// Status flags reported by a capture source alongside a frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameStatus {
    /// Samples were dropped by the capture source before this frame
    pub input_overflow: bool,
    /// The source ran out of data while filling this frame (zero padded)
    pub input_underflow: bool,
    /// This is the last frame the source will produce
    pub end_of_stream: bool,
}

/// A chunk of captured audio.
///
/// `pcm` holds interleaved 16-bit little-endian samples, which is what the
/// streaming engines read from stdin.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pcm: Vec<u8>,
    sample_count: usize,
    captured_at: DateTime<Utc>,
    status: FrameStatus,
}

impl AudioFrame {
    /// Create a frame from raw PCM bytes.
    pub fn new(pcm: Vec<u8>, sample_count: usize, status: FrameStatus) -> Self {
        Self {
            pcm,
            sample_count,
            captured_at: Utc::now(),
            status,
        }
    }

    /// Create a frame from i16 samples, encoding them little-endian.
    pub fn from_samples(samples: &[i16], status: FrameStatus) -> Self {
        let pcm = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self::new(pcm, samples.len(), status)
    }

    /// Override the capture timestamp (used when replaying recorded audio).
    pub fn with_timestamp(mut self, captured_at: DateTime<Utc>) -> Self {
        self.captured_at = captured_at;
        self
    }

    pub fn pcm(&self) -> &[u8] {
        &self.pcm
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn status(&self) -> FrameStatus {
        self.status
    }

    pub fn is_empty(&self) -> bool {
        self.pcm.is_empty()
    }
}

/// Transport a streaming session arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Persistent TCP connection
    Tcp,
    /// UDP datagram association keyed by peer address
    Udp,
    /// Browser WebSocket
    WebSocket,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Udp => "udp",
            TransportKind::WebSocket => "websocket",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a streaming session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Which kind of work a worker's engine was started for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    /// Tagged request/response decoding of whole files
    Batch,
    /// Continuous raw-frame decoding
    Stream,
}

/// Snapshot of a worker for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub mode: EngineMode,
    /// Whether the engine process is still running
    pub alive: bool,
    /// Batch requests written but not yet answered
    pub pending: usize,
    /// Session currently bound to this worker (stream mode only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bound_session: Option<SessionId>,
    /// Whether the worker was spawned for a single session
    pub exclusive: bool,
}

/// Snapshot of a streaming session for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub id: SessionId,
    pub transport: TransportKind,
    pub state: SessionState,
    /// Remote peer address
    pub peer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerId>,
    pub opened_at: DateTime<Utc>,
}

/// Overall service status returned by the status endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub workers: Vec<WorkerStatus>,
    pub sessions: Vec<SessionStatus>,
}
