//! Streaming session lifecycle shared by every transport.
//!
//! A transport accepts a client, wraps its two directions as an
//! [`AudioSource`] and a [`HypothesisSink`], and hands them to
//! [`run_session`]. The session binds a stream worker, forwards audio into
//! it, relays every hypothesis back, and releases the worker when it ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use asrbridge_common::protocol::FramingError;
use asrbridge_common::{SessionId, SessionState, SessionStatus, TransportKind, WorkerId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::EngineError;
use crate::pool::{PoolError, StreamBinding, WorkerPool};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("peer closed the connection")]
    TransportClosed,

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inbound audio from a client.
#[async_trait]
pub trait AudioSource: Send {
    /// Next chunk of PCM bytes, or `None` once the client has stopped sending.
    ///
    /// Must be cancel safe: the session polls it alongside engine output.
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, SessionError>;
}

/// Outbound hypotheses to a client.
#[async_trait]
pub trait HypothesisSink: Send {
    async fn send(&mut self, hypothesis: &str) -> Result<(), SessionError>;
}

#[async_trait]
impl AudioSource for mpsc::Receiver<Vec<u8>> {
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        Ok(self.recv().await)
    }
}

struct SessionEntry {
    transport: TransportKind,
    state: SessionState,
    peer: String,
    worker: Option<WorkerId>,
    opened_at: DateTime<Utc>,
    cancel: CancellationToken,
}

/// Every live session, with the token that stops it.
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    root: CancellationToken,
}

impl SessionRegistry {
    /// Sessions opened here are cancelled along with `root`.
    pub fn new(root: CancellationToken) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
            root,
        }
    }

    /// Register a new session in `Connecting` state.
    pub fn open(
        &self,
        transport: TransportKind,
        peer: impl Into<String>,
    ) -> (SessionId, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = self.root.child_token();
        let peer = peer.into();
        info!("[Session {}] Connecting over {} from {}", id, transport, peer);
        self.lock().insert(
            id,
            SessionEntry {
                transport,
                state: SessionState::Connecting,
                peer,
                worker: None,
                opened_at: Utc::now(),
                cancel: cancel.clone(),
            },
        );
        (id, cancel)
    }

    fn set_state(&self, id: SessionId, state: SessionState) {
        if let Some(entry) = self.lock().get_mut(&id) {
            debug!("[Session {}] {:?} -> {:?}", id, entry.state, state);
            entry.state = state;
        }
    }

    fn set_worker(&self, id: SessionId, worker: WorkerId) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.worker = Some(worker);
        }
    }

    fn remove(&self, id: SessionId) {
        self.lock().remove(&id);
    }

    /// Ask a session to stop. Returns false if no such session is open.
    pub fn close(&self, id: SessionId) -> bool {
        match self.lock().get(&id) {
            Some(entry) => {
                info!("[Session {}] Stop requested", id);
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every session.
    pub fn close_all(&self) {
        for entry in self.lock().values() {
            entry.cancel.cancel();
        }
    }

    pub fn state(&self, id: SessionId) -> Option<SessionState> {
        self.lock().get(&id).map(|e| e.state)
    }

    pub fn list(&self) -> Vec<SessionStatus> {
        let mut sessions: Vec<_> = self
            .lock()
            .iter()
            .map(|(id, e)| SessionStatus {
                id: *id,
                transport: e.transport,
                state: e.state,
                peer: e.peer.clone(),
                worker: e.worker,
                opened_at: e.opened_at,
            })
            .collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Per-session tuning taken from the service config.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub subscriber_capacity: usize,
    /// Keep relaying hypotheses this long after the client stops sending
    pub linger: Duration,
}

/// Why the forwarding loop stopped.
#[derive(Debug, PartialEq, Eq)]
enum Ended {
    Cancelled,
    InputFinished,
    EngineClosed,
}

/// Drive one streaming session from accept to close.
///
/// The bound worker is released exactly once on every exit path.
pub async fn run_session<A, H>(
    pool: &WorkerPool,
    registry: &SessionRegistry,
    options: SessionOptions,
    transport: TransportKind,
    peer: String,
    source: A,
    sink: H,
) -> Result<(), SessionError>
where
    A: AudioSource,
    H: HypothesisSink,
{
    let (id, cancel) = registry.open(transport, peer);

    let binding = match pool.bind_streaming_session(id).await {
        Ok(binding) => binding,
        Err(e) => {
            warn!("[Session {}] No stream worker: {}", id, e);
            registry.set_state(id, SessionState::Closed);
            registry.remove(id);
            return Err(e.into());
        }
    };
    registry.set_worker(id, binding.worker_id());
    registry.set_state(id, SessionState::Open);
    info!("[Session {}] Open on worker {}", id, binding.worker_id());

    let result = forward(id, &binding, options, &cancel, source, sink).await;

    registry.set_state(id, SessionState::Closing);
    binding.release().await;
    registry.set_state(id, SessionState::Closed);
    registry.remove(id);

    match &result {
        Ok(ended) => info!("[Session {}] Closed ({:?})", id, ended),
        Err(SessionError::TransportClosed) => info!("[Session {}] Closed by peer", id),
        Err(e) => warn!("[Session {}] Closed on error: {}", id, e),
    }
    result.map(|_| ())
}

async fn forward<A, H>(
    id: SessionId,
    binding: &StreamBinding,
    options: SessionOptions,
    cancel: &CancellationToken,
    mut source: A,
    mut sink: H,
) -> Result<Ended, SessionError>
where
    A: AudioSource,
    H: HypothesisSink,
{
    let engine = binding.engine();
    let mut subscription = engine.subscribe(options.subscriber_capacity);
    let linger = tokio::time::sleep(Duration::MAX);
    tokio::pin!(linger);
    let mut receiving = true;

    let result = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break Ok(Ended::Cancelled),

            hypothesis = subscription.receiver.recv() => match hypothesis {
                Some(text) => {
                    // A stalled client must not outlive a stop request
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break Ok(Ended::Cancelled),
                        sent = sink.send(&text) => if let Err(e) = sent {
                            break Err(e);
                        },
                    }
                }
                None => break Ok(Ended::EngineClosed),
            },

            frame = source.next_frame(), if receiving => match frame {
                Ok(Some(bytes)) => {
                    // Nor an engine that stopped reading its input
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break Ok(Ended::Cancelled),
                        written = engine.decode_stream(&bytes) => if let Err(e) = written {
                            break Err(e.into());
                        },
                    }
                }
                Ok(None) => {
                    debug!("[Session {}] Input finished, lingering {:?}", id, options.linger);
                    receiving = false;
                    linger.as_mut().reset(tokio::time::Instant::now() + options.linger);
                }
                Err(e) => break Err(e),
            },

            _ = &mut linger, if !receiving => break Ok(Ended::InputFinished),
        }
    };

    engine.unsubscribe(subscription.id);
    result
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{CommandSpec, EngineConfig};
    use crate::engine::EngineAdapter;
    use asrbridge_common::EngineMode;
    use std::sync::Arc;

    /// Collects hypotheses into a shared list.
    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl HypothesisSink for Collect {
        async fn send(&mut self, hypothesis: &str) -> Result<(), SessionError> {
            self.0.lock().unwrap().push(hypothesis.to_string());
            Ok(())
        }
    }

    fn stream_pool() -> WorkerPool {
        // One hypothesis per input line
        let script = r#"n=0; while read -r chunk; do n=$((n+1)); echo "$n got $chunk"; done"#;
        let config = EngineConfig::single(CommandSpec::new("/bin/sh", &["-c", script]));
        WorkerPool::new(Some(config), true, Duration::from_secs(5))
    }

    fn options() -> SessionOptions {
        SessionOptions {
            subscriber_capacity: 16,
            linger: Duration::from_millis(300),
        }
    }

    #[tokio::test]
    async fn hypotheses_flow_back_and_worker_is_released() {
        let pool = stream_pool();
        let registry = SessionRegistry::new(CancellationToken::new());
        let (tx, rx) = mpsc::channel(8);
        let sink = Collect::default();

        tx.send(b"alpha\n".to_vec()).await.unwrap();
        tx.send(b"beta\n".to_vec()).await.unwrap();
        drop(tx);

        run_session(
            &pool,
            &registry,
            options(),
            TransportKind::Udp,
            "127.0.0.1:9".into(),
            rx,
            sink.clone(),
        )
        .await
        .unwrap();

        let got = sink.0.lock().unwrap().clone();
        assert_eq!(got, vec!["got alpha".to_string(), "got beta".to_string()]);
        assert!(registry.is_empty());
        // Exclusive worker was terminated and removed
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn close_stops_a_running_session() {
        let pool = stream_pool();
        let registry = Arc::new(SessionRegistry::new(CancellationToken::new()));
        let (tx, rx) = mpsc::channel::<Vec<u8>>(8);

        let task = {
            let pool = pool.clone();
            let registry = registry.clone();
            tokio::spawn(async move {
                run_session(
                    &pool,
                    &registry,
                    options(),
                    TransportKind::Tcp,
                    "peer".into(),
                    rx,
                    Collect::default(),
                )
                .await
            })
        };

        let id = loop {
            if let Some(s) = registry.list().first() {
                if s.state == SessionState::Open {
                    break s.id;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert!(registry.list()[0].worker.is_some());
        assert!(registry.close(id));

        task.await.unwrap().unwrap();
        assert!(!registry.close(id));
        assert!(pool.is_empty());
        drop(tx);
    }

    #[tokio::test]
    async fn close_during_a_stalled_frame_write_releases_the_worker() {
        // Never reads stdin, so the first large frame blocks in the pipe
        let config = EngineConfig::single(CommandSpec::new("/bin/sh", &["-c", "exec sleep 30"]));
        let engine = EngineAdapter::spawn("deaf", EngineMode::Stream, config, Duration::from_secs(5))
            .await
            .unwrap();
        let pool = WorkerPool::new(None, false, Duration::from_secs(5));
        pool.register_worker(engine.clone());
        let registry = Arc::new(SessionRegistry::new(CancellationToken::new()));
        let (tx, rx) = mpsc::channel::<Vec<u8>>(8);
        tx.send(vec![0u8; 1 << 20]).await.unwrap();

        let task = {
            let pool = pool.clone();
            let registry = registry.clone();
            tokio::spawn(async move {
                run_session(
                    &pool,
                    &registry,
                    options(),
                    TransportKind::Tcp,
                    "peer".into(),
                    rx,
                    Collect::default(),
                )
                .await
            })
        };

        let id = loop {
            if let Some(s) = registry.list().first() {
                if s.state == SessionState::Open {
                    break s.id;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        // Let the forward loop get stuck inside the write
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!task.is_finished());
        assert!(registry.close(id));

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("session ignored close while writing")
            .unwrap()
            .unwrap();
        assert!(registry.is_empty());
        // Half-written input retires the pooled engine instead of returning it
        assert!(pool.is_empty());
        assert!(!engine.is_alive());
        drop(tx);
    }

    #[tokio::test]
    async fn root_cancellation_reaches_sessions() {
        let root = CancellationToken::new();
        let registry = SessionRegistry::new(root.clone());
        let (_, token) = registry.open(TransportKind::WebSocket, "peer");
        root.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn no_stream_engine_means_no_session() {
        let pool = WorkerPool::new(None, false, Duration::from_secs(1));
        let registry = SessionRegistry::new(CancellationToken::new());
        let (_tx, rx) = mpsc::channel(1);
        let result = run_session(
            &pool,
            &registry,
            options(),
            TransportKind::Tcp,
            "peer".into(),
            rx,
            Collect::default(),
        )
        .await;
        assert!(matches!(result, Err(SessionError::Pool(PoolError::NoWorkerAvailable(_)))));
        assert!(registry.is_empty());
    }
}
