//! Worker pool: the set of running engines and the choice of one per unit of
//! work.
//!
//! Batch requests go to the live batch worker with the fewest pending
//! requests. Streaming sessions get a stream worker of their own for their
//! whole lifetime, either borrowed from the pool or spawned just for them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use asrbridge_common::{EngineMode, SessionId, WorkerId, WorkerStatus};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{EngineConfig, ServiceConfig};
use crate::engine::{DecodingRequest, EngineAdapter, EngineError};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no live {0:?} worker available")]
    NoWorkerAvailable(EngineMode),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// One engine plus the bookkeeping the pool selects on.
pub struct Worker {
    id: WorkerId,
    engine: Arc<EngineAdapter>,
    /// Batch requests in flight, or 1 while a stream session is bound
    pending: AtomicUsize,
    session: Mutex<Option<SessionId>>,
    /// Spawned for a single session and terminated when it ends
    exclusive: bool,
}

impl Worker {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn engine(&self) -> &Arc<EngineAdapter> {
        &self.engine
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        self.engine.is_alive()
    }

    fn bound_session(&self) -> Option<SessionId> {
        *self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_session(&self, session: Option<SessionId>) {
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = session;
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus {
            id: self.id,
            mode: self.engine.mode(),
            alive: self.is_alive(),
            pending: self.pending(),
            bound_session: self.bound_session(),
            exclusive: self.exclusive,
        }
    }
}

/// Claim on a batch worker. The pending count drops when the lease does.
pub struct BatchLease {
    worker: Arc<Worker>,
}

impl BatchLease {
    pub fn worker_id(&self) -> WorkerId {
        self.worker.id
    }

    pub async fn decode(&self, request: &DecodingRequest) -> Result<String, EngineError> {
        self.worker.engine.decode_batch(request).await
    }
}

impl Drop for BatchLease {
    fn drop(&mut self) {
        self.worker.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

struct PoolInner {
    workers: Mutex<Vec<Arc<Worker>>>,
    next_id: AtomicUsize,
    /// Template for per-session engines when no pooled one is free
    stream_engine: Option<EngineConfig>,
    spawn_on_demand: bool,
    batch_timeout: Duration,
}

impl PoolInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Worker>>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, id: WorkerId) {
        self.lock().retain(|w| w.id != id);
    }
}

/// A streaming session's exclusive hold on one worker.
///
/// Give it back with [`release`](Self::release). Dropping an unreleased
/// binding releases it too, so a session that dies early never strands its
/// worker.
pub struct StreamBinding {
    session: SessionId,
    worker: Arc<Worker>,
    pool: Arc<PoolInner>,
    released: bool,
}

impl StreamBinding {
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker.id
    }

    pub fn engine(&self) -> &Arc<EngineAdapter> {
        &self.worker.engine
    }

    pub fn is_exclusive(&self) -> bool {
        self.worker.exclusive
    }

    /// Return a pooled worker, or terminate a session-exclusive one.
    ///
    /// A returned engine keeps whatever decoder state the session left
    /// behind, so the next session on it may see the tail of an unfinished
    /// utterance. Set `stream_pool_size` to 0 for a fresh engine per session.
    /// A pooled engine that died or had its input cut mid-frame is retired
    /// instead of returned.
    pub async fn release(mut self) {
        self.released = true;
        if self.unbind() {
            self.worker.engine.terminate().await;
        }
    }

    /// Detach the worker from the session. True when its engine must stop.
    fn unbind(&self) -> bool {
        let worker = &self.worker;
        if worker.exclusive {
            self.pool.remove(worker.id);
            info!(
                "[Pool] Session {} finished with exclusive worker {}",
                self.session, worker.id
            );
            true
        } else if !worker.is_alive() {
            self.pool.remove(worker.id);
            warn!(
                "[Pool] Worker {} retired after session {}: engine unusable",
                worker.id, self.session
            );
            true
        } else {
            // Under the pool lock so a concurrent bind sees a consistent state
            let _workers = self.pool.lock();
            worker.set_session(None);
            worker.pending.store(0, Ordering::SeqCst);
            info!(
                "[Pool] Worker {} returned by session {}",
                worker.id, self.session
            );
            false
        }
    }
}

impl Drop for StreamBinding {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!("[Pool] Session {} dropped its binding without release", self.session);
        if self.unbind() {
            let engine = self.worker.engine.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { engine.terminate().await });
            }
        }
    }
}

/// Cheap to clone; clones share the same workers.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Empty pool. `stream_engine` is used to spawn per-session workers when
    /// `spawn_on_demand` is set.
    pub fn new(
        stream_engine: Option<EngineConfig>,
        spawn_on_demand: bool,
        batch_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                workers: Mutex::new(Vec::new()),
                next_id: AtomicUsize::new(0),
                stream_engine,
                spawn_on_demand,
                batch_timeout,
            }),
        }
    }

    /// Spawn every engine the configuration asks for at startup.
    pub async fn start(config: &ServiceConfig) -> Result<Self, PoolError> {
        let pool = Self::new(
            config.stream_engine.clone(),
            config.stream_pool_size == 0,
            config.batch_timeout(),
        );

        for engine in &config.batch_engines {
            pool.spawn_worker(EngineMode::Batch, engine.clone()).await?;
        }
        if let Some(engine) = &config.stream_engine {
            for _ in 0..config.stream_pool_size {
                pool.spawn_worker(EngineMode::Stream, engine.clone()).await?;
            }
        }

        info!(
            "[Pool] Started {} batch and {} stream worker(s)",
            config.batch_engines.len(),
            config.stream_pool_size
        );
        Ok(pool)
    }

    async fn spawn_worker(
        &self,
        mode: EngineMode,
        config: EngineConfig,
    ) -> Result<WorkerId, PoolError> {
        let label = format!("Engine {}", self.inner.next_id.load(Ordering::SeqCst));
        let engine = EngineAdapter::spawn(label, mode, config, self.inner.batch_timeout).await?;
        Ok(self.register_worker(engine))
    }

    /// Add a running engine. Its pending count starts at zero.
    pub fn register_worker(&self, engine: Arc<EngineAdapter>) -> WorkerId {
        self.insert(engine, None)
    }

    fn insert(&self, engine: Arc<EngineAdapter>, session: Option<SessionId>) -> WorkerId {
        let mut workers = self.inner.lock();
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let exclusive = session.is_some();
        info!(
            "[Pool] Registered {:?} worker {} ({})",
            engine.mode(),
            id,
            engine.name()
        );
        workers.push(Arc::new(Worker {
            id,
            engine,
            pending: AtomicUsize::new(usize::from(exclusive)),
            session: Mutex::new(session),
            exclusive,
        }));
        id
    }

    /// Pick the least-loaded live batch worker and count the request against it.
    pub fn lease_batch(&self) -> Result<BatchLease, PoolError> {
        let workers = self.inner.lock();
        let worker = least_loaded(&workers, |w| w.engine.mode() == EngineMode::Batch)
            .ok_or(PoolError::NoWorkerAvailable(EngineMode::Batch))?;
        worker.pending.fetch_add(1, Ordering::SeqCst);
        Ok(BatchLease {
            worker: worker.clone(),
        })
    }

    /// Decode one request on the least-loaded batch worker.
    pub async fn dispatch_batch(&self, request: &DecodingRequest) -> Result<String, PoolError> {
        let lease = self.lease_batch()?;
        let result = lease.decode(request).await;
        if let Err(e) = &result {
            warn!(
                "[Pool] Worker {} failed request '{}': {}",
                lease.worker_id(),
                request.tag,
                e
            );
        }
        result.map_err(PoolError::from)
    }

    /// Give `session` a stream worker of its own until the binding is released.
    pub async fn bind_streaming_session(
        &self,
        session: SessionId,
    ) -> Result<StreamBinding, PoolError> {
        let pooled = {
            let workers = self.inner.lock();
            least_loaded(&workers, |w| {
                w.engine.mode() == EngineMode::Stream && !w.exclusive && w.bound_session().is_none()
            })
            .map(|worker| {
                worker.set_session(Some(session));
                worker.pending.store(1, Ordering::SeqCst);
                worker.clone()
            })
        };

        let worker = match pooled {
            Some(worker) => worker,
            None => self.spawn_exclusive(session).await?,
        };
        info!(
            "[Pool] Session {} bound to worker {}{}",
            session,
            worker.id,
            if worker.exclusive { " (exclusive)" } else { "" }
        );
        Ok(StreamBinding {
            session,
            worker,
            pool: self.inner.clone(),
            released: false,
        })
    }

    async fn spawn_exclusive(&self, session: SessionId) -> Result<Arc<Worker>, PoolError> {
        let config = match (&self.inner.stream_engine, self.inner.spawn_on_demand) {
            (Some(config), true) => config.clone(),
            _ => return Err(PoolError::NoWorkerAvailable(EngineMode::Stream)),
        };
        let label = format!("Engine session-{}", session);
        let engine =
            EngineAdapter::spawn(label, EngineMode::Stream, config, self.inner.batch_timeout)
                .await?;
        let id = self.insert(engine, Some(session));
        self.worker(id)
            .ok_or(PoolError::NoWorkerAvailable(EngineMode::Stream))
    }

    fn worker(&self, id: WorkerId) -> Option<Arc<Worker>> {
        self.inner.lock().iter().find(|w| w.id == id).cloned()
    }

    pub fn status(&self) -> Vec<WorkerStatus> {
        self.inner.lock().iter().map(|w| w.status()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Terminate every engine and empty the pool.
    pub async fn shutdown(&self) {
        let workers = std::mem::take(&mut *self.inner.lock());
        info!("[Pool] Shutting down {} worker(s)", workers.len());
        let stops = workers.iter().map(|w| w.engine.terminate());
        futures::future::join_all(stops).await;
    }
}

/// First live worker matching `eligible` with the smallest pending count.
/// Ties go to the earliest registered.
fn least_loaded<'a>(
    workers: &'a [Arc<Worker>],
    eligible: impl Fn(&Worker) -> bool,
) -> Option<&'a Arc<Worker>> {
    workers
        .iter()
        .filter(|w| w.is_alive() && eligible(w))
        .fold(None, |best: Option<&Arc<Worker>>, w| match best {
            Some(b) if b.pending() <= w.pending() => Some(b),
            _ => Some(w),
        })
}
