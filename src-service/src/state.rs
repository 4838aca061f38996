//! Shared service state handed to every listener.

use std::sync::Arc;

use asrbridge_common::ServiceStatus;
use tokio_util::sync::CancellationToken;

use crate::config::ServiceConfig;
use crate::pool::WorkerPool;
use crate::session::{SessionOptions, SessionRegistry};

/// Everything a connection handler needs, built once at startup.
pub struct ServiceContext {
    pub config: ServiceConfig,
    pub pool: WorkerPool,
    pub sessions: SessionRegistry,
    /// Cancelled when the service is shutting down
    pub shutdown: CancellationToken,
}

pub type SharedContext = Arc<ServiceContext>;

impl ServiceContext {
    pub fn new(config: ServiceConfig, pool: WorkerPool, shutdown: CancellationToken) -> SharedContext {
        Arc::new(Self {
            sessions: SessionRegistry::new(shutdown.clone()),
            config,
            pool,
            shutdown,
        })
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            subscriber_capacity: self.config.subscriber_capacity,
            linger: self.config.session_linger(),
        }
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            workers: self.pool.status(),
            sessions: self.sessions.list(),
        }
    }
}
