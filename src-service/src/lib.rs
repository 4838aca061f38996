//! asrbridge decoding service.
//!
//! Drives external speech recognition engines as long-lived child processes
//! and exposes them over HTTP upload, TCP, UDP and browser socket transports.

pub mod config;
pub mod engine;
pub mod pool;
pub mod server;
pub mod session;
pub mod state;

pub use config::{ConfigError, ServiceConfig};
pub use pool::{PoolError, WorkerPool};
pub use state::{ServiceContext, SharedContext};
