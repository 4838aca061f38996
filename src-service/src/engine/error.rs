//! Engine adapter errors.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// No output line carrying the tag arrived before the deadline.
    #[error("engine did not answer request '{tag}' within {timeout:?}")]
    Unresponsive { tag: String, timeout: Duration },

    /// The engine process exited or its pipes closed.
    #[error("engine process terminated")]
    Terminated,

    /// A request with this tag is already outstanding on the same engine.
    #[error("request tag '{0}' is already in flight on this engine")]
    DuplicateTag(String),

    /// Tags must be a single non-empty token.
    #[error("invalid request tag '{0}'")]
    InvalidTag(String),

    #[error("failed to spawn engine stage '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation does not apply to the engine's mode.
    #[error("engine is running in {0:?} mode")]
    WrongMode(asrbridge_common::EngineMode),
}
