//! Shared types and wire protocol for asrbridge.
//!
//! Used by both the decoding service and the CLI client.

pub mod protocol;
pub mod types;

pub use types::*;
