//! External decoding engines driven over their standard streams.
//!
//! An [`EngineAdapter`] owns one engine pipeline. In batch mode each request is
//! a tagged script line and the answer is routed back by tag; in stream mode raw
//! audio is written through and every hypothesis line is fanned out to
//! subscribers.

mod adapter;
mod demux;
mod error;
mod process;
mod subscribers;

pub use adapter::{normalize_stream_line, DecodingRequest, EngineAdapter};
pub use demux::split_tagged_line;
pub use error::EngineError;
pub use subscribers::{Subscription, SubscriptionId};
