//! Tag-keyed routing of batch results back to their waiting callers.
//!
//! Each outstanding batch request owns a single-resolution slot. The engine
//! reader hands every output line to [`TagDemux::dispatch_line`], which
//! resolves the slot whose tag leads the line.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use super::error::EngineError;

pub type Reply = Result<String, EngineError>;

#[derive(Default)]
struct Slots {
    waiters: HashMap<String, oneshot::Sender<Reply>>,
    closed: bool,
}

/// Mapping from request tag to the caller waiting on it.
#[derive(Default)]
pub struct TagDemux {
    slots: Mutex<Slots>,
}

impl TagDemux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot for `tag`. Must happen before the request is written so
    /// the answer cannot race past the registration.
    pub fn register(&self, tag: &str) -> Result<oneshot::Receiver<Reply>, EngineError> {
        let mut slots = self.lock();
        if slots.closed {
            return Err(EngineError::Terminated);
        }
        if slots.waiters.contains_key(tag) {
            return Err(EngineError::DuplicateTag(tag.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        slots.waiters.insert(tag.to_string(), tx);
        Ok(rx)
    }

    /// Drop the slot for `tag` (timeout or caller gave up).
    pub fn cancel(&self, tag: &str) {
        self.lock().waiters.remove(tag);
    }

    /// Route one engine output line. Returns true if it resolved a waiter.
    pub fn dispatch_line(&self, line: &str) -> bool {
        let Some((tag, hypothesis)) = split_tagged_line(line) else {
            return false;
        };
        let waiter = self.lock().waiters.remove(tag);
        match waiter {
            Some(tx) => {
                // The receiver may have timed out in the meantime
                let _ = tx.send(Ok(hypothesis.to_string()));
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding request and refuse new ones.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut slots = self.lock();
            slots.closed = true;
            slots.waiters.drain().collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(EngineError::Terminated));
        }
        count
    }

    /// Number of requests waiting for output.
    pub fn outstanding(&self) -> usize {
        self.lock().waiters.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slots> {
        // A panic while holding this lock cannot leave the map inconsistent
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Split `"<tag><whitespace><hypothesis>"` into its parts.
///
/// A tag followed only by whitespace yields an empty hypothesis (engines print
/// that for silent audio). A line with no whitespace after the first token is
/// not a result line.
pub fn split_tagged_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_end_matches(['\r', '\n']);
    let split = line.find(char::is_whitespace)?;
    let (tag, rest) = line.split_at(split);
    if tag.is_empty() {
        return None;
    }
    Some((tag, rest.trim()))
}
