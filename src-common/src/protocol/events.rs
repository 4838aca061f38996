//! Hypothesis event records.

use serde::{Deserialize, Serialize};

/// A transcription hypothesis emitted by a decoding engine.
///
/// On the wire this is either `{"backoff": n, "phrase": "..."}` (datagram
/// transports) or `{"sentence": "..."}` (stream and text transports).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HypothesisEvent {
    /// Incremental phrase. `backoff` is how many previously delivered words
    /// the phrase replaces.
    Phrase { backoff: i64, phrase: String },
    /// Complete utterance.
    Sentence { sentence: String },
}

impl HypothesisEvent {
    pub fn phrase(backoff: i64, phrase: impl Into<String>) -> Self {
        HypothesisEvent::Phrase {
            backoff,
            phrase: phrase.into(),
        }
    }

    pub fn sentence(sentence: impl Into<String>) -> Self {
        HypothesisEvent::Sentence {
            sentence: sentence.into(),
        }
    }

    /// The hypothesis text regardless of record shape.
    pub fn text(&self) -> &str {
        match self {
            HypothesisEvent::Phrase { phrase, .. } => phrase,
            HypothesisEvent::Sentence { sentence } => sentence,
        }
    }
}
