//! Request, progress and result types shared by the runner, the encoder and
//! the HTTP surface.
//!
//! ## Types
//!
//! - [`GenerationRequest`] - What a client asks for: a topic and whether the
//!   response should be streamed.
//! - [`Stage`] - Pipeline milestones reported during a run, plus the two
//!   terminal markers `done` and `error`.
//! - [`ProgressEvent`] - One ordered, correlated progress record.
//! - [`GenerationResult`] - The final article of a successful run.

use crate::{Error, Result, context::RequestId};
use chrono::{DateTime, Utc};
use core::fmt;
use serde::{Deserialize, Serialize};

/// Default ceiling on topic length, in characters.
pub const DEFAULT_MAX_TOPIC_CHARS: usize = 500;

/// A request to generate an article about `topic`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub topic: String,
    #[serde(default)]
    pub stream: bool,
}

impl GenerationRequest {
    pub fn new(topic: impl Into<String>, stream: bool) -> Self {
        Self {
            topic: topic.into(),
            stream,
        }
    }

    /// Rejects empty or whitespace-only topics and topics longer than
    /// `max_chars` characters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] describing the first violated rule.
    pub fn validate(&self, max_chars: usize) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(Error::Validation {
                reason: "Topic must not be empty".to_string(),
            });
        }

        let chars = self.topic.chars().count();
        if chars > max_chars {
            return Err(Error::Validation {
                reason: format!("Topic is {chars} characters long (maximum {max_chars})"),
            });
        }

        Ok(())
    }
}

/// Pipeline milestones. `Done` and `Error` are terminal and only ever emitted
/// by the task runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Research,
    Outline,
    Draft,
    Polish,
    Done,
    Error,
}

impl Stage {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Outline => "outline",
            Self::Draft => "draft",
            Self::Polish => "polish",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single progress record of one run.
///
/// `sequence` starts at 0 and increases by exactly one per event of the same
/// request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub request_id: RequestId,
    pub sequence: u64,
    pub stage: Stage,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// The article produced by a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub topic: String,
    pub content: String,
    pub request_id: RequestId,
}
