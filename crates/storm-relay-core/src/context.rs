//! Per-request correlation.
//!
//! A [`RequestContext`] is created once at request entry and read by every
//! downstream component. Its [`RequestId`] is a UUID v7: a 48-bit millisecond
//! timestamp followed by random bits, so ids stay unique under concurrent
//! generation and sort roughly by arrival time.

use chrono::{DateTime, Utc};
use core::{fmt, str::FromStr, time::Duration};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

/// Correlation id tying one request's logs, events and response together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generates a fresh id. Never blocks and has no side effects beyond
    /// returning the id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identity and start time of one HTTP request. Immutable once created.
#[derive(Debug, Clone)]
pub struct RequestContext {
    id: RequestId,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl RequestContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: RequestId::generate(),
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> RequestId {
        self.id
    }

    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Time spent since the request entered the service.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
