//! Shared types and error definitions used across the relay.
//!
//! ## Submodules
//!
//! - [`error`] - Centralized error type for runs, stores and channels.
//! - [`types`] - Request, event and result types that cross the wire.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{GenerationRequest, GenerationResult, ProgressEvent, Stage};
