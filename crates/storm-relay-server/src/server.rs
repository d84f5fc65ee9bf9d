//! HTTP surface of the relay.
//!
//! ## Structure
//!
//! - [`config`] - CLI/environment configuration.
//! - [`middleware`] - Request-id correlation for every request.
//! - [`service`] - Routes, handlers and error responses.
//! - [`telemetry`] - Logging and optional metrics.

pub mod config;
pub mod middleware;
pub mod service;
pub mod telemetry;
