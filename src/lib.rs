//! Resource Fetcher Library
//!
//! Client-side access to remote resources: requests run through a bounded
//! pool of connections in priority order, and a keyed file cache fetches each
//! distinct resource once and serves it from disk afterwards.

pub mod app;
pub mod config;
pub mod constants;
pub mod errors;
pub mod logging;

// Re-export commonly used types for convenience
pub use errors::{AppError, Result};
