//! Shared configuration, error types and IDs for MSQ crates.
//!
//! Architecture role:
//! - defines dispatch configuration passed from callers into planning
//! - provides common [`MsqError`] / [`Result`] contracts
//! - hosts typed stage/worker/node identifiers
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]

pub mod config;
pub mod error;
pub mod ids;

pub use config::DispatchConfig;
pub use error::{MsqError, Result};
pub use ids::*;
