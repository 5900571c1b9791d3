#![deny(missing_docs)]

//! Shared configuration, error types, and the row record for rowmill crates.
//!
//! Architecture role:
//! - defines the worker/node-manager options passed across layers
//! - provides the common [`MillError`] / [`Result`] contracts
//! - hosts the [`Row`] record routed through the shuffle substrate
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`row`]

/// Worker and node-manager configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Identifier generation helpers.
pub mod ids;
/// Routed row record.
pub mod row;

pub use config::{InputOptions, NodeManagerOptions, OutputOptions, WorkerOptions};
pub use error::{MillError, Result};
pub use ids::generate_id;
pub use row::Row;
