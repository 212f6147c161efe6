//! Database access layer.
//!
//! This module provides:
//! - Named connection pools and the registry that resolves them
//! - Statement execution
//! - MySQL row decoding

pub mod executor;
pub mod pool;
pub mod types;

pub use executor::{ExecOutcome, QueryExecutor};
pub use pool::{Pool, PoolRegistry, PoolSummary};
pub use types::{Row, RowToJson};
