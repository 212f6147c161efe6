//! db-query library
//!
//! An immutable MySQL query builder with execution across named connection
//! pools. Builders are obtained from a [`PoolRegistry`], configured through
//! chaining calls that each return a new [`Query`], and finished with a
//! terminal operation that renders the SQL and runs it on the resolved pool.
//!
//! ```no_run
//! # async fn demo(registry: std::sync::Arc<db_query::PoolRegistry>) {
//! let adults = registry
//!     .query("user")
//!     .field("id, name")
//!     .where_op("age", ">=", 18)
//!     .order("name desc")
//!     .page(1, 20)
//!     .select()
//!     .await;
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod query;

pub use config::{Config, PoolConfig};
pub use db::{Pool, PoolRegistry, Row};
pub use error::{DbError, DbResult};
pub use model::{DbModel, ModelBase};
pub use query::{Aggregate, InsertAllResult, JoinKind, Query, Record, Value, Where};
