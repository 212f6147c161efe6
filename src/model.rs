//! Table-backed records.
//!
//! A [`DbModel`] is a plain struct mapped onto one table. Every model carries
//! the shared bookkeeping columns in [`ModelBase`] (`id`, `deleted`,
//! `update_time`, `create_time`) next to its own fields, and can be inserted
//! through the query builder without spelling out the columns.
//!
//! ```no_run
//! # use db_query::model::{DbModel, ModelBase};
//! # use db_query::Record;
//! #[derive(serde::Deserialize)]
//! struct User {
//!     #[serde(flatten)]
//!     base: ModelBase,
//!     name: String,
//! }
//!
//! impl DbModel for User {
//!     const TABLE: &'static str = "user";
//!
//!     fn base(&self) -> &ModelBase {
//!         &self.base
//!     }
//!
//!     fn fields(&self) -> Record {
//!         Record::new().set("name", self.name.as_str())
//!     }
//! }
//! ```

use crate::db::{PoolRegistry, Row};
use crate::error::{DbError, DbResult};
use crate::query::{InsertAllResult, Query, Record};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

/// Bookkeeping columns shared by every model table. Unset columns are NULL
/// and are left to the table defaults on insert.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelBase {
    pub id: Option<u64>,
    #[serde(deserialize_with = "deserialize_flag")]
    pub deleted: Option<bool>,
    pub update_time: Option<String>,
    pub create_time: Option<String>,
}

impl ModelBase {
    pub const COLUMNS: [&'static str; 4] = ["id", "deleted", "update_time", "create_time"];

    fn write_into(&self, record: &mut Record) {
        record.insert("id", self.id);
        record.insert("deleted", self.deleted);
        record.insert("update_time", self.update_time.clone());
        record.insert("create_time", self.create_time.clone());
    }
}

/// MySQL has no boolean type; `deleted` comes back as TINYINT.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde_json::Value as JsonValue;
    match Option::<JsonValue>::deserialize(deserializer)? {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Bool(b)) => Ok(Some(b)),
        Some(JsonValue::Number(n)) => Ok(Some(n.as_i64() != Some(0))),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a boolean flag, got {other}"
        ))),
    }
}

/// A struct stored as one row of [`DbModel::TABLE`].
pub trait DbModel {
    /// Table name, before the pool prefix.
    const TABLE: &'static str;

    /// Pool to use; `None` is the master pool.
    const POOL: Option<&'static str> = None;

    fn base(&self) -> &ModelBase;

    /// The model's own columns, in column order.
    fn fields(&self) -> Record;

    /// Own columns followed by the bookkeeping columns.
    fn to_record(&self) -> Record {
        let mut record = self.fields();
        self.base().write_into(&mut record);
        record
    }

    /// A builder on this model's table and pool.
    fn query(registry: &Arc<PoolRegistry>) -> Query {
        match Self::POOL {
            Some(pool) => registry.query_on(Self::TABLE, pool),
            None => registry.query(Self::TABLE),
        }
    }

    /// Decode a result row into the model.
    fn from_row(row: Row) -> DbResult<Self>
    where
        Self: Sized + DeserializeOwned,
    {
        serde_json::from_value(serde_json::Value::Object(row)).map_err(|e| {
            DbError::invalid_input(format!("row does not match {}: {e}", Self::TABLE))
        })
    }

    /// Insert this model; the generated id, `0` on failure.
    fn insert(&self, registry: &Arc<PoolRegistry>) -> impl Future<Output = u64> + Send {
        let query = Self::query(registry);
        let record = self.to_record();
        async move { query.insert(record).await }
    }

    /// Insert models one row at a time.
    fn insert_all(
        models: &[Self],
        registry: &Arc<PoolRegistry>,
    ) -> impl Future<Output = InsertAllResult> + Send
    where
        Self: Sized,
    {
        let query = Self::query(registry);
        let records: Vec<Record> = models.iter().map(|m| m.to_record()).collect();
        async move {
            if records.is_empty() {
                return InsertAllResult::default();
            }
            query.insert_all(records).await
        }
    }
}
