//! The immutable query builder.
//!
//! A [`Query`] is a value: every chaining method takes `&self` and returns a
//! new builder, so a half-configured query can be shared, cloned across tasks
//! and extended in different directions without interference.
//!
//! Terminal operations come in two flavours:
//! - plain (`select`, `insert`, `count`, ...) log failures and return the
//!   operation's empty value (`[]`, `0`, `None`, `""`)
//! - `try_*` return a [`DbResult`] so "no rows" and "failed" stay distinct

pub mod clause;
pub mod escape;
pub mod parse;
mod render;
pub mod value;

pub use clause::{Join, JoinKind, JoinOn, JoinTarget, Operand, Operator, Where, values};
pub use value::{IntoRecords, Record, Value};

use crate::db::{Pool, PoolRegistry, QueryExecutor, Row};
use crate::error::{DbError, DbResult};
use crate::query::escape::escape_id;
use crate::query::parse::{FieldExpr, split_top_level};
use crate::query::render::{Assignment, Statement};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, warn};

/// Rows per page when `page` is given a size of 0.
pub const DEFAULT_PAGE_SIZE: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Limit {
    pub rows: u64,
    pub offset: u64,
}

/// Outcome of [`Query::insert_all`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertAllResult {
    pub succeeded_ids: Vec<u64>,
    #[serde(skip)]
    pub failed_rows: Vec<Record>,
}

/// Aggregate functions usable as a terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Count,
    Max,
    Min,
    Avg,
    Sum,
}

impl Aggregate {
    fn function(&self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Max => "MAX",
            Self::Min => "MIN",
            Self::Avg => "AVG",
            Self::Sum => "SUM",
        }
    }

    /// Column label of the aggregate in the result row.
    fn label(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Max => "max",
            Self::Min => "min",
            Self::Avg => "avg",
            Self::Sum => "sum",
        }
    }
}

/// Field lists accepted by [`Query::field`].
pub trait IntoFields {
    fn into_fields(self) -> Vec<String>;
}

/// A comma-separated list; commas inside calls or quotes do not split.
impl IntoFields for &str {
    fn into_fields(self) -> Vec<String> {
        split_top_level(self, ',')
    }
}

impl IntoFields for String {
    fn into_fields(self) -> Vec<String> {
        self.as_str().into_fields()
    }
}

impl IntoFields for &[&str] {
    fn into_fields(self) -> Vec<String> {
        self.iter().map(|s| s.trim().to_string()).collect()
    }
}

impl<const N: usize> IntoFields for [&str; N] {
    fn into_fields(self) -> Vec<String> {
        self.as_slice().into_fields()
    }
}

impl IntoFields for Vec<&str> {
    fn into_fields(self) -> Vec<String> {
        self.as_slice().into_fields()
    }
}

impl IntoFields for Vec<String> {
    fn into_fields(self) -> Vec<String> {
        self.into_iter().map(|s| s.trim().to_string()).collect()
    }
}

/// An immutable query builder bound to a pool registry.
#[derive(Debug, Clone)]
pub struct Query {
    registry: Arc<PoolRegistry>,
    /// `None` targets the master pool.
    pool: Option<String>,
    table: String,
    apply_prefix: bool,
    alias: Option<String>,
    joins: Vec<Join>,
    wheres: Vec<Where>,
    fields: Vec<String>,
    limit: Option<Limit>,
    group: Option<String>,
    having: Option<String>,
    order: Option<String>,
    ignore_null: bool,
    distinct: bool,
}

impl Query {
    /// An empty builder on the master pool of `registry`.
    pub fn new(registry: Arc<PoolRegistry>) -> Self {
        Self {
            registry,
            pool: None,
            table: String::new(),
            apply_prefix: false,
            alias: None,
            joins: Vec::new(),
            wheres: Vec::new(),
            fields: Vec::new(),
            limit: None,
            group: None,
            having: None,
            order: None,
            ignore_null: true,
            distinct: false,
        }
    }

    fn with(&self, change: impl FnOnce(&mut Query)) -> Query {
        let mut next = self.clone();
        change(&mut next);
        next
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn pool_name(&self) -> Option<&str> {
        self.pool.as_deref()
    }

    // ------------------------------------------------------------------
    // Chaining
    // ------------------------------------------------------------------

    /// Target `name`; with `apply_prefix` the resolved pool's prefix is
    /// prepended at render time.
    pub fn table(&self, name: &str, apply_prefix: bool) -> Query {
        self.with(|q| {
            q.table = name.trim().to_string();
            q.apply_prefix = apply_prefix;
        })
    }

    /// Run on the named pool instead of the master.
    pub fn using(&self, pool: &str) -> Query {
        self.with(|q| q.pool = Some(pool.to_string()))
    }

    pub fn alias(&self, name: &str) -> Query {
        self.with(|q| q.alias = Some(name.trim().to_string()).filter(|a| !a.is_empty()))
    }

    /// Add a join.
    ///
    /// `target` is `"table"`, `"table alias"`, a `(table, alias)` pair or a
    /// `(query, alias)` subquery. Only the bare string form receives the pool
    /// prefix. `on` holds one or more `left = right` pairs, ANDed.
    pub fn join(
        &self,
        target: impl Into<JoinTarget>,
        on: impl Into<JoinOn>,
        kind: JoinKind,
    ) -> Query {
        let join = Join {
            target: target.into(),
            on: on.into(),
            kind,
        };
        self.with(|q| q.joins.push(join))
    }

    pub fn inner_join(&self, target: impl Into<JoinTarget>, on: impl Into<JoinOn>) -> Query {
        self.join(target, on, JoinKind::Inner)
    }

    pub fn left_join(&self, target: impl Into<JoinTarget>, on: impl Into<JoinOn>) -> Query {
        self.join(target, on, JoinKind::Left)
    }

    pub fn right_join(&self, target: impl Into<JoinTarget>, on: impl Into<JoinOn>) -> Query {
        self.join(target, on, JoinKind::Right)
    }

    pub fn full_join(&self, target: impl Into<JoinTarget>, on: impl Into<JoinOn>) -> Query {
        self.join(target, on, JoinKind::Full)
    }

    /// Add a WHERE entry: a string is a raw expression, a `(field, value)`
    /// pair an equality and a `(field, op, value)` triple an explicit
    /// comparison. Entries are ANDed.
    pub fn filter(&self, condition: impl Into<Where>) -> Query {
        let condition = condition.into();
        self.with(|q| q.wheres.push(condition))
    }

    /// Add a batch of ANDed entries.
    pub fn filter_all<I, W>(&self, conditions: I) -> Query
    where
        I: IntoIterator<Item = W>,
        W: Into<Where>,
    {
        let conditions: Vec<Where> = conditions.into_iter().map(Into::into).collect();
        self.with(|q| q.wheres.extend(conditions))
    }

    pub fn where_raw(&self, expr: &str) -> Query {
        self.filter(Where::raw(expr))
    }

    pub fn where_eq(&self, field: &str, value: impl Into<Value>) -> Query {
        self.filter(Where::cond(field, "=", value.into()))
    }

    pub fn where_op(&self, field: &str, op: &str, value: impl Into<Operand>) -> Query {
        self.filter(Where::cond(field, op, value))
    }

    pub fn where_in<I, T>(&self, field: &str, items: I) -> Query
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        self.filter(Where::cond(field, "IN", values(items)))
    }

    pub fn where_not_in<I, T>(&self, field: &str, items: I) -> Query
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        self.filter(Where::cond(field, "NOT IN", values(items)))
    }

    pub fn where_like(&self, field: &str, pattern: impl Into<Value>) -> Query {
        self.filter(Where::cond(field, "LIKE", pattern.into()))
    }

    pub fn where_not_like(&self, field: &str, pattern: impl Into<Value>) -> Query {
        self.filter(Where::cond(field, "NOT LIKE", pattern.into()))
    }

    pub fn where_null(&self, field: &str) -> Query {
        self.filter(Where::cond(field, "IS", Value::Null))
    }

    pub fn where_not_null(&self, field: &str) -> Query {
        self.filter(Where::cond(field, "IS NOT", Value::Null))
    }

    pub fn where_between(
        &self,
        field: &str,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Query {
        self.filter(Where::cond(
            field,
            "BETWEEN",
            Operand::Many(vec![low.into(), high.into()]),
        ))
    }

    pub fn where_not_between(
        &self,
        field: &str,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Query {
        self.filter(Where::cond(
            field,
            "NOT BETWEEN",
            Operand::Many(vec![low.into(), high.into()]),
        ))
    }

    /// Add projected fields. Entries may carry `as alias`; entries with a
    /// `(` are raw expressions.
    pub fn field(&self, fields: impl IntoFields) -> Query {
        let fields = fields.into_fields();
        self.with(|q| q.fields.extend(fields))
    }

    /// `rows == 0` means no limit.
    pub fn limit(&self, rows: u64, offset: u64) -> Query {
        self.with(|q| q.limit = Some(Limit { rows, offset }))
    }

    /// 1-based paging; page 0 is page 1 and size 0 is [`DEFAULT_PAGE_SIZE`].
    pub fn page(&self, page: u64, size: u64) -> Query {
        let size = if size == 0 { DEFAULT_PAGE_SIZE } else { size };
        let page = page.max(1);
        self.limit(size, (page - 1).saturating_mul(size))
    }

    pub fn group(&self, expr: &str) -> Query {
        self.with(|q| q.group = Some(expr.to_string()))
    }

    /// Only rendered together with a GROUP BY.
    pub fn having(&self, expr: &str) -> Query {
        self.with(|q| q.having = Some(expr.to_string()))
    }

    /// Comma list of `field [ASC|DESC]`.
    pub fn order(&self, expr: &str) -> Query {
        self.with(|q| q.order = Some(expr.to_string()))
    }

    pub fn distinct(&self, distinct: bool) -> Query {
        self.with(|q| q.distinct = distinct)
    }

    /// Drop NULL columns from INSERT and UPDATE input (default on).
    pub fn ignore_null(&self, ignore: bool) -> Query {
        self.with(|q| q.ignore_null = ignore)
    }

    // ------------------------------------------------------------------
    // Rendering
    // ------------------------------------------------------------------

    /// The limit in force; a zero row count counts as none.
    pub(crate) fn effective_limit(&self) -> Option<Limit> {
        self.limit.filter(|limit| limit.rows > 0)
    }

    fn resolve_pool(&self) -> DbResult<Arc<Pool>> {
        self.registry.get(self.pool.as_deref())
    }

    fn prepare(&self, statement: Statement<'_>) -> DbResult<(Arc<Pool>, String)> {
        let pool = self.resolve_pool()?;
        let sql = self.render(&pool, statement)?;
        Ok((pool, sql))
    }

    fn assignments(&self, record: &Record) -> Vec<Assignment> {
        record
            .iter()
            .filter(|(_, value)| !(self.ignore_null && value.is_null()))
            .map(|(column, value)| Assignment::Set(column.to_string(), value.clone()))
            .collect()
    }

    pub fn try_select_sql(&self) -> DbResult<String> {
        self.prepare(Statement::Select).map(|(_, sql)| sql)
    }

    pub fn try_insert_sql(&self, rows: impl IntoRecords) -> DbResult<String> {
        let rows = rows.into_records();
        self.prepare(Statement::Insert(&rows)).map(|(_, sql)| sql)
    }

    pub fn try_update_sql(&self, record: impl Into<Record>) -> DbResult<String> {
        let assignments = self.assignments(&record.into());
        self.prepare(Statement::Update(&assignments))
            .map(|(_, sql)| sql)
    }

    pub fn try_delete_sql(&self) -> DbResult<String> {
        self.prepare(Statement::Delete).map(|(_, sql)| sql)
    }

    /// SELECT text, or `""` when the query cannot be rendered.
    pub fn select_sql(&self) -> String {
        self.try_select_sql()
            .unwrap_or_else(|e| self.degrade("select_sql", e, String::new()))
    }

    pub fn insert_sql(&self, rows: impl IntoRecords) -> String {
        self.try_insert_sql(rows)
            .unwrap_or_else(|e| self.degrade("insert_sql", e, String::new()))
    }

    pub fn update_sql(&self, record: impl Into<Record>) -> String {
        self.try_update_sql(record)
            .unwrap_or_else(|e| self.degrade("update_sql", e, String::new()))
    }

    pub fn delete_sql(&self) -> String {
        self.try_delete_sql()
            .unwrap_or_else(|e| self.degrade("delete_sql", e, String::new()))
    }

    fn degrade<T>(&self, operation: &str, err: DbError, fallback: T) -> T {
        if err.is_render_error() {
            warn!(
                operation,
                table = %self.table,
                pool = self.pool.as_deref().unwrap_or("<master>"),
                error = %err,
                "Query not rendered"
            );
        } else {
            // The executor already logged the statement at error
            debug!(
                operation,
                table = %self.table,
                pool = self.pool.as_deref().unwrap_or("<master>"),
                error = %err,
                "Query failed"
            );
        }
        fallback
    }

    // ------------------------------------------------------------------
    // Terminals
    // ------------------------------------------------------------------

    /// Insert one or many rows in a single statement and return the
    /// generated id of the first row.
    pub async fn try_insert(&self, rows: impl IntoRecords) -> DbResult<u64> {
        let rows = rows.into_records();
        let (pool, sql) = self.prepare(Statement::Insert(&rows))?;
        let outcome = QueryExecutor::new(&pool).execute(&sql).await?;
        Ok(outcome.last_insert_id)
    }

    /// Generated id, `0` on failure.
    pub async fn insert(&self, rows: impl IntoRecords) -> u64 {
        self.try_insert(rows)
            .await
            .unwrap_or_else(|e| self.degrade("insert", e, 0))
    }

    /// Insert rows one statement at a time. Rows yielding id 0 (failure or a
    /// table without AUTO_INCREMENT) are reported in `failed_rows`.
    pub async fn insert_all(&self, rows: impl IntoRecords) -> InsertAllResult {
        let mut result = InsertAllResult::default();
        for row in rows.into_records() {
            match self.insert(&row).await {
                0 => result.failed_rows.push(row),
                id => result.succeeded_ids.push(id),
            }
        }
        debug!(
            table = %self.table,
            succeeded = result.succeeded_ids.len(),
            failed = result.failed_rows.len(),
            "insert_all finished"
        );
        result
    }

    pub async fn try_select(&self) -> DbResult<Vec<Row>> {
        let (pool, sql) = self.prepare(Statement::Select)?;
        QueryExecutor::new(&pool).fetch_rows(&sql).await
    }

    /// Matching rows, `[]` on failure.
    pub async fn select(&self) -> Vec<Row> {
        self.try_select()
            .await
            .unwrap_or_else(|e| self.degrade("select", e, Vec::new()))
    }

    /// First matching row. A positive `id` adds `id = <id>`; a missing or
    /// zero limit becomes `LIMIT 0, 1`.
    pub async fn try_find(&self, id: Option<u64>) -> DbResult<Option<Row>> {
        let query = self.find_query(id);
        Ok(query.try_select().await?.into_iter().next())
    }

    fn find_query(&self, id: Option<u64>) -> Query {
        let mut query = self.clone();
        if let Some(id) = id.filter(|&id| id > 0) {
            query = query.where_eq("id", id);
        }
        if query.effective_limit().is_none() {
            query = query.limit(1, 0);
        }
        query
    }

    pub async fn find(&self, id: Option<u64>) -> Option<Row> {
        self.try_find(id)
            .await
            .unwrap_or_else(|e| self.degrade("find", e, None))
    }

    /// Values of one field across the matching rows. The projection is
    /// replaced by `field`.
    pub async fn try_column(&self, field: &str) -> DbResult<Vec<JsonValue>> {
        let expr = FieldExpr::parse(field)?;
        let key = match &expr.alias {
            Some(alias) => alias.clone(),
            None if expr.expr.contains('(') => expr.expr.clone(),
            // MySQL labels `t.name` as `name`
            None => expr.expr.rsplit('.').next().unwrap_or(&expr.expr).to_string(),
        };
        let query = self.with(|q| q.fields = vec![field.trim().to_string()]);
        let rows = query.try_select().await?;
        Ok(rows
            .into_iter()
            .map(|mut row| row.remove(&key).unwrap_or(JsonValue::Null))
            .collect())
    }

    pub async fn column(&self, field: &str) -> Vec<JsonValue> {
        self.try_column(field)
            .await
            .unwrap_or_else(|e| self.degrade("column", e, Vec::new()))
    }

    /// Run `FUNC(field)` in place of the projection with `LIMIT 0, 1` and
    /// return the value of the first row. SQL NULL is `None`.
    pub async fn try_aggregate(
        &self,
        aggregate: Aggregate,
        field: &str,
    ) -> DbResult<Option<JsonValue>> {
        let row = self
            .aggregate_query(aggregate, field)?
            .try_select()
            .await?
            .into_iter()
            .next();
        Ok(row
            .and_then(|mut r| r.remove(aggregate.label()))
            .filter(|v| !v.is_null()))
    }

    /// SELECT text of an aggregate terminal.
    pub fn try_aggregate_sql(&self, aggregate: Aggregate, field: &str) -> DbResult<String> {
        self.aggregate_query(aggregate, field)?.try_select_sql()
    }

    fn aggregate_query(&self, aggregate: Aggregate, field: &str) -> DbResult<Query> {
        let field = field.trim();
        if field.is_empty() {
            return Err(DbError::invalid_input("aggregate field cannot be empty"));
        }
        let argument = if field == "*" || field.contains('(') {
            field.to_string()
        } else {
            escape_id(field)
        };
        let projection = format!(
            "{}({}) as {}",
            aggregate.function(),
            argument,
            aggregate.label()
        );
        Ok(self.with(|q| {
            q.fields = vec![projection];
            q.limit = Some(Limit { rows: 1, offset: 0 });
        }))
    }

    pub async fn try_count(&self, field: &str) -> DbResult<u64> {
        let value = self.try_aggregate(Aggregate::Count, field).await?;
        Ok(value.as_ref().and_then(json_to_u64).unwrap_or(0))
    }

    /// Row count, `0` on failure.
    pub async fn count(&self, field: &str) -> u64 {
        self.try_count(field)
            .await
            .unwrap_or_else(|e| self.degrade("count", e, 0))
    }

    async fn aggregate(&self, aggregate: Aggregate, field: &str) -> Option<JsonValue> {
        self.try_aggregate(aggregate, field)
            .await
            .unwrap_or_else(|e| self.degrade(aggregate.label(), e, None))
    }

    pub async fn max(&self, field: &str) -> Option<JsonValue> {
        self.aggregate(Aggregate::Max, field).await
    }

    pub async fn min(&self, field: &str) -> Option<JsonValue> {
        self.aggregate(Aggregate::Min, field).await
    }

    pub async fn avg(&self, field: &str) -> Option<JsonValue> {
        self.aggregate(Aggregate::Avg, field).await
    }

    pub async fn sum(&self, field: &str) -> Option<JsonValue> {
        self.aggregate(Aggregate::Sum, field).await
    }

    async fn try_write(&self, statement: Statement<'_>) -> DbResult<u64> {
        let (pool, sql) = self.prepare(statement)?;
        let outcome = QueryExecutor::new(&pool).execute(&sql).await?;
        Ok(outcome.rows_affected)
    }

    /// Update matching rows and return the affected count. Refused without
    /// a WHERE entry.
    pub async fn try_update(&self, record: impl Into<Record>) -> DbResult<u64> {
        let assignments = self.assignments(&record.into());
        self.try_write(Statement::Update(&assignments)).await
    }

    pub async fn update(&self, record: impl Into<Record>) -> u64 {
        self.try_update(record)
            .await
            .unwrap_or_else(|e| self.degrade("update", e, 0))
    }

    pub async fn try_inc(&self, field: &str, amount: impl Into<Value>) -> DbResult<u64> {
        let assignments = [Assignment::Shift {
            column: field.to_string(),
            amount: amount.into(),
            negate: false,
        }];
        self.try_write(Statement::Update(&assignments)).await
    }

    /// `field = field + amount` on matching rows.
    pub async fn inc(&self, field: &str, amount: impl Into<Value>) -> u64 {
        self.try_inc(field, amount)
            .await
            .unwrap_or_else(|e| self.degrade("inc", e, 0))
    }

    pub async fn try_dec(&self, field: &str, amount: impl Into<Value>) -> DbResult<u64> {
        let assignments = [Assignment::Shift {
            column: field.to_string(),
            amount: amount.into(),
            negate: true,
        }];
        self.try_write(Statement::Update(&assignments)).await
    }

    /// `field = field - amount` on matching rows.
    pub async fn dec(&self, field: &str, amount: impl Into<Value>) -> u64 {
        self.try_dec(field, amount)
            .await
            .unwrap_or_else(|e| self.degrade("dec", e, 0))
    }

    pub async fn try_delete(&self) -> DbResult<u64> {
        self.try_write(Statement::Delete).await
    }

    /// Delete matching rows. Refused without a WHERE entry.
    pub async fn delete(&self) -> u64 {
        self.try_delete()
            .await
            .unwrap_or_else(|e| self.degrade("delete", e, 0))
    }
}

/// COUNT comes back as BIGINT; DECIMAL-typed counts arrive as strings.
fn json_to_u64(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::Number(n) => n
            .as_u64()
            .or_else(|| n.as_i64().and_then(|i| u64::try_from(i).ok())),
        JsonValue::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    fn registry() -> Arc<PoolRegistry> {
        let mut main = PoolConfig::new("main").with_master(true).with_prefix("t_");
        main.host = "127.0.0.1".to_string();
        main.port = 1;
        let mut plain = PoolConfig::new("plain");
        plain.host = "127.0.0.1".to_string();
        plain.port = 1;
        PoolRegistry::connect_lazy(vec![main, plain]).unwrap()
    }

    #[tokio::test]
    async fn test_select_all_defaults() {
        let r = registry();
        assert_eq!(r.query("user").select_sql(), "SELECT * FROM `t_user`");
        assert_eq!(
            r.builder().table("user", false).select_sql(),
            "SELECT * FROM `user`"
        );
    }

    #[tokio::test]
    async fn test_chaining_does_not_mutate() {
        let r = registry();
        let base = r.query("user").where_eq("active", 1);
        let before = base.select_sql();
        let _a = base.where_eq("age", 3).order("id desc");
        let _b = base.field("id").limit(5, 0);
        assert_eq!(base.select_sql(), before);
    }

    #[tokio::test]
    async fn test_full_select_clause_order() {
        let r = registry();
        let sql = r
            .query("user")
            .alias("u")
            .distinct(true)
            .field("u.id, count(*) as n")
            .left_join("order o", "o.user_id = u.id")
            .where_eq("u.active", true)
            .where_op("u.age", ">", 18)
            .group("u.id")
            .having("n > 1")
            .order("n desc")
            .limit(10, 20)
            .select_sql();
        assert_eq!(
            sql,
            "SELECT DISTINCT `u`.`id`, count(*) AS `n` FROM `t_user` AS `u` \
             LEFT JOIN `t_order` AS `o` ON `o`.`user_id` = `u`.`id` \
             WHERE `u`.`active` = true AND `u`.`age` > 18 \
             GROUP BY `u`.`id` HAVING n > 1 ORDER BY `n` DESC LIMIT 20, 10"
        );
    }

    #[tokio::test]
    async fn test_having_without_group_is_skipped() {
        let r = registry();
        assert_eq!(
            r.query("user").having("n > 1").select_sql(),
            "SELECT * FROM `t_user`"
        );
    }

    #[tokio::test]
    async fn test_page_equivalent_to_limit() {
        let r = registry();
        let q = r.query("user");
        assert_eq!(q.page(2, 10).select_sql(), q.limit(10, 10).select_sql());
        assert_eq!(q.page(0, 10).select_sql(), q.limit(10, 0).select_sql());
        assert_eq!(
            q.page(3, 0).select_sql(),
            q.limit(DEFAULT_PAGE_SIZE, 2 * DEFAULT_PAGE_SIZE).select_sql()
        );
    }

    #[tokio::test]
    async fn test_zero_rows_limit_is_no_limit() {
        let r = registry();
        let q = r.query("user");
        assert_eq!(q.limit(0, 0).select_sql(), "SELECT * FROM `t_user`");
        assert_eq!(q.limit(0, 40).select_sql(), "SELECT * FROM `t_user`");
        assert_eq!(
            q.where_eq("id", 1).limit(0, 0).delete_sql(),
            "DELETE FROM `t_user` WHERE `id` = 1"
        );
        assert_eq!(q.limit(0, 0).effective_limit(), None);
        assert_eq!(
            q.limit(5, 0).effective_limit(),
            Some(Limit { rows: 5, offset: 0 })
        );
    }

    #[tokio::test]
    async fn test_find_relimits_zero_limit_query() {
        let r = registry();
        let q = r.query("user").limit(0, 0);
        assert_eq!(
            q.find_query(None).select_sql(),
            "SELECT * FROM `t_user` LIMIT 0, 1"
        );
        assert_eq!(
            q.find_query(Some(9)).select_sql(),
            "SELECT * FROM `t_user` WHERE `id` = 9 LIMIT 0, 1"
        );
        // an explicit limit is kept, id 0 adds no filter
        assert_eq!(
            r.query("user").limit(3, 6).find_query(Some(0)).select_sql(),
            "SELECT * FROM `t_user` LIMIT 6, 3"
        );
    }

    #[tokio::test]
    async fn test_connective_operator_is_rejected() {
        let r = registry();
        let q = r.query("user").where_eq("a", 1).where_op("id", "or", 1);
        assert_eq!(q.select_sql(), "");
        assert!(matches!(
            q.try_select_sql(),
            Err(DbError::InvalidInput { .. })
        ));
        let q = r.query("user").where_op("id", "union select", 1);
        assert!(q.try_select_sql().is_err());
        assert_eq!(
            r.query("user").where_op("name", "regexp", "^a").select_sql(),
            "SELECT * FROM `t_user` WHERE `name` REGEXP '^a'"
        );
    }

    #[tokio::test]
    async fn test_raw_where_wrapped_with_neighbours() {
        let r = registry();
        let sql = r
            .query("user")
            .where_raw("a = 1 OR b = 2")
            .where_eq("c", 3)
            .select_sql();
        assert_eq!(
            sql,
            "SELECT * FROM `t_user` WHERE (a = 1 OR b = 2) AND `c` = 3"
        );
        let single = r.query("user").where_raw("a = 1 OR b = 2").select_sql();
        assert_eq!(single, "SELECT * FROM `t_user` WHERE a = 1 OR b = 2");
    }

    #[tokio::test]
    async fn test_filter_overloads() {
        let r = registry();
        let sql = r
            .query("user")
            .filter("deleted = 0")
            .filter(("name", "bob"))
            .filter(("age", ">=", 21))
            .select_sql();
        assert_eq!(
            sql,
            "SELECT * FROM `t_user` WHERE (deleted = 0) AND `name` = 'bob' AND `age` >= 21"
        );
    }

    #[tokio::test]
    async fn test_filter_all_batch() {
        let r = registry();
        let sql = r
            .query("user")
            .filter_all([("age", ">", 1), ("age", "<", 9)])
            .select_sql();
        assert_eq!(sql, "SELECT * FROM `t_user` WHERE `age` > 1 AND `age` < 9");
    }

    #[tokio::test]
    async fn test_where_helpers() {
        let r = registry();
        let sql = r
            .query("user")
            .where_in("id", [1, 2, 3])
            .where_not_in("role", ["a", "b"])
            .where_like("name", "jo%")
            .where_not_like("mail", "%@spam")
            .where_null("deleted_at")
            .where_not_null("email")
            .where_between("age", 18, 30)
            .where_not_between("score", 0, 10)
            .select_sql();
        assert_eq!(
            sql,
            "SELECT * FROM `t_user` WHERE `id` IN (1, 2, 3) AND `role` NOT IN ('a', 'b') \
             AND `name` LIKE 'jo%' AND `mail` NOT LIKE '%@spam' AND `deleted_at` IS NULL \
             AND `email` IS NOT NULL AND `age` BETWEEN 18 AND 30 \
             AND `score` NOT BETWEEN 0 AND 10"
        );
    }

    #[tokio::test]
    async fn test_invalid_operator_renders_empty() {
        let r = registry();
        let q = r.query("user").where_op("id", "= 1 OR 1 =", 1);
        assert_eq!(q.select_sql(), "");
        assert!(matches!(
            q.try_select_sql(),
            Err(DbError::InvalidInput { .. })
        ));
    }

    #[tokio::test]
    async fn test_join_prefix_rules() {
        let r = registry();
        let sql = r
            .query("user")
            .alias("u")
            .inner_join("profile p", "p.user_id = u.id")
            .right_join(("log", "l"), "l.user_id = u.id")
            .full_join("tag", ["tag.user_id = u.id", "tag.k = u.k"])
            .select_sql();
        assert_eq!(
            sql,
            "SELECT * FROM `t_user` AS `u` \
             INNER JOIN `t_profile` AS `p` ON `p`.`user_id` = `u`.`id` \
             RIGHT JOIN `log` AS `l` ON `l`.`user_id` = `u`.`id` \
             FULL JOIN `t_tag` ON `tag`.`user_id` = `u`.`id` AND `tag`.`k` = `u`.`k`"
        );
    }

    #[tokio::test]
    async fn test_join_without_prefix_flag() {
        let r = registry();
        let sql = r
            .builder()
            .table("user", false)
            .inner_join("profile", "profile.user_id = user.id")
            .select_sql();
        assert_eq!(
            sql,
            "SELECT * FROM `user` INNER JOIN `profile` ON `profile`.`user_id` = `user`.`id`"
        );
    }

    #[tokio::test]
    async fn test_subquery_join() {
        let r = registry();
        let sub = r.query("order").field("user_id, sum(total) as spent").group("user_id");
        let sql = r
            .query("user")
            .alias("a")
            .inner_join((sub, "t2"), "a.id = t2.user_id")
            .select_sql();
        assert_eq!(
            sql,
            "SELECT * FROM `t_user` AS `a` INNER JOIN \
             (SELECT `user_id`, sum(total) AS `spent` FROM `t_order` GROUP BY `user_id`) AS `t2` \
             ON `a`.`id` = `t2`.`user_id`"
        );
    }

    #[tokio::test]
    async fn test_bad_join_condition_is_error() {
        let r = registry();
        let q = r.query("user").inner_join("x", "x.id");
        assert!(q.try_select_sql().is_err());
        let q = r.query("user").inner_join("x", Vec::<String>::new());
        assert!(q.try_select_sql().is_err());
    }

    #[tokio::test]
    async fn test_insert_ignore_null() {
        let r = registry();
        let row = Record::new().set("a", 1).set("b", Value::Null);
        assert_eq!(
            r.query("t").table("t", false).insert_sql(row.clone()),
            "INSERT INTO `t` (`a`) VALUES (1)"
        );
        assert_eq!(
            r.query("t").table("t", false).ignore_null(false).insert_sql(row),
            "INSERT INTO `t` (`a`, `b`) VALUES (1, NULL)"
        );
    }

    #[tokio::test]
    async fn test_insert_batch_uses_first_row_columns() {
        let r = registry();
        let rows = json!([
            {"name": "a", "age": 1},
            {"age": 2, "name": "b", "extra": true},
            {"name": "c"}
        ]);
        assert_eq!(
            r.query("user").insert_sql(rows),
            "INSERT INTO `t_user` (`name`, `age`) VALUES ('a', 1), ('b', 2), ('c', NULL)"
        );
    }

    #[tokio::test]
    async fn test_insert_without_columns_is_error() {
        let r = registry();
        let q = r.query("user");
        assert!(matches!(
            q.try_insert_sql(Record::new().set("a", Value::Null)),
            Err(DbError::InvalidInput { .. })
        ));
        assert_eq!(q.insert_sql(Vec::<Record>::new()), "");
    }

    #[tokio::test]
    async fn test_update_sql() {
        let r = registry();
        let sql = r
            .query("user")
            .where_eq("id", 7)
            .update_sql(Record::new().set("name", "x").set("nick", Value::Null));
        assert_eq!(sql, "UPDATE `t_user` SET `name` = 'x' WHERE `id` = 7");

        let sql = r
            .query("user")
            .where_eq("id", 7)
            .order("id")
            .limit(1, 0)
            .ignore_null(false)
            .update_sql(Record::new().set("nick", Value::Null));
        assert_eq!(
            sql,
            "UPDATE `t_user` SET `nick` = NULL WHERE `id` = 7 ORDER BY `id` ASC LIMIT 1"
        );
    }

    #[tokio::test]
    async fn test_update_and_delete_refused_without_where() {
        let r = registry();
        let q = r.query("user");
        assert!(matches!(
            q.try_update_sql(Record::new().set("a", 1)),
            Err(DbError::UnsafeStatement { .. })
        ));
        assert!(matches!(
            q.try_delete_sql(),
            Err(DbError::UnsafeStatement { .. })
        ));
        assert_eq!(
            q.where_raw("1 = 1").delete_sql(),
            "DELETE FROM `t_user` WHERE 1 = 1"
        );
    }

    #[tokio::test]
    async fn test_delete_with_join() {
        let r = registry();
        let sql = r
            .query("user")
            .alias("u")
            .inner_join("ban b", "b.user_id = u.id")
            .where_null("u.deleted_at")
            .delete_sql();
        assert_eq!(
            sql,
            "DELETE `u` FROM `t_user` AS `u` INNER JOIN `t_ban` AS `b` \
             ON `b`.`user_id` = `u`.`id` WHERE `u`.`deleted_at` IS NULL"
        );
        let q = r
            .query("user")
            .inner_join("ban", "ban.user_id = user.id")
            .where_eq("ban.kind", 1)
            .limit(5, 0);
        assert!(q.try_delete_sql().is_err());
    }

    #[tokio::test]
    async fn test_write_limit_offset_is_error() {
        let r = registry();
        let q = r.query("user").where_eq("id", 1).limit(1, 5);
        assert!(matches!(
            q.try_delete_sql(),
            Err(DbError::InvalidInput { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_pool_renders_empty() {
        let r = registry();
        let q = r.query_on("user", "nope");
        assert_eq!(q.select_sql(), "");
        assert!(matches!(
            q.try_select_sql(),
            Err(DbError::PoolNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_query_on_uses_pool_prefix() {
        let r = registry();
        assert_eq!(
            r.query_on("user", "plain").select_sql(),
            "SELECT * FROM `user`"
        );
        assert_eq!(r.query_on("user", "plain").pool_name(), Some("plain"));
    }

    #[tokio::test]
    async fn test_missing_table_is_error() {
        let r = registry();
        assert!(r.builder().try_select_sql().is_err());
    }

    #[tokio::test]
    async fn test_field_accepts_lists() {
        let r = registry();
        let a = r.query("user").field("id, name as n").select_sql();
        let b = r.query("user").field(["id", "name as n"]).select_sql();
        let c = r.query("user").field("id").field(vec!["name as n"]).select_sql();
        assert_eq!(a, "SELECT `id`, `name` AS `n` FROM `t_user`");
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[tokio::test]
    async fn test_aggregate_replaces_projection() {
        let r = registry();
        let q = r.query("user").field("id, name").limit(10, 30).where_eq("active", 1);
        assert_eq!(
            q.try_aggregate_sql(Aggregate::Count, "*").unwrap(),
            "SELECT COUNT(*) AS `count` FROM `t_user` WHERE `active` = 1 LIMIT 0, 1"
        );
        assert_eq!(
            q.try_aggregate_sql(Aggregate::Sum, "u.total").unwrap(),
            "SELECT SUM(`u`.`total`) AS `sum` FROM `t_user` WHERE `active` = 1 LIMIT 0, 1"
        );
        assert!(q.try_aggregate_sql(Aggregate::Max, " ").is_err());
    }

    /// Counts error-level events emitted by this crate.
    struct ErrorCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for ErrorCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            let meta = event.metadata();
            if *meta.level() == tracing::Level::ERROR && meta.target().starts_with("db_query") {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test]
    async fn test_driver_failure_logged_once() {
        let mut config = PoolConfig::new("down").with_master(true);
        config.host = "127.0.0.1".to_string();
        config.port = 1;
        config.connect_timeout = 300;
        config.wait_for_connections = false;
        let r = PoolRegistry::connect_lazy(vec![config]).unwrap();

        let errors = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(ErrorCounter(errors.clone()));
        let _guard = tracing::subscriber::set_default(subscriber);

        assert!(r.query("user").select().await.is_empty());
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        // render errors never reach the executor and are not errors
        assert_eq!(r.query_on("user", "nope").count("*").await, 0);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_json_to_u64() {
        assert_eq!(json_to_u64(&json!(5)), Some(5));
        assert_eq!(json_to_u64(&json!("12")), Some(12));
        assert_eq!(json_to_u64(&json!(-1)), None);
        assert_eq!(json_to_u64(&json!(null)), None);
    }

    #[test]
    fn test_insert_all_result_serializes_ids_only() {
        let result = InsertAllResult {
            succeeded_ids: vec![1, 2],
            failed_rows: vec![Record::new().set("a", 1)],
        };
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({"succeededIds": [1, 2]})
        );
    }
}
