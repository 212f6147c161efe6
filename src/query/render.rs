//! SQL rendering for builder state.
//!
//! Rendering is pure: given a builder and the pool it resolved to, each
//! statement kind is assembled from clause fragments joined by single spaces.
//! Identifiers go through `escape_id`, values through `escape_value`.

use crate::db::Pool;
use crate::error::{DbError, DbResult};
use crate::query::clause::{JoinTarget, Where};
use crate::query::escape::{escape_id, escape_id_unqualified, escape_value};
use crate::query::parse::{
    FieldExpr, parse_group_list, parse_join_pair, parse_order_list, parse_table_ref,
    split_top_level,
};
use crate::query::value::{Record, Value};
use crate::query::{Limit, Query};

/// One `SET` entry of an UPDATE.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Assignment {
    /// `` `column` = value ``
    Set(String, Value),
    /// `` `column` = `column` + amount `` (or `-`)
    Shift {
        column: String,
        amount: Value,
        negate: bool,
    },
}

/// Statement kinds the renderer knows.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Statement<'a> {
    Insert(&'a [Record]),
    Select,
    Update(&'a [Assignment]),
    Delete,
}

impl Query {
    /// Render `statement` against `pool`, whose prefix is used when the
    /// builder asks for it.
    pub(crate) fn render(&self, pool: &Pool, statement: Statement<'_>) -> DbResult<String> {
        if self.table.trim().is_empty() {
            return Err(DbError::invalid_input("no table set on the query"));
        }
        let prefix = if self.apply_prefix { pool.prefix() } else { "" };

        let parts = match statement {
            Statement::Insert(rows) => self.insert_parts(prefix, rows)?,
            Statement::Select => self.select_parts(prefix)?,
            Statement::Update(assignments) => self.update_parts(prefix, assignments)?,
            Statement::Delete => self.delete_parts(prefix)?,
        };
        Ok(parts.join(" "))
    }

    fn physical_table(&self, prefix: &str) -> String {
        escape_id(&format!("{}{}", prefix, self.table.trim()))
    }

    fn table_ref(&self, prefix: &str) -> String {
        let mut out = self.physical_table(prefix);
        if let Some(alias) = &self.alias {
            out.push_str(" AS ");
            out.push_str(&escape_id_unqualified(alias));
        }
        out
    }

    fn insert_parts(&self, prefix: &str, rows: &[Record]) -> DbResult<Vec<String>> {
        let first = rows
            .first()
            .ok_or_else(|| DbError::invalid_input("INSERT needs at least one row"))?;

        // The first row decides the column set for the whole batch
        let columns: Vec<&str> = first
            .iter()
            .filter(|(_, value)| !(self.ignore_null && value.is_null()))
            .map(|(column, _)| column)
            .collect();
        if columns.is_empty() {
            return Err(DbError::invalid_input(
                "INSERT needs at least one column after dropping NULL values",
            ));
        }
        if columns.iter().any(|c| c.trim().is_empty()) {
            return Err(DbError::invalid_input("INSERT column name cannot be empty"));
        }

        let values = rows
            .iter()
            .map(|row| {
                let row_values = columns
                    .iter()
                    .map(|column| row.get(column).map_or_else(|| "NULL".to_string(), escape_value))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("({row_values})")
            })
            .collect::<Vec<_>>()
            .join(", ");

        let column_list = columns
            .iter()
            .map(|c| escape_id_unqualified(c))
            .collect::<Vec<_>>()
            .join(", ");

        Ok(vec![
            "INSERT INTO".to_string(),
            self.physical_table(prefix),
            format!("({column_list})"),
            "VALUES".to_string(),
            values,
        ])
    }

    fn select_parts(&self, prefix: &str) -> DbResult<Vec<String>> {
        let mut parts = vec!["SELECT".to_string()];
        if self.distinct {
            parts.push("DISTINCT".to_string());
        }
        parts.push(self.render_fields()?);
        parts.push("FROM".to_string());
        parts.push(self.table_ref(prefix));
        parts.extend(self.render_joins(prefix)?);
        parts.extend(self.render_where()?);
        if let Some(group) = &self.group {
            parts.push(format!("GROUP BY {}", parse_group_list(group)?.join(", ")));
            if let Some(having) = self.having.as_deref().map(str::trim) {
                if !having.is_empty() {
                    parts.push(format!("HAVING {having}"));
                }
            }
        }
        parts.extend(self.render_order()?);
        if let Some(Limit { rows, offset }) = self.effective_limit() {
            parts.push(format!("LIMIT {offset}, {rows}"));
        }
        Ok(parts)
    }

    fn update_parts(&self, prefix: &str, assignments: &[Assignment]) -> DbResult<Vec<String>> {
        if assignments.is_empty() {
            return Err(DbError::invalid_input("UPDATE needs at least one column to set"));
        }
        let where_clause = self.require_where("UPDATE")?;

        let set = assignments
            .iter()
            .map(render_assignment)
            .collect::<DbResult<Vec<_>>>()?
            .join(", ");

        let mut parts = vec!["UPDATE".to_string(), self.table_ref(prefix)];
        parts.extend(self.render_joins(prefix)?);
        parts.push(format!("SET {set}"));
        parts.push(where_clause);
        parts.extend(self.single_table_tail("UPDATE")?);
        Ok(parts)
    }

    fn delete_parts(&self, prefix: &str) -> DbResult<Vec<String>> {
        let where_clause = self.require_where("DELETE")?;

        let mut parts = vec!["DELETE".to_string()];
        if self.joins.is_empty() && self.alias.is_none() {
            parts.push("FROM".to_string());
            parts.push(self.physical_table(prefix));
        } else {
            // Multi-table form names the table rows are deleted from
            let target = match &self.alias {
                Some(alias) => escape_id_unqualified(alias),
                None => self.physical_table(prefix),
            };
            parts.push(target);
            parts.push("FROM".to_string());
            parts.push(self.table_ref(prefix));
            parts.extend(self.render_joins(prefix)?);
        }
        parts.push(where_clause);
        parts.extend(self.single_table_tail("DELETE")?);
        Ok(parts)
    }

    fn require_where(&self, operation: &str) -> DbResult<String> {
        match self.render_where()? {
            Some(clause) => Ok(clause),
            None => Err(DbError::unsafe_statement(
                operation,
                "Add a WHERE condition; use where_raw(\"1 = 1\") to target every row",
            )),
        }
    }

    /// ORDER BY / LIMIT for UPDATE and DELETE. MySQL only accepts them on
    /// single-table statements, and LIMIT without an offset.
    fn single_table_tail(&self, operation: &str) -> DbResult<Vec<String>> {
        let mut parts = Vec::new();
        let limit = self.effective_limit();
        if self.order.is_none() && limit.is_none() {
            return Ok(parts);
        }
        if !self.joins.is_empty() {
            return Err(DbError::invalid_input(format!(
                "{operation} with joins cannot use ORDER BY or LIMIT"
            )));
        }
        parts.extend(self.render_order()?);
        if let Some(Limit { rows, offset }) = limit {
            if offset > 0 {
                return Err(DbError::invalid_input(format!(
                    "{operation} cannot use a LIMIT offset"
                )));
            }
            parts.push(format!("LIMIT {rows}"));
        }
        Ok(parts)
    }

    fn render_fields(&self) -> DbResult<String> {
        if self.fields.is_empty() {
            return Ok("*".to_string());
        }
        let rendered = self
            .fields
            .iter()
            .map(|f| FieldExpr::parse(f).map(|expr| expr.render()))
            .collect::<DbResult<Vec<_>>>()?;
        Ok(rendered.join(", "))
    }

    fn render_joins(&self, prefix: &str) -> DbResult<Vec<String>> {
        self.joins
            .iter()
            .map(|join| {
                let target = match &join.target {
                    JoinTarget::Bare(spec) => {
                        let (name, alias) = parse_table_ref(spec)?;
                        let mut out = escape_id(&format!("{prefix}{name}"));
                        if let Some(alias) = alias {
                            out.push_str(" AS ");
                            out.push_str(&escape_id_unqualified(&alias));
                        }
                        out
                    }
                    JoinTarget::Named { table, alias } => {
                        if table.trim().is_empty() || alias.trim().is_empty() {
                            return Err(DbError::invalid_input(
                                "join table and alias cannot be empty",
                            ));
                        }
                        format!(
                            "{} AS {}",
                            escape_id(table.trim()),
                            escape_id_unqualified(alias.trim())
                        )
                    }
                    JoinTarget::Subquery { query, alias } => {
                        if alias.trim().is_empty() {
                            return Err(DbError::invalid_input("subquery join needs an alias"));
                        }
                        let (_, sql) = query.prepare(Statement::Select)?;
                        format!("({}) AS {}", sql, escape_id_unqualified(alias.trim()))
                    }
                };

                let pairs = join
                    .on
                    .0
                    .iter()
                    .flat_map(|s| split_top_level(s, ','))
                    .map(|pair| parse_join_pair(&pair))
                    .collect::<DbResult<Vec<_>>>()?;
                if pairs.is_empty() {
                    return Err(DbError::invalid_input("join needs at least one condition"));
                }

                Ok(format!(
                    "{} {} ON {}",
                    join.kind.as_sql(),
                    target,
                    pairs.join(" AND ")
                ))
            })
            .collect()
    }

    fn render_where(&self) -> DbResult<Option<String>> {
        if self.wheres.is_empty() {
            return Ok(None);
        }
        let wrap_raw = self.wheres.len() > 1;
        let conditions = self
            .wheres
            .iter()
            .map(|w| {
                let rendered = w.render()?;
                Ok(match w {
                    Where::Raw(_) if wrap_raw => format!("({rendered})"),
                    _ => rendered,
                })
            })
            .collect::<DbResult<Vec<_>>>()?;
        Ok(Some(format!("WHERE {}", conditions.join(" AND "))))
    }

    fn render_order(&self) -> DbResult<Option<String>> {
        match &self.order {
            None => Ok(None),
            Some(order) => {
                let items = parse_order_list(order)?;
                let rendered = items.iter().map(|i| i.render()).collect::<Vec<_>>();
                Ok(Some(format!("ORDER BY {}", rendered.join(", "))))
            }
        }
    }
}

fn render_assignment(assignment: &Assignment) -> DbResult<String> {
    match assignment {
        Assignment::Set(column, value) => {
            if column.trim().is_empty() {
                return Err(DbError::invalid_input("UPDATE column name cannot be empty"));
            }
            Ok(format!("{} = {}", escape_id(column.trim()), escape_value(value)))
        }
        Assignment::Shift {
            column,
            amount,
            negate,
        } => {
            if column.trim().is_empty() {
                return Err(DbError::invalid_input("UPDATE column name cannot be empty"));
            }
            if !matches!(amount, Value::Int(_) | Value::UInt(_) | Value::Float(_)) {
                return Err(DbError::invalid_input(format!(
                    "increment of '{}' must be numeric, got {}",
                    column,
                    amount.type_name()
                )));
            }
            let column = escape_id(column.trim());
            let sign = if *negate { '-' } else { '+' };
            Ok(format!("{column} = {column} {sign} {}", escape_value(amount)))
        }
    }
}
