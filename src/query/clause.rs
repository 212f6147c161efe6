//! Clause types held by the builder: filters, operators and joins.

use crate::error::{DbError, DbResult};
use crate::query::Query;
use crate::query::escape::{escape_id, escape_value, escape_values};
use crate::query::value::Value;

/// Comparison operator of a `(field, operator, value)` filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
    NotLike,
    In,
    NotIn,
    Is,
    IsNot,
    Between,
    NotBetween,
    /// Any other comparison operator, already validated and upper-cased.
    Other(String),
}

impl Operator {
    /// Comparisons accepted beyond the named variants.
    pub const EXTRA_OPERATORS: &'static [&'static str] = &[
        "<=>",
        "REGEXP",
        "NOT REGEXP",
        "RLIKE",
        "NOT RLIKE",
        "SOUNDS LIKE",
    ];

    /// Parse an operator token. Keywords are case-insensitive and inner
    /// whitespace is normalised (`"not   in"` → `NOT IN`).
    ///
    /// Anything else must be one of [`Operator::EXTRA_OPERATORS`]; boolean
    /// connectives and set operators never pass.
    pub fn parse(token: &str) -> DbResult<Self> {
        let normalized = token
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_uppercase();
        let op = match normalized.as_str() {
            "=" => Self::Eq,
            "<>" | "!=" => Self::Ne,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "<" => Self::Lt,
            "<=" => Self::Le,
            "LIKE" => Self::Like,
            "NOT LIKE" => Self::NotLike,
            "IN" => Self::In,
            "NOT IN" => Self::NotIn,
            "IS" => Self::Is,
            "IS NOT" => Self::IsNot,
            "BETWEEN" => Self::Between,
            "NOT BETWEEN" => Self::NotBetween,
            "" => return Err(DbError::invalid_input("operator cannot be empty")),
            other => {
                if !Self::EXTRA_OPERATORS.contains(&other) {
                    return Err(DbError::invalid_input(format!(
                        "unsupported operator '{}'",
                        token.trim()
                    )));
                }
                Self::Other(other.to_string())
            }
        };
        Ok(op)
    }

    pub fn as_sql(&self) -> &str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Like => "LIKE",
            Self::NotLike => "NOT LIKE",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
            Self::Is => "IS",
            Self::IsNot => "IS NOT",
            Self::Between => "BETWEEN",
            Self::NotBetween => "NOT BETWEEN",
            Self::Other(op) => op,
        }
    }

    fn is_list(&self) -> bool {
        matches!(self, Self::In | Self::NotIn)
    }

    fn is_range(&self) -> bool {
        matches!(self, Self::Between | Self::NotBetween)
    }
}

/// Right-hand side of a filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Single(Value),
    Many(Vec<Value>),
}

impl<T: Into<Value>> From<T> for Operand {
    fn from(v: T) -> Self {
        Operand::Single(v.into())
    }
}

/// Wrap any list of values as a multi-value operand, for `IN` / `BETWEEN`.
pub fn values<I, T>(items: I) -> Operand
where
    I: IntoIterator<Item = T>,
    T: Into<Value>,
{
    Operand::Many(items.into_iter().map(Into::into).collect())
}

/// One WHERE entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Where {
    /// Raw boolean expression, rendered verbatim.
    Raw(String),
    /// `field op operand`. The operator is kept as text and checked at
    /// render time so bad input surfaces as an error there.
    Cond {
        field: String,
        op: String,
        operand: Operand,
    },
}

impl Where {
    pub fn raw(expr: impl Into<String>) -> Self {
        Self::Raw(expr.into())
    }

    pub fn cond(field: impl Into<String>, op: impl Into<String>, operand: impl Into<Operand>) -> Self {
        Self::Cond {
            field: field.into(),
            op: op.into(),
            operand: operand.into(),
        }
    }

    pub fn render(&self) -> DbResult<String> {
        match self {
            Where::Raw(expr) => {
                let expr = expr.trim();
                if expr.is_empty() {
                    return Err(DbError::invalid_input("raw WHERE expression is empty"));
                }
                Ok(expr.to_string())
            }
            Where::Cond { field, op, operand } => {
                let field = field.trim();
                if field.is_empty() {
                    return Err(DbError::invalid_input("WHERE field cannot be empty"));
                }
                let op = Operator::parse(op)?;
                let lhs = escape_id(field);

                if op.is_list() {
                    let items: &[Value] = match operand {
                        Operand::Many(items) => items,
                        Operand::Single(v) => std::slice::from_ref(v),
                    };
                    if items.is_empty() {
                        // Empty lists are not valid SQL; keep the logical meaning.
                        let constant = if op == Operator::In { "0 = 1" } else { "1 = 1" };
                        return Ok(constant.to_string());
                    }
                    return Ok(format!("{} {} ({})", lhs, op.as_sql(), escape_values(items, ", ")));
                }

                if op.is_range() {
                    return match operand {
                        Operand::Many(items) if items.len() == 2 => Ok(format!(
                            "{} {} {} AND {}",
                            lhs,
                            op.as_sql(),
                            escape_value(&items[0]),
                            escape_value(&items[1])
                        )),
                        _ => Err(DbError::invalid_input(format!(
                            "{} on '{}' needs exactly two values",
                            op.as_sql(),
                            field
                        ))),
                    };
                }

                match operand {
                    Operand::Single(v) => Ok(format!("{} {} {}", lhs, op.as_sql(), escape_value(v))),
                    Operand::Many(_) => Err(DbError::invalid_input(format!(
                        "operator {} on '{}' takes a single value",
                        op.as_sql(),
                        field
                    ))),
                }
            }
        }
    }
}

/// A string is a raw expression.
impl From<&str> for Where {
    fn from(expr: &str) -> Self {
        Where::raw(expr)
    }
}

impl From<String> for Where {
    fn from(expr: String) -> Self {
        Where::Raw(expr)
    }
}

/// A pair is an equality.
impl<F: Into<String>, V: Into<Operand>> From<(F, V)> for Where {
    fn from((field, value): (F, V)) -> Self {
        Where::cond(field, "=", value)
    }
}

/// A triple carries its own operator.
impl<F: Into<String>, O: Into<String>, V: Into<Operand>> From<(F, O, V)> for Where {
    fn from((field, op, value): (F, O, V)) -> Self {
        Where::cond(field, op, value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinKind {
    #[default]
    Inner,
    Left,
    Right,
    Full,
}

impl JoinKind {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Inner => "INNER JOIN",
            Self::Left => "LEFT JOIN",
            Self::Right => "RIGHT JOIN",
            Self::Full => "FULL JOIN",
        }
    }
}

/// What a join attaches.
#[derive(Debug, Clone)]
pub enum JoinTarget {
    /// `"name"` or `"name alias"`; receives the pool prefix when the builder
    /// applies one.
    Bare(String),
    /// Explicit `(name, alias)`; used as given.
    Named { table: String, alias: String },
    /// Derived table from another builder.
    Subquery { query: Box<Query>, alias: String },
}

impl From<&str> for JoinTarget {
    fn from(s: &str) -> Self {
        JoinTarget::Bare(s.to_string())
    }
}

impl From<String> for JoinTarget {
    fn from(s: String) -> Self {
        JoinTarget::Bare(s)
    }
}

impl From<(&str, &str)> for JoinTarget {
    fn from((table, alias): (&str, &str)) -> Self {
        JoinTarget::Named {
            table: table.to_string(),
            alias: alias.to_string(),
        }
    }
}

impl From<(Query, &str)> for JoinTarget {
    fn from((query, alias): (Query, &str)) -> Self {
        JoinTarget::Subquery {
            query: Box::new(query),
            alias: alias.to_string(),
        }
    }
}

impl From<(&Query, &str)> for JoinTarget {
    fn from((query, alias): (&Query, &str)) -> Self {
        (query.clone(), alias).into()
    }
}

/// Equality pairs of a join, ANDed. A single string may hold several pairs
/// separated by commas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOn(pub Vec<String>);

impl From<&str> for JoinOn {
    fn from(s: &str) -> Self {
        JoinOn(vec![s.to_string()])
    }
}

impl From<String> for JoinOn {
    fn from(s: String) -> Self {
        JoinOn(vec![s])
    }
}

impl From<&[&str]> for JoinOn {
    fn from(items: &[&str]) -> Self {
        JoinOn(items.iter().map(|s| s.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for JoinOn {
    fn from(items: [&str; N]) -> Self {
        JoinOn(items.iter().map(|s| s.to_string()).collect())
    }
}

impl From<Vec<&str>> for JoinOn {
    fn from(items: Vec<&str>) -> Self {
        JoinOn(items.into_iter().map(String::from).collect())
    }
}

impl From<Vec<String>> for JoinOn {
    fn from(items: Vec<String>) -> Self {
        JoinOn(items)
    }
}

#[derive(Debug, Clone)]
pub struct Join {
    pub target: JoinTarget,
    pub on: JoinOn,
    pub kind: JoinKind,
}
