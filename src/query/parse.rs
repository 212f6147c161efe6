//! Parsers for the small string DSLs the builder accepts.
//!
//! Grammar, informally:
//!
//! ```text
//! list       := item ("," item)*          -- commas inside (), quotes are not separators
//! field      := expr [ws "as" ws alias]   -- expr containing "(" is raw SQL
//! order      := expr [ws ("asc"|"desc")]  -- any other trailing word belongs to expr
//! group      := expr
//! join table := name [ws ["as" ws] alias]
//! join cond  := path "=" path
//! ```
//!
//! Every parser rejects empty items instead of rendering something odd.

use crate::error::{DbError, DbResult};
use crate::query::escape::{escape_id, escape_id_unqualified};

/// Split on `sep` outside parentheses and quoted sections. Items are trimmed.
pub fn split_top_level(s: &str, sep: char) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for c in s.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                current.push(c);
            }
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    current.push(c);
                }
                '(' => {
                    depth += 1;
                    current.push(c);
                }
                ')' => {
                    depth = depth.saturating_sub(1);
                    current.push(c);
                }
                c if c == sep && depth == 0 => {
                    items.push(current.trim().to_string());
                    current.clear();
                }
                c => current.push(c),
            },
        }
    }
    items.push(current.trim().to_string());
    items
}

/// Byte offset of the last top-level, case-insensitive ` as ` in `s`.
fn find_alias_keyword(s: &str) -> Option<usize> {
    let lower = s.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut found = None;

    for (i, &b) in bytes.iter().enumerate() {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'\'' | b'"' | b'`' => quote = Some(b),
                b'(' => depth += 1,
                b')' => depth = depth.saturating_sub(1),
                b if b.is_ascii_whitespace()
                    && depth == 0
                    && bytes.len() > i + 3
                    && &bytes[i + 1..i + 3] == b"as"
                    && bytes[i + 3].is_ascii_whitespace() =>
                {
                    found = Some(i);
                }
                _ => {}
            },
        }
    }
    found
}

fn is_raw_expression(s: &str) -> bool {
    s.contains('(')
}

fn quote_expr(expr: &str) -> String {
    if is_raw_expression(expr) {
        expr.to_string()
    } else {
        escape_id(expr)
    }
}

/// A projected field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldExpr {
    pub expr: String,
    pub alias: Option<String>,
}

impl FieldExpr {
    pub fn parse(item: &str) -> DbResult<Self> {
        let item = item.trim();
        if item.is_empty() {
            return Err(DbError::invalid_input("empty entry in field list"));
        }
        let (expr, alias) = match find_alias_keyword(item) {
            Some(pos) => {
                let expr = item[..pos].trim();
                let alias = item[pos + 3..].trim();
                if expr.is_empty() || alias.is_empty() {
                    return Err(DbError::invalid_input(format!(
                        "field '{item}' needs both an expression and an alias around 'as'"
                    )));
                }
                (expr, Some(alias.to_string()))
            }
            None => (item, None),
        };
        Ok(Self {
            expr: expr.to_string(),
            alias,
        })
    }

    pub fn render(&self) -> String {
        let mut out = quote_expr(&self.expr);
        if let Some(alias) = &self.alias {
            out.push_str(" AS ");
            out.push_str(&escape_id_unqualified(alias));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    fn from_token(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("asc") {
            Some(Self::Asc)
        } else if token.eq_ignore_ascii_case("desc") {
            Some(Self::Desc)
        } else {
            None
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// One `ORDER BY` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderItem {
    pub expr: String,
    pub direction: Direction,
}

impl OrderItem {
    pub fn parse(item: &str) -> DbResult<Self> {
        let item = item.trim();
        if item.is_empty() {
            return Err(DbError::invalid_input("empty entry in order list"));
        }
        if let Some((head, last)) = item.rsplit_once(char::is_whitespace) {
            if let Some(direction) = Direction::from_token(last) {
                let head = head.trim();
                if !head.is_empty() {
                    return Ok(Self {
                        expr: head.to_string(),
                        direction,
                    });
                }
            }
        }
        Ok(Self {
            expr: item.to_string(),
            direction: Direction::Asc,
        })
    }

    pub fn render(&self) -> String {
        format!("{} {}", quote_expr(&self.expr), self.direction.as_sql())
    }
}

/// Parse a comma-separated order expression.
pub fn parse_order_list(expr: &str) -> DbResult<Vec<OrderItem>> {
    split_top_level(expr, ',')
        .iter()
        .map(|item| OrderItem::parse(item))
        .collect()
}

/// Parse a comma-separated group expression into rendered entries.
pub fn parse_group_list(expr: &str) -> DbResult<Vec<String>> {
    split_top_level(expr, ',')
        .iter()
        .map(|item| {
            if item.is_empty() {
                Err(DbError::invalid_input("empty entry in group list"))
            } else {
                Ok(quote_expr(item))
            }
        })
        .collect()
}

/// Parse a bare join target: `name`, `name alias` or `name AS alias`.
pub fn parse_table_ref(s: &str) -> DbResult<(String, Option<String>)> {
    let tokens: Vec<&str> = s.split_whitespace().collect();
    match tokens.as_slice() {
        [name] => Ok((name.to_string(), None)),
        [name, alias] => Ok((name.to_string(), Some(alias.to_string()))),
        [name, kw, alias] if kw.eq_ignore_ascii_case("as") => {
            Ok((name.to_string(), Some(alias.to_string())))
        }
        _ => Err(DbError::invalid_input(format!(
            "join table '{s}' must be 'name' or 'name alias'"
        ))),
    }
}

fn is_identifier_path(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| !c.is_whitespace() && !"<>!=()'\";,".contains(c))
}

/// Parse one `left = right` join pair and render it with quoted identifiers.
pub fn parse_join_pair(s: &str) -> DbResult<String> {
    let invalid = || {
        DbError::invalid_input(format!(
            "join condition '{}' must have the form 'left = right'",
            s.trim()
        ))
    };
    let (left, right) = s.split_once('=').ok_or_else(invalid)?;
    let (left, right) = (left.trim(), right.trim());
    if !is_identifier_path(left) || !is_identifier_path(right) {
        return Err(invalid());
    }
    Ok(format!("{} = {}", escape_id(left), escape_id(right)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_top_level_respects_parens_and_quotes() {
        assert_eq!(split_top_level("a, b ,c", ','), vec!["a", "b", "c"]);
        assert_eq!(
            split_top_level("IFNULL(a, 0) as x, b", ','),
            vec!["IFNULL(a, 0) as x", "b"]
        );
        assert_eq!(split_top_level("'a,b', c", ','), vec!["'a,b'", "c"]);
        assert_eq!(split_top_level("a,,b", ','), vec!["a", "", "b"]);
    }

    #[test]
    fn test_field_plain_and_alias() {
        assert_eq!(FieldExpr::parse("id").unwrap().render(), "`id`");
        assert_eq!(FieldExpr::parse("t.key as k").unwrap().render(), "`t`.`key` AS `k`");
        assert_eq!(FieldExpr::parse("t.key AS k").unwrap().render(), "`t`.`key` AS `k`");
    }

    #[test]
    fn test_field_raw_function() {
        assert_eq!(
            FieldExpr::parse("count(*) as c").unwrap().render(),
            "count(*) AS `c`"
        );
        assert_eq!(FieldExpr::parse("NOW()").unwrap().render(), "NOW()");
        // "as" inside the call is not the alias keyword
        assert_eq!(
            FieldExpr::parse("CAST(x as CHAR) as s").unwrap().render(),
            "CAST(x as CHAR) AS `s`"
        );
    }

    #[test]
    fn test_field_star() {
        assert_eq!(FieldExpr::parse("*").unwrap().render(), "*");
        assert_eq!(FieldExpr::parse("t.*").unwrap().render(), "`t`.*");
    }

    #[test]
    fn test_field_rejects_empty_and_tolerates_spacing() {
        assert!(FieldExpr::parse("  ").is_err());
        assert_eq!(FieldExpr::parse("x  as   y").unwrap().render(), "`x` AS `y`");
    }

    #[test]
    fn test_order_defaults_to_asc() {
        let items = parse_order_list("name").unwrap();
        assert_eq!(items[0].render(), "`name` ASC");
    }

    #[test]
    fn test_order_directions_case_insensitive() {
        let rendered: Vec<_> = parse_order_list("name desc, id, age ASC")
            .unwrap()
            .iter()
            .map(OrderItem::render)
            .collect();
        assert_eq!(rendered, vec!["`name` DESC", "`id` ASC", "`age` ASC"]);
    }

    #[test]
    fn test_order_unknown_direction_is_part_of_field() {
        let items = parse_order_list("name sideways").unwrap();
        assert_eq!(items[0].render(), "`name sideways` ASC");
    }

    #[test]
    fn test_order_lone_keyword_is_a_field() {
        let items = parse_order_list("desc").unwrap();
        assert_eq!(items[0].render(), "`desc` ASC");
    }

    #[test]
    fn test_order_rejects_empty_items() {
        assert!(parse_order_list("a,,b").is_err());
        assert!(parse_order_list("a,").is_err());
        assert!(parse_order_list("").is_err());
    }

    #[test]
    fn test_group_list() {
        assert_eq!(parse_group_list("name, t.age").unwrap(), vec!["`name`", "`t`.`age`"]);
        assert!(parse_group_list("name,").is_err());
    }

    #[test]
    fn test_table_ref() {
        assert_eq!(parse_table_ref("user").unwrap(), ("user".to_string(), None));
        assert_eq!(
            parse_table_ref("user u").unwrap(),
            ("user".to_string(), Some("u".to_string()))
        );
        assert_eq!(
            parse_table_ref("user AS u").unwrap(),
            ("user".to_string(), Some("u".to_string()))
        );
        assert!(parse_table_ref("").is_err());
        assert!(parse_table_ref("a b c d").is_err());
    }

    #[test]
    fn test_join_pair() {
        assert_eq!(parse_join_pair("a.id = t2.id").unwrap(), "`a`.`id` = `t2`.`id`");
        assert_eq!(parse_join_pair("a.id=t2.id").unwrap(), "`a`.`id` = `t2`.`id`");
        assert!(parse_join_pair("a.id").is_err());
        assert!(parse_join_pair("a.id = ").is_err());
        assert!(parse_join_pair("a.id >= b.id").is_err());
        assert!(parse_join_pair("a.id = 1; DROP TABLE x").is_err());
    }
}
