//! Column-match router expressions.
//!
//! An expression is a list of clauses, any of which selects a node:
//!
//! ```text
//! STORE_ID=:EXTERNAL_ID
//! REGION = 'east' or OLD_REGION = 'east'
//! STATUS=NULL
//! TAGS contains :NODE_ID
//! ```

use crate::bail;
use crate::error::{ErrorKind, SyncResult};
use crate::types::{Node, RowImage};

/// One side of a comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchValue {
    Literal(String),
    Null,
    NotNull,
    NodeId,
    ExternalId,
    NodeGroupId,
    /// Value of another column of the same row image.
    Column(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
}

/// Reference to a column of the new image, or of the old image when written `OLD_<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub name: String,
    pub old: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchClause {
    pub column: ColumnRef,
    pub operator: MatchOperator,
    pub values: Vec<MatchValue>,
}

/// Parsed column-match expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMatchExpression {
    clauses: Vec<MatchClause>,
}

/// Row images a clause is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct MatchImages<'a> {
    /// Image addressed by plain column names.
    pub current: &'a RowImage,
    /// Image addressed by `OLD_` column names.
    pub old: Option<&'a RowImage>,
}

impl ColumnMatchExpression {
    pub fn parse(expression: &str) -> SyncResult<Self> {
        let mut clauses = Vec::new();
        for clause in split_clauses(expression) {
            let clause = clause.trim();
            if clause.is_empty() {
                continue;
            }
            clauses.push(parse_clause(clause)?);
        }

        if clauses.is_empty() {
            bail!(
                ErrorKind::InvalidRouterExpression,
                "Column-match expression has no clause",
                format!("expression `{expression}` is empty")
            );
        }

        Ok(Self { clauses })
    }

    pub fn clauses(&self) -> &[MatchClause] {
        &self.clauses
    }

    /// Returns `true` when any clause selects `node` for the given images.
    pub fn matches(&self, node: &Node, images: MatchImages<'_>) -> bool {
        self.clauses
            .iter()
            .any(|clause| clause_matches(clause, node, images))
    }

    /// Returns `true` when some clause addresses a plain column, so evaluating the old image
    /// under plain names can change the outcome.
    pub fn reads_current_columns(&self) -> bool {
        self.clauses.iter().any(|clause| !clause.column.old)
    }
}

fn clause_matches(clause: &MatchClause, node: &Node, images: MatchImages<'_>) -> bool {
    let image = if clause.column.old {
        match images.old {
            Some(old) => old,
            None => return false,
        }
    } else {
        images.current
    };

    let Some(value) = image.get(&clause.column.name) else {
        return false;
    };

    match clause.operator {
        MatchOperator::Equals => equals_any(value, &clause.values, node, image),
        MatchOperator::NotEquals => !equals_any(value, &clause.values, node, image),
        MatchOperator::Contains => contains_any(value, &clause.values, node, image),
        MatchOperator::NotContains => !contains_any(value, &clause.values, node, image),
    }
}

fn equals_any(value: Option<&str>, expected: &[MatchValue], node: &Node, image: &RowImage) -> bool {
    expected.iter().any(|expected| match expected {
        MatchValue::Null => value.is_none(),
        MatchValue::NotNull => value.is_some(),
        other => value.is_some() && value == resolve(other, node, image),
    })
}

/// Treats the column as a comma separated list.
fn contains_any(value: Option<&str>, expected: &[MatchValue], node: &Node, image: &RowImage) -> bool {
    let Some(value) = value else {
        return false;
    };

    expected.iter().any(|expected| {
        resolve(expected, node, image)
            .is_some_and(|expected| value.split(',').any(|item| item.trim() == expected))
    })
}

fn resolve<'a>(value: &'a MatchValue, node: &'a Node, image: &'a RowImage) -> Option<&'a str> {
    match value {
        MatchValue::Literal(literal) => Some(literal.as_str()),
        MatchValue::NodeId => Some(node.node_id.as_str()),
        MatchValue::ExternalId => Some(node.external_id.as_str()),
        MatchValue::NodeGroupId => Some(node.node_group_id.as_str()),
        MatchValue::Column(column) => image.get(column).flatten(),
        MatchValue::Null | MatchValue::NotNull => None,
    }
}

/// Splits on newlines and on ` or ` outside quotes, ignoring case.
fn split_clauses(expression: &str) -> Vec<&str> {
    let bytes = expression.as_bytes();
    let mut clauses = Vec::new();
    let mut in_quote = false;
    let mut clause_start = 0;
    let mut index = 0;

    while index < bytes.len() {
        let byte = bytes[index];
        if byte == b'\'' {
            in_quote = !in_quote;
        } else if !in_quote && (byte == b'\n' || byte == b'\r') {
            clauses.push(&expression[clause_start..index]);
            clause_start = index + 1;
        } else if !in_quote
            && index + 4 <= bytes.len()
            && bytes[index..index + 4].eq_ignore_ascii_case(b" or ")
        {
            clauses.push(&expression[clause_start..index]);
            index += 4;
            clause_start = index;
            continue;
        }
        index += 1;
    }
    clauses.push(&expression[clause_start..]);

    clauses
}

fn is_column_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

fn parse_clause(clause: &str) -> SyncResult<MatchClause> {
    let name_end = clause
        .find(|c: char| !is_column_char(c))
        .unwrap_or(clause.len());
    let name = &clause[..name_end];
    if name.is_empty() {
        bail!(
            ErrorKind::InvalidRouterExpression,
            "Column-match clause does not start with a column",
            format!("clause `{clause}`")
        );
    }

    let column = match strip_prefix_ignore_case(name, "OLD_") {
        Some(stripped) if !stripped.is_empty() => ColumnRef {
            name: stripped.to_string(),
            old: true,
        },
        _ => ColumnRef {
            name: name.to_string(),
            old: false,
        },
    };

    let rest = clause[name_end..].trim_start();
    if rest.is_empty() {
        return Ok(MatchClause {
            column,
            operator: MatchOperator::Equals,
            values: vec![MatchValue::NodeId],
        });
    }

    let (operator, operand) = if let Some(operand) = rest.strip_prefix("!=") {
        (MatchOperator::NotEquals, operand)
    } else if let Some(operand) = rest.strip_prefix('=') {
        (MatchOperator::Equals, operand)
    } else if let Some(operand) = strip_keyword(rest, "not contains") {
        (MatchOperator::NotContains, operand)
    } else if let Some(operand) = strip_keyword(rest, "contains") {
        (MatchOperator::Contains, operand)
    } else {
        bail!(
            ErrorKind::InvalidRouterExpression,
            "Column-match clause has an unknown operator",
            format!("clause `{clause}`")
        );
    };

    let values = match operator {
        MatchOperator::Equals | MatchOperator::NotEquals => vec![parse_value(operand, clause)?],
        MatchOperator::Contains | MatchOperator::NotContains => split_outside_quotes(operand, b',')
            .into_iter()
            .map(|value| parse_value(value, clause))
            .collect::<SyncResult<Vec<_>>>()?,
    };

    Ok(MatchClause {
        column,
        operator,
        values,
    })
}

fn parse_value(raw: &str, clause: &str) -> SyncResult<MatchValue> {
    let raw = raw.trim();
    if raw.is_empty() {
        bail!(
            ErrorKind::InvalidRouterExpression,
            "Column-match clause has no value",
            format!("clause `{clause}`")
        );
    }

    if let Some(quoted) = raw.strip_prefix('\'') {
        let Some(inner) = quoted.strip_suffix('\'') else {
            bail!(
                ErrorKind::InvalidRouterExpression,
                "Column-match value has an unterminated quote",
                format!("clause `{clause}`")
            );
        };
        return Ok(MatchValue::Literal(inner.replace("''", "'")));
    }

    if raw.eq_ignore_ascii_case("NULL") {
        return Ok(MatchValue::Null);
    }
    if let Some(rest) = strip_prefix_ignore_case(raw, "NOT")
        && rest.trim().eq_ignore_ascii_case("NULL")
    {
        return Ok(MatchValue::NotNull);
    }

    if let Some(variable) = raw.strip_prefix(':') {
        let value = match variable.to_ascii_uppercase().as_str() {
            "NODE_ID" => MatchValue::NodeId,
            "EXTERNAL_ID" => MatchValue::ExternalId,
            "NODE_GROUP_ID" => MatchValue::NodeGroupId,
            _ if !variable.is_empty() && variable.chars().all(is_column_char) => {
                MatchValue::Column(variable.to_string())
            }
            _ => bail!(
                ErrorKind::InvalidRouterExpression,
                "Column-match value references an invalid variable",
                format!("clause `{clause}`")
            ),
        };
        return Ok(value);
    }

    Ok(MatchValue::Literal(raw.to_string()))
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &value[prefix.len()..])
}

/// Strips a keyword that must be followed by whitespace.
fn strip_keyword<'a>(value: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = strip_prefix_ignore_case(value, keyword)?;
    rest.starts_with(char::is_whitespace).then_some(rest)
}

fn split_outside_quotes(value: &str, separator: u8) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quote = false;
    let mut start = 0;
    for (index, byte) in value.bytes().enumerate() {
        if byte == b'\'' {
            in_quote = !in_quote;
        } else if byte == separator && !in_quote {
            parts.push(&value[start..index]);
            start = index + 1;
        }
    }
    parts.push(&value[start..]);

    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, external_id: &str) -> Node {
        Node::new(id, "store", external_id)
    }

    fn images(current: &RowImage) -> MatchImages<'_> {
        MatchImages { current, old: None }
    }

    #[test]
    fn bare_column_matches_node_id() {
        let expression = ColumnMatchExpression::parse("STORE_ID").unwrap();
        let row = RowImage::new().with("store_id", Some("n1"));

        assert!(expression.matches(&node("n1", "x"), images(&row)));
        assert!(!expression.matches(&node("n2", "y"), images(&row)));
    }

    #[test]
    fn clauses_are_alternatives() {
        let expression =
            ColumnMatchExpression::parse("REGION='east' OR STORE_ID=:EXTERNAL_ID\nKIND = all")
                .unwrap();
        assert_eq!(expression.clauses().len(), 3);

        let east = RowImage::new().with("region", Some("east")).with("kind", None);
        let external = RowImage::new().with("region", Some("west")).with("store_id", Some("s-2"));
        let all = RowImage::new().with("kind", Some("all"));

        assert!(expression.matches(&node("n1", "s-1"), images(&east)));
        assert!(expression.matches(&node("n2", "s-2"), images(&external)));
        assert!(!expression.matches(&node("n1", "s-1"), images(&external)));
        assert!(expression.matches(&node("n1", "s-1"), images(&all)));
    }

    #[test]
    fn null_values_match_null_columns() {
        let null = ColumnMatchExpression::parse("CLOSED_AT=NULL").unwrap();
        let not_null = ColumnMatchExpression::parse("CLOSED_AT = not null").unwrap();
        let open = RowImage::new().with("closed_at", None);
        let closed = RowImage::new().with("closed_at", Some("2026-01-01"));

        assert!(null.matches(&node("n1", "x"), images(&open)));
        assert!(!null.matches(&node("n1", "x"), images(&closed)));
        assert!(not_null.matches(&node("n1", "x"), images(&closed)));
        assert!(!not_null.matches(&node("n1", "x"), images(&open)));
    }

    #[test]
    fn contains_reads_comma_separated_column() {
        let expression = ColumnMatchExpression::parse("TARGETS contains :NODE_ID").unwrap();
        let negated = ColumnMatchExpression::parse("TARGETS not contains :NODE_ID").unwrap();
        let row = RowImage::new().with("targets", Some("n1, n3"));

        assert!(expression.matches(&node("n3", "x"), images(&row)));
        assert!(!expression.matches(&node("n2", "x"), images(&row)));
        assert!(negated.matches(&node("n2", "x"), images(&row)));
    }

    #[test]
    fn old_prefix_reads_old_image() {
        let expression = ColumnMatchExpression::parse("OLD_STORE_ID=:NODE_ID").unwrap();
        let new_row = RowImage::new().with("store_id", Some("n2"));
        let old_row = RowImage::new().with("store_id", Some("n1"));
        let images = MatchImages {
            current: &new_row,
            old: Some(&old_row),
        };

        assert!(expression.matches(&node("n1", "x"), images));
        assert!(!expression.matches(&node("n2", "x"), images));
        assert!(!expression.reads_current_columns());
    }

    #[test]
    fn quoted_literals_keep_separators() {
        let expression = ColumnMatchExpression::parse("NAME='it''s or not'").unwrap();
        let row = RowImage::new().with("name", Some("it's or not"));

        assert_eq!(expression.clauses().len(), 1);
        assert!(expression.matches(&node("n1", "x"), images(&row)));
    }

    #[test]
    fn column_variable_compares_two_columns() {
        let expression = ColumnMatchExpression::parse("OWNER!=:CREATOR").unwrap();
        let same = RowImage::new().with("owner", Some("a")).with("creator", Some("a"));
        let different = RowImage::new().with("owner", Some("a")).with("creator", Some("b"));

        assert!(!expression.matches(&node("n1", "x"), images(&same)));
        assert!(expression.matches(&node("n1", "x"), images(&different)));
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for expression in ["", "=x", "STORE_ID > 3", "STORE_ID='open", "STORE_ID=:"] {
            let err = ColumnMatchExpression::parse(expression).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidRouterExpression, "{expression}");
        }
    }
}
