//! Lookup-table router: maps a row value to external ids through a key table.

use async_trait::async_trait;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};

/// Reads external ids from a lookup table.
#[async_trait]
pub trait LookupTableSource: Send + Sync {
    /// Returns the `external_id_column` values of the rows of `table` whose
    /// `lookup_key_column` equals `key`.
    async fn lookup_external_ids(
        &self,
        table: &str,
        lookup_key_column: &str,
        external_id_column: &str,
        key: &str,
    ) -> SyncResult<Vec<String>>;
}

/// Parsed lookup-table expression.
///
/// ```text
/// LOOKUP_TABLE=store_item
/// KEY_COLUMN=ITEM_ID
/// LOOKUP_KEY_COLUMN=item_id
/// EXTERNAL_ID_COLUMN=store_id
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupTableExpression {
    pub lookup_table: String,
    /// Column of the captured row holding the lookup key.
    pub key_column: String,
    pub lookup_key_column: String,
    pub external_id_column: String,
}

impl LookupTableExpression {
    pub fn parse(expression: &str) -> SyncResult<Self> {
        let mut lookup_table = None;
        let mut key_column = None;
        let mut lookup_key_column = None;
        let mut external_id_column = None;

        for line in expression.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let Some((key, value)) = line.split_once('=') else {
                bail!(
                    ErrorKind::InvalidRouterExpression,
                    "Lookup-table expression line is not KEY=VALUE",
                    format!("line `{line}`")
                );
            };
            let value = value.trim();
            if value.is_empty() {
                bail!(
                    ErrorKind::InvalidRouterExpression,
                    "Lookup-table expression has an empty value",
                    format!("line `{line}`")
                );
            }

            let slot = match key.trim().to_ascii_uppercase().as_str() {
                "LOOKUP_TABLE" => &mut lookup_table,
                "KEY_COLUMN" => &mut key_column,
                "LOOKUP_KEY_COLUMN" => &mut lookup_key_column,
                "EXTERNAL_ID_COLUMN" => &mut external_id_column,
                other => bail!(
                    ErrorKind::InvalidRouterExpression,
                    "Lookup-table expression has an unknown key",
                    format!("key `{other}`")
                ),
            };
            *slot = Some(value.to_string());
        }

        match (lookup_table, key_column, lookup_key_column, external_id_column) {
            (
                Some(lookup_table),
                Some(key_column),
                Some(lookup_key_column),
                Some(external_id_column),
            ) => Ok(Self {
                lookup_table,
                key_column,
                lookup_key_column,
                external_id_column,
            }),
            _ => bail!(
                ErrorKind::InvalidRouterExpression,
                "Lookup-table expression is incomplete",
                "LOOKUP_TABLE, KEY_COLUMN, LOOKUP_KEY_COLUMN and EXTERNAL_ID_COLUMN are required"
            ),
        }
    }
}
