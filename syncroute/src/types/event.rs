use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChannelId, EventId, NodeId};

/// Kind of row mutation recorded by the capture source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Insert,
    Update,
    Delete,
    /// Full row sent on request, independent of a mutation.
    Reload,
    Other,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Insert => "insert",
            EventType::Update => "update",
            EventType::Delete => "delete",
            EventType::Reload => "reload",
            EventType::Other => "other",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully qualified name of a captured table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableIdentity {
    pub schema: Option<String>,
    pub name: String,
}

impl TableIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    pub fn with_schema(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Column values of one row. A [`None`] value is SQL `NULL`.
///
/// Lookups ignore ASCII case because expressions commonly spell column names in upper case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowImage(BTreeMap<String, Option<String>>);

impl RowImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a column and returns the image, for building rows inline.
    pub fn with(mut self, column: impl Into<String>, value: Option<&str>) -> Self {
        self.insert(column, value.map(str::to_string));
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Option<String>) {
        self.0.insert(column.into(), value);
    }

    /// Returns `None` when the column is absent and `Some(None)` when it is `NULL`.
    pub fn get(&self, column: &str) -> Option<Option<&str>> {
        if let Some(value) = self.0.get(column) {
            return Some(value.as_deref());
        }

        self.0
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value.as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_deref()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, Option<V>)> for RowImage
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, Option<V>)>>(iter: I) -> Self {
        RowImage(
            iter.into_iter()
                .map(|(column, value)| (column.into(), value.map(Into::into)))
                .collect(),
        )
    }
}

/// One row-level mutation read from the capture source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedEvent {
    pub id: EventId,
    pub channel_id: ChannelId,
    pub table: TableIdentity,
    pub event_type: EventType,
    pub new_row: Option<RowImage>,
    pub old_row: Option<RowImage>,
    /// Absent when the source database exposes no transaction ids.
    pub transaction_id: Option<String>,
    /// Node the mutation was originally captured on, when it arrived through replication.
    pub source_node_id: Option<NodeId>,
    pub created_at: DateTime<Utc>,
}

impl CapturedEvent {
    /// Row image used to extract routing columns.
    ///
    /// Deletes and updates without a new image fall back to the old image.
    pub fn routing_image(&self) -> Option<&RowImage> {
        self.new_row.as_ref().or(self.old_row.as_ref())
    }
}
