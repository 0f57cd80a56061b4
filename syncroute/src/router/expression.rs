//! External expression router: the expression language lives outside this crate.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::SyncResult;
use crate::types::{CapturedEvent, Node, NodeId};

/// Named values exposed to an expression. `None` is SQL `NULL`.
pub type ExpressionBindings = BTreeMap<String, Option<String>>;

/// Evaluates router expressions written in an external language.
#[async_trait]
pub trait ExpressionEvaluator: Send + Sync {
    /// Returns the nodes selected by `expression`. `candidates` are the nodes the channel may
    /// route to.
    async fn evaluate(
        &self,
        expression: &str,
        bindings: &ExpressionBindings,
        candidates: &[Node],
    ) -> SyncResult<Vec<NodeId>>;
}

/// Builds the bindings of an event.
///
/// Columns of the routing image are bound under their upper-cased names and old values under
/// `OLD_<NAME>`. `EVENT_TYPE`, `TABLE_NAME`, `CHANNEL_ID` and `SOURCE_NODE_ID` describe the
/// event itself.
pub fn event_bindings(event: &CapturedEvent) -> ExpressionBindings {
    let mut bindings = ExpressionBindings::new();

    if let Some(image) = event.routing_image() {
        for (column, value) in image.iter() {
            bindings.insert(column.to_ascii_uppercase(), value.map(str::to_string));
        }
    }
    if let Some(old) = &event.old_row {
        for (column, value) in old.iter() {
            bindings.insert(
                format!("OLD_{}", column.to_ascii_uppercase()),
                value.map(str::to_string),
            );
        }
    }

    bindings.insert(
        "EVENT_TYPE".to_string(),
        Some(event.event_type.as_str().to_ascii_uppercase()),
    );
    bindings.insert("TABLE_NAME".to_string(), Some(event.table.name.clone()));
    bindings.insert(
        "CHANNEL_ID".to_string(),
        Some(event.channel_id.as_str().to_string()),
    );
    bindings.insert(
        "SOURCE_NODE_ID".to_string(),
        event.source_node_id.as_ref().map(|id| id.as_str().to_string()),
    );

    bindings
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types::{ChannelId, EventType, RowImage, TableIdentity};

    #[test]
    fn binds_columns_old_values_and_event_fields() {
        let event = CapturedEvent {
            id: 1,
            channel_id: ChannelId::new("item"),
            table: TableIdentity::with_schema("public", "item"),
            event_type: EventType::Update,
            new_row: Some(RowImage::new().with("store_id", Some("n2")).with("note", None)),
            old_row: Some(RowImage::new().with("store_id", Some("n1"))),
            transaction_id: None,
            source_node_id: None,
            created_at: Utc::now(),
        };

        let bindings = event_bindings(&event);

        assert_eq!(bindings["STORE_ID"].as_deref(), Some("n2"));
        assert_eq!(bindings["OLD_STORE_ID"].as_deref(), Some("n1"));
        assert_eq!(bindings["NOTE"], None);
        assert_eq!(bindings["EVENT_TYPE"].as_deref(), Some("UPDATE"));
        assert_eq!(bindings["TABLE_NAME"].as_deref(), Some("item"));
        assert_eq!(bindings["SOURCE_NODE_ID"], None);
    }
}
