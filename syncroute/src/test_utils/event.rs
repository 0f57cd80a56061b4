use chrono::Utc;

use crate::types::{CapturedEvent, ChannelId, EventId, EventType, NodeId, RowImage, TableIdentity};

/// Table used by the builders.
pub const TEST_TABLE: &str = "item";

fn event(
    id: EventId,
    channel_id: &str,
    event_type: EventType,
    new_row: Option<RowImage>,
    old_row: Option<RowImage>,
) -> CapturedEvent {
    CapturedEvent {
        id,
        channel_id: ChannelId::new(channel_id),
        table: TableIdentity::new(TEST_TABLE),
        event_type,
        new_row,
        old_row,
        transaction_id: None,
        source_node_id: None,
        created_at: Utc::now(),
    }
}

pub fn insert_event(id: EventId, channel_id: &str) -> CapturedEvent {
    event(id, channel_id, EventType::Insert, Some(RowImage::new()), None)
}

pub fn insert_row(id: EventId, channel_id: &str, row: RowImage) -> CapturedEvent {
    event(id, channel_id, EventType::Insert, Some(row), None)
}

pub fn update_row(id: EventId, channel_id: &str, old: RowImage, new: RowImage) -> CapturedEvent {
    event(id, channel_id, EventType::Update, Some(new), Some(old))
}

pub fn delete_row(id: EventId, channel_id: &str, old: RowImage) -> CapturedEvent {
    event(id, channel_id, EventType::Delete, None, Some(old))
}

/// Marks `event` as written by transaction `transaction_id`.
pub fn in_transaction(mut event: CapturedEvent, transaction_id: &str) -> CapturedEvent {
    event.transaction_id = Some(transaction_id.to_string());
    event
}

/// Marks `event` as captured on `node_id` and replicated here.
pub fn from_node(mut event: CapturedEvent, node_id: &str) -> CapturedEvent {
    event.source_node_id = Some(NodeId::new(node_id));
    event
}
