use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Replication participant known to the node catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub node_group_id: String,
    pub external_id: String,
    /// Nodes with sync disabled receive no events and are refused delivery.
    pub sync_enabled: bool,
}

impl Node {
    pub fn new(
        node_id: impl Into<NodeId>,
        node_group_id: impl Into<String>,
        external_id: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_group_id: node_group_id.into(),
            external_id: external_id.into(),
            sync_enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.sync_enabled = false;
        self
    }
}
