use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::catalog::NodeCatalog;
use crate::error::SyncResult;
use crate::types::{ChannelId, Node, NodeId};

#[derive(Debug, Default)]
struct Inner {
    nodes: BTreeMap<NodeId, Node>,
    /// Target node groups per channel.
    group_links: BTreeMap<ChannelId, BTreeSet<String>>,
}

/// Node catalog kept in memory. Cloning shares the same catalog.
#[derive(Debug, Clone, Default)]
pub struct MemoryNodeCatalog {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryNodeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node, replacing any node with the same id.
    pub async fn add_node(&self, node: Node) {
        let mut inner = self.inner.write().await;
        inner.nodes.insert(node.node_id.clone(), node);
    }

    /// Routes `channel_id` to every node of `node_group_id`.
    pub async fn link_channel(&self, channel_id: impl Into<ChannelId>, node_group_id: &str) {
        let mut inner = self.inner.write().await;
        inner
            .group_links
            .entry(channel_id.into())
            .or_default()
            .insert(node_group_id.to_string());
    }

    pub async fn set_sync_enabled(&self, node_id: &NodeId, sync_enabled: bool) {
        let mut inner = self.inner.write().await;
        if let Some(node) = inner.nodes.get_mut(node_id) {
            node.sync_enabled = sync_enabled;
        }
    }
}

impl NodeCatalog for MemoryNodeCatalog {
    async fn find_node(&self, node_id: &NodeId) -> SyncResult<Option<Node>> {
        Ok(self.inner.read().await.nodes.get(node_id).cloned())
    }

    async fn resolve_node_by_external_id(&self, external_id: &str) -> SyncResult<Option<NodeId>> {
        let inner = self.inner.read().await;

        Ok(inner
            .nodes
            .values()
            .find(|node| node.external_id == external_id)
            .map(|node| node.node_id.clone()))
    }

    async fn nodes_in_group_link_target(
        &self,
        channel_id: &ChannelId,
    ) -> SyncResult<BTreeSet<NodeId>> {
        let inner = self.inner.read().await;
        let Some(groups) = inner.group_links.get(channel_id) else {
            return Ok(BTreeSet::new());
        };

        Ok(inner
            .nodes
            .values()
            .filter(|node| groups.contains(&node.node_group_id))
            .map(|node| node.node_id.clone())
            .collect())
    }

    async fn is_sync_enabled(&self, node_id: &NodeId) -> SyncResult<bool> {
        let inner = self.inner.read().await;

        Ok(inner
            .nodes
            .get(node_id)
            .is_some_and(|node| node.sync_enabled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn group_link_targets_include_disabled_nodes() {
        let catalog = MemoryNodeCatalog::new();
        catalog.add_node(Node::new("n1", "store", "s-1")).await;
        catalog.add_node(Node::new("n2", "store", "s-2").disabled()).await;
        catalog.add_node(Node::new("corp", "corp", "c-1")).await;
        catalog.link_channel("item", "store").await;

        let targets = catalog
            .nodes_in_group_link_target(&ChannelId::new("item"))
            .await
            .unwrap();

        assert_eq!(targets, BTreeSet::from([NodeId::new("n1"), NodeId::new("n2")]));
        assert!(!catalog.is_sync_enabled(&NodeId::new("n2")).await.unwrap());
        assert_eq!(
            catalog.resolve_node_by_external_id("s-2").await.unwrap(),
            Some(NodeId::new("n2"))
        );
    }

    #[tokio::test]
    async fn unlinked_channel_has_no_targets() {
        let catalog = MemoryNodeCatalog::new();
        catalog.add_node(Node::new("n1", "store", "s-1")).await;

        let targets = catalog
            .nodes_in_group_link_target(&ChannelId::new("config"))
            .await
            .unwrap();

        assert!(targets.is_empty());
    }
}
