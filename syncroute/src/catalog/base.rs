use std::collections::BTreeSet;
use std::future::Future;

use crate::error::SyncResult;
use crate::types::{ChannelId, Node, NodeId};

/// Directory of replication participants and of the group links channels route over.
pub trait NodeCatalog {
    fn find_node(&self, node_id: &NodeId)
    -> impl Future<Output = SyncResult<Option<Node>>> + Send;

    /// Resolves the node registered under `external_id`, if any.
    fn resolve_node_by_external_id(
        &self,
        external_id: &str,
    ) -> impl Future<Output = SyncResult<Option<NodeId>>> + Send;

    /// Returns every node of the groups `channel_id` routes to, sync-enabled or not.
    fn nodes_in_group_link_target(
        &self,
        channel_id: &ChannelId,
    ) -> impl Future<Output = SyncResult<BTreeSet<NodeId>>> + Send;

    fn is_sync_enabled(&self, node_id: &NodeId) -> impl Future<Output = SyncResult<bool>> + Send;
}
