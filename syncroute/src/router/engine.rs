use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::catalog::NodeCatalog;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::router::column_match::{ColumnMatchExpression, MatchImages};
use crate::router::expression::{ExpressionEvaluator, event_bindings};
use crate::router::lookup::{LookupTableExpression, LookupTableSource};
use crate::router::policy::{ChannelPolicy, RoutingPolicy};
use crate::router::subselect::{SubselectExecutor, SubselectTemplate};
use crate::sync_error;
use crate::types::{CapturedEvent, ChannelId, Node, NodeId};

/// External capabilities some routing policies need.
///
/// A channel whose policy needs a capability that is not registered fails with a
/// configuration error.
#[derive(Clone, Default)]
pub struct PolicyBackends {
    subselect: Option<Arc<dyn SubselectExecutor>>,
    lookup: Option<Arc<dyn LookupTableSource>>,
    expression: Option<Arc<dyn ExpressionEvaluator>>,
}

impl PolicyBackends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subselect_executor(mut self, executor: Arc<dyn SubselectExecutor>) -> Self {
        self.subselect = Some(executor);
        self
    }

    pub fn with_lookup_table_source(mut self, source: Arc<dyn LookupTableSource>) -> Self {
        self.lookup = Some(source);
        self
    }

    pub fn with_expression_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.expression = Some(evaluator);
        self
    }
}

impl fmt::Debug for PolicyBackends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyBackends")
            .field("subselect", &self.subselect.is_some())
            .field("lookup", &self.lookup.is_some())
            .field("expression", &self.expression.is_some())
            .finish()
    }
}

fn missing_backend(policy: &ChannelPolicy, capability: &str) -> SyncError {
    sync_error!(
        ErrorKind::ConfigError,
        "Routing policy needs an unregistered backend",
        format!(
            "channel `{}` uses the {} router but no {capability} is registered",
            policy.channel_id(),
            policy.routing().name()
        )
    )
}

fn evaluation_error(
    kind: ErrorKind,
    description: &'static str,
    channel_id: &ChannelId,
    err: SyncError,
) -> SyncError {
    sync_error!(kind, description, format!("channel `{channel_id}`: {err}")).with_source(err)
}

/// Evaluates channel policies against captured events.
#[derive(Debug, Clone)]
pub struct RouterEngine {
    /// Node running the router. Events are never routed to it.
    identity: NodeId,
    backends: PolicyBackends,
}

impl RouterEngine {
    pub fn new(identity: NodeId, backends: PolicyBackends) -> Self {
        Self { identity, backends }
    }

    pub fn identity(&self) -> &NodeId {
        &self.identity
    }

    /// Returns the nodes that must receive `event`.
    ///
    /// Only sync-enabled nodes of the channel's target groups are eligible. The router's own
    /// node is never selected, and neither is the node the event came from unless the channel
    /// allows ping back. An empty set means the event is intentionally routed to nobody.
    pub async fn route<C>(
        &self,
        event: &CapturedEvent,
        policy: &ChannelPolicy,
        catalog: &C,
    ) -> SyncResult<BTreeSet<NodeId>>
    where
        C: NodeCatalog,
    {
        let candidates = self.candidates(policy.channel_id(), catalog).await?;

        let mut targets: BTreeSet<NodeId> = match policy.routing() {
            RoutingPolicy::Default => candidates
                .iter()
                .map(|node| node.node_id.clone())
                .collect(),
            RoutingPolicy::ColumnMatch(expression) => {
                route_column_match(event, policy, expression, &candidates)
            }
            RoutingPolicy::Subselect(template) => {
                self.route_subselect(event, policy, template, &candidates, catalog)
                    .await?
            }
            RoutingPolicy::LookupTable(expression) => {
                self.route_lookup_table(event, policy, expression, &candidates, catalog)
                    .await?
            }
            RoutingPolicy::ExternalExpression(expression) => {
                self.route_external_expression(event, policy, expression, &candidates)
                    .await?
            }
        };

        targets.remove(&self.identity);
        if !policy.config().ping_back
            && let Some(source_node_id) = &event.source_node_id
        {
            targets.remove(source_node_id);
        }

        debug!(
            event_id = event.id,
            channel_id = %policy.channel_id(),
            router = policy.routing().name(),
            targets = targets.len(),
            "event routed"
        );

        Ok(targets)
    }

    async fn candidates<C>(&self, channel_id: &ChannelId, catalog: &C) -> SyncResult<Vec<Node>>
    where
        C: NodeCatalog,
    {
        let catalog_error = |err: SyncError| {
            evaluation_error(
                ErrorKind::CatalogUnavailable,
                "Node catalog is unavailable",
                channel_id,
                err,
            )
        };

        let node_ids = catalog
            .nodes_in_group_link_target(channel_id)
            .await
            .map_err(catalog_error)?;

        let mut candidates = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            if !catalog
                .is_sync_enabled(&node_id)
                .await
                .map_err(catalog_error)?
            {
                continue;
            }
            if let Some(node) = catalog.find_node(&node_id).await.map_err(catalog_error)? {
                candidates.push(node);
            }
        }

        Ok(candidates)
    }

    async fn route_subselect<C>(
        &self,
        event: &CapturedEvent,
        policy: &ChannelPolicy,
        template: &SubselectTemplate,
        candidates: &[Node],
        catalog: &C,
    ) -> SyncResult<BTreeSet<NodeId>>
    where
        C: NodeCatalog,
    {
        let Some(executor) = &self.backends.subselect else {
            return Err(missing_backend(policy, "subselect executor"));
        };

        let mut bindings = event_bindings(event);
        bindings.insert(
            "NODE_ID".to_string(),
            Some(self.identity.as_str().to_string()),
        );
        let identity = catalog.find_node(&self.identity).await.map_err(|err| {
            evaluation_error(
                ErrorKind::CatalogUnavailable,
                "Node catalog is unavailable",
                policy.channel_id(),
                err,
            )
        })?;
        if let Some(identity) = identity {
            bindings.insert("NODE_GROUP_ID".to_string(), Some(identity.node_group_id));
            bindings.insert("EXTERNAL_ID".to_string(), Some(identity.external_id));
        }

        let predicate = template.render(&bindings);
        let selected = executor
            .select_node_ids(policy.channel_id(), &predicate)
            .await
            .map_err(|err| {
                evaluation_error(
                    ErrorKind::SubselectFailed,
                    "Subselect router failed",
                    policy.channel_id(),
                    err,
                )
            })?;

        Ok(restrict_to_candidates(selected, candidates))
    }

    async fn route_lookup_table<C>(
        &self,
        event: &CapturedEvent,
        policy: &ChannelPolicy,
        expression: &LookupTableExpression,
        candidates: &[Node],
        catalog: &C,
    ) -> SyncResult<BTreeSet<NodeId>>
    where
        C: NodeCatalog,
    {
        let Some(source) = &self.backends.lookup else {
            return Err(missing_backend(policy, "lookup table source"));
        };

        let mut keys = BTreeSet::new();
        if let Some(Some(key)) = event
            .routing_image()
            .and_then(|image| image.get(&expression.key_column))
        {
            keys.insert(key.to_string());
        }
        if policy.config().use_old_data_to_route
            && event.new_row.is_some()
            && let Some(Some(key)) = event
                .old_row
                .as_ref()
                .and_then(|image| image.get(&expression.key_column))
        {
            keys.insert(key.to_string());
        }

        let mut selected = Vec::new();
        for key in keys {
            let external_ids = source
                .lookup_external_ids(
                    &expression.lookup_table,
                    &expression.lookup_key_column,
                    &expression.external_id_column,
                    &key,
                )
                .await
                .map_err(|err| {
                    evaluation_error(
                        ErrorKind::LookupFailed,
                        "Lookup-table router failed",
                        policy.channel_id(),
                        err,
                    )
                })?;

            for external_id in external_ids {
                let node_id = catalog
                    .resolve_node_by_external_id(&external_id)
                    .await
                    .map_err(|err| {
                        evaluation_error(
                            ErrorKind::CatalogUnavailable,
                            "Node catalog is unavailable",
                            policy.channel_id(),
                            err,
                        )
                    })?;
                if let Some(node_id) = node_id {
                    selected.push(node_id);
                }
            }
        }

        Ok(restrict_to_candidates(selected, candidates))
    }

    async fn route_external_expression(
        &self,
        event: &CapturedEvent,
        policy: &ChannelPolicy,
        expression: &str,
        candidates: &[Node],
    ) -> SyncResult<BTreeSet<NodeId>> {
        let Some(evaluator) = &self.backends.expression else {
            return Err(missing_backend(policy, "expression evaluator"));
        };

        let bindings = event_bindings(event);
        let selected = evaluator
            .evaluate(expression, &bindings, candidates)
            .await
            .map_err(|err| {
                evaluation_error(
                    ErrorKind::ExpressionFailed,
                    "Router expression failed",
                    policy.channel_id(),
                    err,
                )
            })?;

        Ok(restrict_to_candidates(selected, candidates))
    }
}

/// Evaluates the expression against the new image and, when the channel routes on old data,
/// against the old image too, taking the union.
fn route_column_match(
    event: &CapturedEvent,
    policy: &ChannelPolicy,
    expression: &ColumnMatchExpression,
    candidates: &[Node],
) -> BTreeSet<NodeId> {
    let Some(current) = event.routing_image() else {
        return BTreeSet::new();
    };
    let old = event.old_row.as_ref();
    let old_as_current = old.filter(|_| {
        policy.config().use_old_data_to_route
            && event.new_row.is_some()
            && expression.reads_current_columns()
    });

    candidates
        .iter()
        .filter(|node| {
            expression.matches(node, MatchImages { current, old })
                || old_as_current.is_some_and(|old_row| {
                    expression.matches(
                        node,
                        MatchImages {
                            current: old_row,
                            old,
                        },
                    )
                })
        })
        .map(|node| node.node_id.clone())
        .collect()
}

fn restrict_to_candidates(
    selected: impl IntoIterator<Item = NodeId>,
    candidates: &[Node],
) -> BTreeSet<NodeId> {
    selected
        .into_iter()
        .filter(|node_id| candidates.iter().any(|node| &node.node_id == node_id))
        .collect()
}
