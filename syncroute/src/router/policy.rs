use std::collections::HashMap;
use std::sync::Arc;

use config::shared::{ChannelPolicyConfig, RouterType};
use tracing::warn;

use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::router::column_match::ColumnMatchExpression;
use crate::router::lookup::LookupTableExpression;
use crate::router::subselect::SubselectTemplate;
use crate::types::ChannelId;
use crate::{bail, sync_error};

/// Compiled routing policy of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingPolicy {
    /// Every sync-enabled node of the channel's target groups.
    Default,
    ColumnMatch(ColumnMatchExpression),
    Subselect(SubselectTemplate),
    LookupTable(LookupTableExpression),
    /// Expression handed verbatim to an [`ExpressionEvaluator`](crate::router::ExpressionEvaluator).
    ExternalExpression(String),
}

impl RoutingPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            RoutingPolicy::Default => "default",
            RoutingPolicy::ColumnMatch(_) => "column-match",
            RoutingPolicy::Subselect(_) => "subselect",
            RoutingPolicy::LookupTable(_) => "lookup-table",
            RoutingPolicy::ExternalExpression(_) => "external-expression",
        }
    }
}

/// Channel configuration together with its compiled routing policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPolicy {
    channel_id: ChannelId,
    config: ChannelPolicyConfig,
    routing: RoutingPolicy,
}

impl ChannelPolicy {
    /// Validates the configuration and parses its router expression.
    pub fn compile(config: ChannelPolicyConfig) -> SyncResult<Self> {
        if let Err(err) = config.validate() {
            let detail = err.to_string();
            return Err(sync_error!(
                ErrorKind::InvalidChannelPolicy,
                "Channel policy is invalid",
                detail = detail
            )
            .with_source(err));
        }

        let expression = config.router_expression.as_deref().unwrap_or_default();
        let routing = match config.router_type() {
            RouterType::Default => RoutingPolicy::Default,
            RouterType::ColumnMatch => {
                RoutingPolicy::ColumnMatch(ColumnMatchExpression::parse(expression)?)
            }
            RouterType::Subselect => RoutingPolicy::Subselect(SubselectTemplate::new(expression)),
            RouterType::LookupTable => {
                RoutingPolicy::LookupTable(LookupTableExpression::parse(expression)?)
            }
            RouterType::Scripted => RoutingPolicy::ExternalExpression(expression.to_string()),
        };

        Ok(Self {
            channel_id: ChannelId::new(config.channel_id.clone()),
            config,
            routing,
        })
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn config(&self) -> &ChannelPolicyConfig {
        &self.config
    }

    pub fn routing(&self) -> &RoutingPolicy {
        &self.routing
    }
}

/// Policies of every configured channel.
///
/// Channels whose configuration failed to compile are kept with their error, so the routing
/// pass can tell an invalid channel from an unknown one.
#[derive(Debug, Clone, Default)]
pub struct ChannelPolicies {
    policies: HashMap<ChannelId, Result<Arc<ChannelPolicy>, SyncError>>,
}

impl ChannelPolicies {
    pub fn new(configs: impl IntoIterator<Item = ChannelPolicyConfig>) -> Self {
        let mut policies = HashMap::new();
        for config in configs {
            let channel_id = ChannelId::new(config.channel_id.clone());
            let compiled = ChannelPolicy::compile(config).map(Arc::new);
            if let Err(err) = &compiled {
                warn!(channel_id = %channel_id, error = %err, "channel policy failed to compile");
            }
            policies.insert(channel_id, compiled);
        }

        Self { policies }
    }

    /// Returns the policy of `channel_id`.
    ///
    /// Fails with [`ErrorKind::MissingChannelPolicy`] for unknown channels and with the
    /// compilation error for invalid ones.
    pub fn get(&self, channel_id: &ChannelId) -> SyncResult<Arc<ChannelPolicy>> {
        match self.policies.get(channel_id) {
            Some(Ok(policy)) => Ok(policy.clone()),
            Some(Err(err)) => Err(err.clone()),
            None => bail!(
                ErrorKind::MissingChannelPolicy,
                "Channel policy not found",
                format!("channel `{channel_id}` has no policy")
            ),
        }
    }

    pub fn channel_ids(&self) -> impl Iterator<Item = &ChannelId> {
        self.policies.keys()
    }
}
