use std::fmt;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Completion rule applied to open batches of a channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchAlgorithm {
    /// Finalize once the batch holds `max_batch_size` events.
    #[default]
    Default,
    /// Never split a source transaction across batches.
    Transactional,
    /// Finalize strictly at `max_batch_size`, even inside a transaction.
    Nontransactional,
}

/// Router variant used to compute the target nodes of a channel's events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouterType {
    #[default]
    Default,
    ColumnMatch,
    Subselect,
    LookupTable,
    Scripted,
}

impl RouterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouterType::Default => "default",
            RouterType::ColumnMatch => "column-match",
            RouterType::Subselect => "subselect",
            RouterType::LookupTable => "lookup-table",
            RouterType::Scripted => "scripted",
        }
    }
}

impl fmt::Display for RouterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing and batching policy of one channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ChannelPolicyConfig {
    pub channel_id: String,
    /// Size at which an open batch becomes complete.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default)]
    pub batch_algorithm: BatchAlgorithm,
    /// Router variant. [`None`] behaves as [`RouterType::Default`].
    #[serde(default)]
    pub router_type: Option<RouterType>,
    #[serde(default)]
    pub router_expression: Option<String>,
    /// Whether the old row image takes part in routing decisions.
    #[serde(default = "default_true")]
    pub use_old_data_to_route: bool,
    /// Maximum number of batches of this channel handed to one node before it acknowledges.
    #[serde(default = "default_max_batches_in_flight_per_node")]
    pub max_batches_in_flight_per_node: u32,
    /// Disabled channels are not routed and their batches are not delivered.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub sync_on_insert: bool,
    #[serde(default = "default_true")]
    pub sync_on_update: bool,
    #[serde(default = "default_true")]
    pub sync_on_delete: bool,
    /// Allows routing an event back to the node it was captured from.
    #[serde(default)]
    pub ping_back: bool,
    /// Upper bound on events of this channel routed by one pass.
    #[serde(default)]
    pub max_data_to_route: Option<usize>,
}

impl ChannelPolicyConfig {
    pub const DEFAULT_MAX_BATCH_SIZE: usize = 10_000;

    pub const DEFAULT_MAX_BATCHES_IN_FLIGHT_PER_NODE: u32 = 60;

    /// Creates a policy with default settings for `channel_id`.
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            max_batch_size: default_max_batch_size(),
            batch_algorithm: BatchAlgorithm::default(),
            router_type: None,
            router_expression: None,
            use_old_data_to_route: true,
            max_batches_in_flight_per_node: default_max_batches_in_flight_per_node(),
            enabled: true,
            sync_on_insert: true,
            sync_on_update: true,
            sync_on_delete: true,
            ping_back: false,
            max_data_to_route: None,
        }
    }

    /// Returns the effective router type.
    pub fn router_type(&self) -> RouterType {
        self.router_type.unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.channel_id.trim().is_empty() {
            return Err(ValidationError::invalid(
                "channels.channel_id",
                "must not be empty",
            ));
        }

        if self.max_batch_size == 0 {
            return Err(ValidationError::invalid(
                format!("channels.{}.max_batch_size", self.channel_id),
                "must be greater than 0",
            ));
        }

        if self.max_batches_in_flight_per_node == 0 {
            return Err(ValidationError::invalid(
                format!("channels.{}.max_batches_in_flight_per_node", self.channel_id),
                "must be greater than 0",
            ));
        }

        if self.max_data_to_route == Some(0) {
            return Err(ValidationError::invalid(
                format!("channels.{}.max_data_to_route", self.channel_id),
                "must be greater than 0 when set",
            ));
        }

        let router_type = self.router_type();
        let has_expression = self
            .router_expression
            .as_deref()
            .is_some_and(|expression| !expression.trim().is_empty());
        if router_type != RouterType::Default && !has_expression {
            return Err(ValidationError::MissingRouterExpression {
                channel_id: self.channel_id.clone(),
                router_type: router_type.to_string(),
            });
        }

        Ok(())
    }
}

fn default_max_batch_size() -> usize {
    ChannelPolicyConfig::DEFAULT_MAX_BATCH_SIZE
}

fn default_max_batches_in_flight_per_node() -> u32 {
    ChannelPolicyConfig::DEFAULT_MAX_BATCHES_IN_FLIGHT_PER_NODE
}

const fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_defaults() {
        let policy: ChannelPolicyConfig =
            serde_json::from_str(r#"{"channel_id": "sale_transaction"}"#).unwrap();

        assert_eq!(policy.max_batch_size, ChannelPolicyConfig::DEFAULT_MAX_BATCH_SIZE);
        assert_eq!(policy.batch_algorithm, BatchAlgorithm::Default);
        assert_eq!(policy.router_type(), RouterType::Default);
        assert!(policy.use_old_data_to_route);
        assert!(policy.enabled);
        assert_eq!(policy, ChannelPolicyConfig::new("sale_transaction"));
    }

    #[test]
    fn router_type_uses_kebab_case() {
        let policy: ChannelPolicyConfig = serde_json::from_str(
            r#"{"channel_id": "c", "router_type": "column-match", "router_expression": "STORE_ID"}"#,
        )
        .unwrap();

        assert_eq!(policy.router_type(), RouterType::ColumnMatch);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn non_default_router_requires_expression() {
        let mut policy = ChannelPolicyConfig::new("c");
        policy.router_type = Some(RouterType::LookupTable);
        policy.router_expression = Some("  ".to_string());

        assert_eq!(
            policy.validate(),
            Err(ValidationError::MissingRouterExpression {
                channel_id: "c".to_string(),
                router_type: "lookup-table".to_string(),
            })
        );
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut policy = ChannelPolicyConfig::new("c");
        policy.max_batch_size = 0;

        assert!(matches!(
            policy.validate(),
            Err(ValidationError::InvalidFieldValue { .. })
        ));
    }
}
