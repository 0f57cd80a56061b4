use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Pool admitting pull requests.
pub const PULL_POOL_ID: &str = "pull";

/// Pool admitting push requests.
pub const PUSH_POOL_ID: &str = "push";

/// Concurrency ceilings of one reservation pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReservationPoolConfig {
    /// Hard reservations allowed across all nodes.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Hard reservations allowed for a single node.
    #[serde(default = "default_max_per_node")]
    pub max_per_node: u32,
    /// Optional per channel-queue ceilings, applied per node.
    #[serde(default)]
    pub channel_queue_limits: BTreeMap<String, u32>,
}

impl ReservationPoolConfig {
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 20;

    pub const DEFAULT_MAX_PER_NODE: u32 = 1;

    fn validate(&self, pool_id: &str) -> Result<(), ValidationError> {
        if self.max_connections == 0 {
            return Err(ValidationError::invalid(
                format!("reservation.pools.{pool_id}.max_connections"),
                "must be greater than 0",
            ));
        }

        if self.max_per_node == 0 || self.max_per_node > self.max_connections {
            return Err(ValidationError::invalid(
                format!("reservation.pools.{pool_id}.max_per_node"),
                "must be between 1 and `max_connections`",
            ));
        }

        if let Some((queue, _)) = self
            .channel_queue_limits
            .iter()
            .find(|(_, limit)| **limit == 0)
        {
            return Err(ValidationError::invalid(
                format!("reservation.pools.{pool_id}.channel_queue_limits.{queue}"),
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl Default for ReservationPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_per_node: default_max_per_node(),
            channel_queue_limits: BTreeMap::new(),
        }
    }
}

/// Reservation pools keyed by pool id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReservationConfig {
    #[serde(default = "default_pools")]
    pub pools: BTreeMap<String, ReservationPoolConfig>,
}

impl ReservationConfig {
    pub fn pool(&self, pool_id: &str) -> Option<&ReservationPoolConfig> {
        self.pools.get(pool_id)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for (pool_id, pool) in &self.pools {
            pool.validate(pool_id)?;
        }

        Ok(())
    }
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            pools: default_pools(),
        }
    }
}

fn default_pools() -> BTreeMap<String, ReservationPoolConfig> {
    BTreeMap::from([
        (PULL_POOL_ID.to_string(), ReservationPoolConfig::default()),
        (PUSH_POOL_ID.to_string(), ReservationPoolConfig::default()),
    ])
}

fn default_max_connections() -> u32 {
    ReservationPoolConfig::DEFAULT_MAX_CONNECTIONS
}

fn default_max_per_node() -> u32 {
    ReservationPoolConfig::DEFAULT_MAX_PER_NODE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_pull_and_push_pools() {
        let config = ReservationConfig::default();

        assert!(config.pool(PULL_POOL_ID).is_some());
        assert!(config.pool(PUSH_POOL_ID).is_some());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn per_node_ceiling_cannot_exceed_pool() {
        let mut config = ReservationConfig::default();
        if let Some(pool) = config.pools.get_mut(PULL_POOL_ID) {
            pool.max_per_node = pool.max_connections + 1;
        }

        assert!(config.validate().is_err());
    }
}
