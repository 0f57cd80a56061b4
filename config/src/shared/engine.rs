use std::collections::HashSet;

use serde::Deserialize;

use crate::load::Config;
use crate::shared::{
    ChannelPolicyConfig, ReservationConfig, RoutingConfig, StoreConfig, ValidationError,
};

/// Top-level configuration of a routing engine process.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    pub routing: RoutingConfig,
    #[serde(default)]
    pub reservation: ReservationConfig,
    #[serde(default)]
    pub channels: Vec<ChannelPolicyConfig>,
    #[serde(default)]
    pub store: StoreConfig,
}

impl EngineConfig {
    /// Validates every section and rejects duplicate channel ids.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.routing.validate()?;
        self.reservation.validate()?;
        self.store.validate()?;

        let mut seen = HashSet::with_capacity(self.channels.len());
        for channel in &self.channels {
            channel.validate()?;
            if !seen.insert(channel.channel_id.as_str()) {
                return Err(ValidationError::DuplicateChannel(channel.channel_id.clone()));
            }
        }

        Ok(())
    }
}

impl Config for EngineConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}
