use serde::Deserialize;

use crate::shared::{PgConnectionConfig, ValidationError};

/// Backend persisting gaps, batches and the routing lease.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreConfig {
    /// Process-local store. State is lost on restart.
    #[default]
    Memory,
    Postgres(PgConnectionConfig),
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            StoreConfig::Memory => Ok(()),
            StoreConfig::Postgres(connection) => connection.validate(),
        }
    }
}
