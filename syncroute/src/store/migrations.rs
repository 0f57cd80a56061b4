use config::shared::{IntoConnectOptions, PgConnectionConfig};
use sqlx::{Executor, postgres::PgPoolOptions};
use tracing::info;

use crate::error::SyncResult;

/// Schema holding the routing tables and the `sqlx` migration metadata.
pub const ROUTING_SCHEMA: &str = "syncroute";

/// Creates the routing schema and applies pending migrations inside it.
pub async fn apply_routing_migrations(connection_config: &PgConnectionConfig) -> SyncResult<()> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("create schema if not exists syncroute;").await?;
                conn.execute("set search_path = 'syncroute';").await?;

                Ok(())
            })
        })
        .connect_with(connection_config.with_db())
        .await?;

    info!(schema = ROUTING_SCHEMA, "applying routing migrations");

    sqlx::migrate!("./migrations").run(&pool).await?;

    info!(schema = ROUTING_SCHEMA, "routing migrations applied");

    Ok(())
}
