use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use config::shared::{IntoConnectOptions, PgConnectionConfig};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::debug;

use crate::bail;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::store::batch::BatchStore;
use crate::store::gap::{GapChange, GapStore};
use crate::store::lease::LeaseStore;
use crate::types::{
    BatchId, BatchStatus, ChannelId, DataGap, EventId, EventTypeCounts, NewOutgoingBatch, NodeId,
    OutgoingBatch,
};

/// Maximum number of connections in the pool. Routing and delivery share it.
const MAX_POOL_CONNECTIONS: u32 = 4;

/// Duration after which idle connections are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

const BATCH_COLUMNS: &str = "node_id, batch_id, channel_id, status, event_count, insert_count, \
     update_count, delete_count, reload_count, other_count, created_at, last_updated_at";

/// Creates a lazily connected pool. No connection is opened until the first query.
fn create_database_pool(config: &PgConnectionConfig) -> PgPool {
    PgPoolOptions::new()
        .min_connections(0)
        .max_connections(MAX_POOL_CONNECTIONS)
        .idle_timeout(Some(IDLE_TIMEOUT))
        .connect_lazy_with(config.with_db())
}

#[derive(Debug, FromRow)]
struct GapRow {
    start_id: i64,
    end_id: i64,
    status: String,
    created_at: DateTime<Utc>,
    last_updated_at: DateTime<Utc>,
    claimed_by: Option<String>,
}

impl TryFrom<GapRow> for DataGap {
    type Error = SyncError;

    fn try_from(row: GapRow) -> Result<Self, Self::Error> {
        Ok(DataGap {
            start_id: row.start_id,
            end_id: row.end_id,
            status: row.status.parse()?,
            created_at: row.created_at,
            last_updated_at: row.last_updated_at,
            claimed_by: row.claimed_by,
        })
    }
}

#[derive(Debug, FromRow)]
struct BatchRow {
    node_id: String,
    batch_id: i64,
    channel_id: String,
    status: String,
    event_count: i32,
    insert_count: i32,
    update_count: i32,
    delete_count: i32,
    reload_count: i32,
    other_count: i32,
    created_at: DateTime<Utc>,
    last_updated_at: DateTime<Utc>,
}

impl TryFrom<BatchRow> for OutgoingBatch {
    type Error = SyncError;

    fn try_from(row: BatchRow) -> Result<Self, Self::Error> {
        Ok(OutgoingBatch {
            batch_id: row.batch_id,
            node_id: NodeId::new(row.node_id),
            channel_id: ChannelId::new(row.channel_id),
            status: row.status.parse()?,
            event_count: row.event_count.max(0) as usize,
            event_counts: EventTypeCounts {
                insert: row.insert_count.max(0) as u32,
                update: row.update_count.max(0) as u32,
                delete: row.delete_count.max(0) as u32,
                reload: row.reload_count.max(0) as u32,
                other: row.other_count.max(0) as u32,
            },
            created_at: row.created_at,
            last_updated_at: row.last_updated_at,
        })
    }
}

fn to_i32(value: u32, field: &'static str) -> SyncResult<i32> {
    match i32::try_from(value) {
        Ok(value) => Ok(value),
        Err(_) => bail!(
            ErrorKind::SerializationError,
            "Batch counter does not fit the batch table",
            format!("`{field}` is {value}")
        ),
    }
}

/// Postgres implementation of every store trait.
///
/// Tables live in the `syncroute` schema created by
/// [`apply_routing_migrations`](crate::store::migrations::apply_routing_migrations).
/// Each trait method is a single transaction, so batch numbering and gap change sets are
/// atomic.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(connection_config: &PgConnectionConfig) -> Self {
        Self {
            pool: create_database_pool(connection_config),
        }
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl GapStore for PostgresStore {
    async fn load_data_gaps(&self) -> SyncResult<Vec<DataGap>> {
        let rows: Vec<GapRow> = sqlx::query_as(
            "select start_id, end_id, status, created_at, last_updated_at, claimed_by \
             from syncroute.data_gap order by start_id",
        )
        .fetch_all(&self.pool)
        .await?;

        debug!(count = rows.len(), "loaded data gaps");

        rows.into_iter().map(DataGap::try_from).collect()
    }

    async fn apply_gap_changes(&self, changes: Vec<GapChange>) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;

        for change in changes {
            match change {
                GapChange::Upsert(gap) => {
                    sqlx::query(
                        "insert into syncroute.data_gap \
                         (start_id, end_id, status, created_at, last_updated_at, claimed_by) \
                         values ($1, $2, $3, $4, $5, $6) \
                         on conflict (start_id, end_id) do update set \
                         status = excluded.status, created_at = excluded.created_at, \
                         last_updated_at = excluded.last_updated_at, claimed_by = excluded.claimed_by",
                    )
                    .bind(gap.start_id)
                    .bind(gap.end_id)
                    .bind(gap.status.as_str())
                    .bind(gap.created_at)
                    .bind(gap.last_updated_at)
                    .bind(gap.claimed_by)
                    .execute(&mut *tx)
                    .await?;
                }
                GapChange::Delete { start_id, end_id } => {
                    sqlx::query(
                        "delete from syncroute.data_gap where start_id = $1 and end_id = $2",
                    )
                    .bind(start_id)
                    .bind(end_id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;

        Ok(())
    }
}

impl BatchStore for PostgresStore {
    async fn insert_outgoing_batch(&self, batch: NewOutgoingBatch) -> SyncResult<OutgoingBatch> {
        let event_count = match i32::try_from(batch.event_ids.len()) {
            Ok(count) => count,
            Err(_) => bail!(
                ErrorKind::SerializationError,
                "Batch is too large for the batch table",
                format!("{} events", batch.event_ids.len())
            ),
        };
        let counts = batch.event_counts;

        let mut tx = self.pool.begin().await?;

        let batch_id: i64 = sqlx::query_scalar(
            "insert into syncroute.node_batch_sequence (node_id, last_batch_id) values ($1, 1) \
             on conflict (node_id) do update \
             set last_batch_id = node_batch_sequence.last_batch_id + 1 \
             returning last_batch_id",
        )
        .bind(batch.node_id.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let row: BatchRow = sqlx::query_as(&format!(
            "insert into syncroute.outgoing_batch ({BATCH_COLUMNS}) \
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11) \
             returning {BATCH_COLUMNS}"
        ))
        .bind(batch.node_id.as_str())
        .bind(batch_id)
        .bind(batch.channel_id.as_str())
        .bind(BatchStatus::Queued.as_str())
        .bind(event_count)
        .bind(to_i32(counts.insert, "insert_count")?)
        .bind(to_i32(counts.update, "update_count")?)
        .bind(to_i32(counts.delete, "delete_count")?)
        .bind(to_i32(counts.reload, "reload_count")?)
        .bind(to_i32(counts.other, "other_count")?)
        .bind(batch.created_at)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "insert into syncroute.outgoing_batch_event (node_id, batch_id, position, event_id) \
             select $1, $2, (e.ordinality - 1)::integer, e.event_id \
             from unnest($3::bigint[]) with ordinality as e(event_id, ordinality)",
        )
        .bind(batch.node_id.as_str())
        .bind(batch_id)
        .bind(&batch.event_ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        row.try_into()
    }

    async fn get_outgoing_batch(
        &self,
        node_id: &NodeId,
        batch_id: BatchId,
    ) -> SyncResult<Option<OutgoingBatch>> {
        let row: Option<BatchRow> = sqlx::query_as(&format!(
            "select {BATCH_COLUMNS} from syncroute.outgoing_batch \
             where node_id = $1 and batch_id = $2"
        ))
        .bind(node_id.as_str())
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(OutgoingBatch::try_from).transpose()
    }

    async fn get_batch_event_ids(
        &self,
        node_id: &NodeId,
        batch_id: BatchId,
    ) -> SyncResult<Vec<EventId>> {
        if self.get_outgoing_batch(node_id, batch_id).await?.is_none() {
            bail!(
                ErrorKind::BatchNotFound,
                "Outgoing batch not found",
                format!("batch {batch_id} of node `{node_id}` does not exist")
            );
        }

        let event_ids: Vec<i64> = sqlx::query_scalar(
            "select event_id from syncroute.outgoing_batch_event \
             where node_id = $1 and batch_id = $2 order by position",
        )
        .bind(node_id.as_str())
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(event_ids)
    }

    async fn get_routed_targets(
        &self,
        start_id: EventId,
        end_id: EventId,
    ) -> SyncResult<HashSet<(EventId, NodeId)>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "select distinct event_id, node_id from syncroute.outgoing_batch_event \
             where event_id between $1 and $2",
        )
        .bind(start_id)
        .bind(end_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(event_id, node_id)| (event_id, NodeId::new(node_id)))
            .collect())
    }

    async fn get_deliverable_batches(&self, node_id: &NodeId) -> SyncResult<Vec<OutgoingBatch>> {
        let rows: Vec<BatchRow> = sqlx::query_as(&format!(
            "select {BATCH_COLUMNS} from syncroute.outgoing_batch \
             where node_id = $1 and status in ('queued', 'sent', 'error', 'resend') \
             order by batch_id"
        ))
        .bind(node_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(OutgoingBatch::try_from).collect()
    }

    async fn get_in_flight_counts(&self, node_id: &NodeId) -> SyncResult<HashMap<ChannelId, usize>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "select channel_id, count(*) from syncroute.outgoing_batch \
             where node_id = $1 and status = 'sent' group by channel_id",
        )
        .bind(node_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(channel_id, count)| (ChannelId::new(channel_id), count.max(0) as usize))
            .collect())
    }

    async fn update_batch_status(
        &self,
        node_id: &NodeId,
        batch_id: BatchId,
        status: BatchStatus,
    ) -> SyncResult<OutgoingBatch> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> = sqlx::query_scalar(
            "select status from syncroute.outgoing_batch \
             where node_id = $1 and batch_id = $2 for update",
        )
        .bind(node_id.as_str())
        .bind(batch_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(current) = current else {
            bail!(
                ErrorKind::BatchNotFound,
                "Outgoing batch not found",
                format!("batch {batch_id} of node `{node_id}` does not exist")
            );
        };
        let current: BatchStatus = current.parse()?;

        if !current.can_transition_to(status) {
            bail!(
                ErrorKind::InvalidBatchTransition,
                "Batch status transition is not allowed",
                format!("batch {batch_id} of node `{node_id}` cannot move from {current} to {status}")
            );
        }

        let row: BatchRow = sqlx::query_as(&format!(
            "update syncroute.outgoing_batch set status = $3, last_updated_at = now() \
             where node_id = $1 and batch_id = $2 returning {BATCH_COLUMNS}"
        ))
        .bind(node_id.as_str())
        .bind(batch_id)
        .bind(status.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        row.try_into()
    }

    async fn purge_acknowledged_batches(
        &self,
        older_than: DateTime<Utc>,
        below_event_id: EventId,
    ) -> SyncResult<u64> {
        let result = sqlx::query(
            "delete from syncroute.outgoing_batch b \
             where b.status = 'acked' and b.last_updated_at < $1 \
             and not exists (select 1 from syncroute.outgoing_batch_event e \
             where e.node_id = b.node_id and e.batch_id = b.batch_id and e.event_id >= $2)",
        )
        .bind(older_than)
        .bind(below_event_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

impl LeaseStore for PostgresStore {
    async fn try_acquire_lease(&self, name: &str, owner: &str, ttl: Duration) -> SyncResult<bool> {
        let holder: Option<String> = sqlx::query_scalar(
            "insert into syncroute.routing_lease (name, owner, expires_at) \
             values ($1, $2, now() + make_interval(secs => $3)) \
             on conflict (name) do update \
             set owner = excluded.owner, expires_at = excluded.expires_at \
             where routing_lease.owner = excluded.owner or routing_lease.expires_at <= now() \
             returning owner",
        )
        .bind(name)
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(holder.is_some())
    }

    async fn release_lease(&self, name: &str, owner: &str) -> SyncResult<bool> {
        let result = sqlx::query("delete from syncroute.routing_lease where name = $1 and owner = $2")
            .bind(name)
            .bind(owner)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
