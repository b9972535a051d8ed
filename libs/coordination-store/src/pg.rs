//! PostgreSQL implementation of the coordination store.
//!
//! All batch semantics live in the `process_work_batch` function the schema
//! module installs; this type marshals requests into its JSONB parameters
//! and maps the reply back. The inspection queries are plain reads.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::associations::MessageAssociation;
use crate::batch::{WorkBatchReply, WorkBatchRequest};
use crate::error::{StoreError, StoreResult};
use crate::schema::SchemaConfig;
use crate::status::{work, CheckpointStatus};
use crate::types::{
    EventRecord, InboxMessageRow, NewOutboxMessage, OutboxMessageRow, PerspectiveCheckpoint,
    PerspectiveEventRow,
};
use crate::WorkStore;

/// Pending row counts per work table, for metrics gauges.
#[derive(Debug, Clone, Copy, Default)]
pub struct PendingStats {
    pub outbox: i64,
    pub inbox: i64,
    pub perspective: i64,
}

/// Postgres-backed [`WorkStore`].
pub struct PgWorkStore {
    pool: PgPool,
    schema: SchemaConfig,
    batch_sql: String,
}

impl PgWorkStore {
    pub fn new(pool: PgPool, schema: SchemaConfig) -> Self {
        let batch_sql = format!(
            "SELECT {}($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) AS reply",
            schema.batch_function()
        );
        Self {
            pool,
            schema,
            batch_sql,
        }
    }

    /// Create a store over a freshly built connection pool.
    pub async fn connect(config: &db_pool::DbConfig, schema: SchemaConfig) -> StoreResult<Self> {
        let pool = db_pool::create_pool(config)
            .await
            .context("Failed to create database pool")?;
        Ok(Self::new(pool, schema))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &SchemaConfig {
        &self.schema
    }

    /// Apply the full schema. Statements are idempotent, so this is safe to
    /// run at startup.
    pub async fn apply_schema(&self) -> StoreResult<()> {
        for statement in self.schema.statements() {
            sqlx::query(&statement.sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to apply schema statement {}", statement.name))?;
            debug!(statement = statement.name, "Schema statement applied");
        }
        info!(prefix = %self.schema.infra_prefix, "Coordination schema applied");
        Ok(())
    }

    /// Insert outbox rows inside a caller-owned transaction, so business
    /// writes and outbox rows commit or roll back together.
    pub async fn enqueue_outbox_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        messages: &[NewOutboxMessage],
    ) -> StoreResult<()> {
        let sql = format!(
            r#"
            INSERT INTO {} (message_id, destination, event_type, envelope_type, envelope, metadata,
                            stream_id, partition_number, is_event, status, attempts, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, 0, now())
            ON CONFLICT (message_id) DO NOTHING
            "#,
            self.schema.table("outbox")
        );
        for message in messages {
            sqlx::query(&sql)
                .bind(message.message_id)
                .bind(&message.destination)
                .bind(&message.event_type)
                .bind(&message.envelope_type)
                .bind(&message.envelope)
                .bind(&message.metadata)
                .bind(message.stream_id)
                .bind(message.partition_number)
                .bind(message.is_event)
                .execute(&mut **tx)
                .await
                .context("Failed to insert outbox message")?;
            debug!(
                message_id = %message.message_id,
                destination = %message.destination,
                is_event = message.is_event,
                "Outbox message enqueued"
            );
        }
        Ok(())
    }

    /// Insert outbox rows in their own transaction.
    pub async fn enqueue_outbox(&self, messages: &[NewOutboxMessage]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        self.enqueue_outbox_tx(&mut tx, messages).await?;
        tx.commit().await.context("Failed to commit outbox enqueue")?;
        Ok(())
    }

    /// Pending (claimable or leased, non-terminal) counts per work table.
    pub async fn pending_stats(&self) -> StoreResult<PendingStats> {
        let sql = format!(
            r#"
            SELECT
                (SELECT count(*) FROM {outbox} WHERE status & 28 = 0)::bigint AS outbox_pending,
                (SELECT count(*) FROM {inbox} WHERE status & 6 = 0)::bigint AS inbox_pending,
                (SELECT count(*) FROM {pe} WHERE status & 28 = 0)::bigint AS perspective_pending
            "#,
            outbox = self.schema.table("outbox"),
            inbox = self.schema.table("inbox"),
            pe = self.schema.perspective_table("events"),
        );
        let row = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await
            .context("Failed to compute pending stats")?;
        Ok(PendingStats {
            outbox: row.try_get("outbox_pending").unwrap_or(0),
            inbox: row.try_get("inbox_pending").unwrap_or(0),
            perspective: row.try_get("perspective_pending").unwrap_or(0),
        })
    }

    /// Return failed outbox rows to the claimable pool.
    pub async fn clear_outbox_failures(&self, message_ids: &[Uuid]) -> StoreResult<u64> {
        let sql = format!(
            "UPDATE {} SET status = status & ~8, last_error = NULL WHERE message_id = ANY($1) AND status & 8 = 8",
            self.schema.table("outbox")
        );
        let result = sqlx::query(&sql)
            .bind(message_ids)
            .execute(&self.pool)
            .await
            .context("Failed to clear outbox failures")?;
        Ok(result.rows_affected())
    }

    /// Return poisoned outbox rows to the claimable pool and reset their
    /// attempt counters.
    pub async fn requeue_outbox_poison(&self, message_ids: &[Uuid]) -> StoreResult<u64> {
        let sql = format!(
            "UPDATE {} SET status = status & ~16, attempts = 0, last_error = NULL WHERE message_id = ANY($1) AND status & 16 = 16",
            self.schema.table("outbox")
        );
        let result = sqlx::query(&sql)
            .bind(message_ids)
            .execute(&self.pool)
            .await
            .context("Failed to requeue poisoned outbox rows")?;
        Ok(result.rows_affected())
    }

    /// Reset a failed (stream, perspective) pair for redelivery.
    pub async fn clear_perspective_failure(
        &self,
        stream_id: Uuid,
        perspective_name: &str,
    ) -> StoreResult<u64> {
        let checkpoint_sql = format!(
            r#"
            UPDATE {} SET status = CASE WHEN last_event_id IS NULL THEN 0 ELSE 1 END, error = NULL
            WHERE stream_id = $1 AND perspective_name = $2 AND status = 2
            "#,
            self.schema.perspective_table("checkpoints")
        );
        sqlx::query(&checkpoint_sql)
            .bind(stream_id)
            .bind(perspective_name)
            .execute(&self.pool)
            .await
            .context("Failed to clear perspective checkpoint failure")?;

        let rows_sql = format!(
            "UPDATE {} SET status = status & ~8, last_error = NULL WHERE stream_id = $1 AND perspective_name = $2 AND status & 8 = 8",
            self.schema.perspective_table("events")
        );
        let result = sqlx::query(&rows_sql)
            .bind(stream_id)
            .bind(perspective_name)
            .execute(&self.pool)
            .await
            .context("Failed to clear failed perspective events")?;
        Ok(result.rows_affected())
    }

    /// Drop dedup ledger entries older than the cutoff. Run periodically to
    /// bound growth.
    pub async fn prune_dedup(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE first_seen_at < $1",
            self.schema.table("dedup")
        );
        let result = sqlx::query(&sql)
            .bind(older_than)
            .execute(&self.pool)
            .await
            .context("Failed to prune dedup ledger")?;
        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(deleted, cutoff = %older_than, "Pruned dedup ledger");
        }
        Ok(deleted)
    }
}

#[async_trait]
impl WorkStore for PgWorkStore {
    async fn process_batch(&self, request: WorkBatchRequest) -> StoreResult<WorkBatchReply> {
        let new_messages = serde_json::to_value(&request.new_messages)?;
        let transitions = serde_json::to_value(&request.transitions)?;
        let lease_seconds = request.options.lease_duration.as_secs().min(i32::MAX as u64) as i32;

        let reply: serde_json::Value = sqlx::query_scalar(&self.batch_sql)
            .bind(request.instance.instance_id)
            .bind(&request.instance.service_name)
            .bind(&request.instance.host_name)
            .bind(request.instance.process_id)
            .bind(&request.instance.metadata)
            .bind(request.options.now)
            .bind(lease_seconds)
            .bind(request.options.partition_count)
            .bind(&request.options.partitions)
            .bind(request.options.batch_size)
            .bind(&new_messages)
            .bind(&transitions)
            .fetch_one(&self.pool)
            .await
            .context("process_work_batch call failed")?;

        let reply: WorkBatchReply = serde_json::from_value(reply)?;
        debug!(
            outbox = reply.outbox_work.len(),
            inbox = reply.inbox_work.len(),
            perspective = reply.perspective_work.len(),
            "Work batch processed"
        );
        Ok(reply)
    }

    async fn register_associations(
        &self,
        associations: &[MessageAssociation],
    ) -> StoreResult<()> {
        let sql = format!(
            r#"
            INSERT INTO {table} (message_type, association_type, target_name, service_name, normalized_type)
            VALUES ($1, $2, $3, $4, {norm}($1))
            ON CONFLICT (message_type, association_type, target_name) DO UPDATE
                SET service_name = excluded.service_name,
                    normalized_type = excluded.normalized_type
            "#,
            table = self.schema.table("message_associations"),
            norm = self.schema.table("normalize_message_type"),
        );
        for association in associations {
            sqlx::query(&sql)
                .bind(&association.message_type)
                .bind(association.association_type.as_i16())
                .bind(&association.target_name)
                .bind(&association.service_name)
                .execute(&self.pool)
                .await
                .context("Failed to register message association")?;
        }
        info!(count = associations.len(), "Message associations registered");
        Ok(())
    }

    async fn record_receptor_processing(
        &self,
        event_id: Uuid,
        receptor_name: &str,
        error: Option<&str>,
    ) -> StoreResult<bool> {
        let status = if error.is_none() {
            work::COMPLETED
        } else {
            work::FAILED
        };
        let sql = format!(
            r#"
            INSERT INTO {} (event_id, receptor_name, status, error, processed_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (event_id, receptor_name) DO NOTHING
            "#,
            self.schema.table("receptor_processing")
        );
        let result = sqlx::query(&sql)
            .bind(event_id)
            .bind(receptor_name)
            .bind(status)
            .bind(error)
            .execute(&self.pool)
            .await
            .context("Failed to record receptor processing")?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_events(&self, stream_id: Uuid) -> StoreResult<Vec<EventRecord>> {
        let sql = format!(
            r#"
            SELECT event_id, stream_id, aggregate_type, event_type, event_data, metadata, scope,
                   sequence_number, version, created_at
            FROM {}
            WHERE stream_id = $1
            ORDER BY version ASC
            "#,
            self.schema.table("events")
        );
        let rows = sqlx::query(&sql)
            .bind(stream_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to load events")?;
        rows.into_iter()
            .map(|row| {
                Ok(EventRecord {
                    event_id: row.try_get("event_id")?,
                    stream_id: row.try_get("stream_id")?,
                    aggregate_type: row.try_get("aggregate_type")?,
                    event_type: row.try_get("event_type")?,
                    event_data: row.try_get("event_data")?,
                    metadata: row.try_get("metadata")?,
                    scope: row.try_get("scope")?,
                    sequence_number: row.try_get("sequence_number")?,
                    version: row.try_get("version")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn checkpoint(
        &self,
        stream_id: Uuid,
        perspective_name: &str,
    ) -> StoreResult<Option<PerspectiveCheckpoint>> {
        let sql = format!(
            r#"
            SELECT stream_id, perspective_name, last_event_id, status, error, processed_at
            FROM {}
            WHERE stream_id = $1 AND perspective_name = $2
            "#,
            self.schema.perspective_table("checkpoints")
        );
        let row = sqlx::query(&sql)
            .bind(stream_id)
            .bind(perspective_name)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load checkpoint")?;
        row.map(|row| {
            Ok::<_, sqlx::Error>(PerspectiveCheckpoint {
                stream_id: row.try_get("stream_id")?,
                perspective_name: row.try_get("perspective_name")?,
                last_event_id: row.try_get("last_event_id")?,
                status: CheckpointStatus::from_i16(row.try_get("status")?),
                error: row.try_get("error")?,
                processed_at: row.try_get("processed_at")?,
            })
        })
        .transpose()
        .map_err(StoreError::from)
    }

    async fn perspective_events(
        &self,
        stream_id: Uuid,
        perspective_name: &str,
    ) -> StoreResult<Vec<PerspectiveEventRow>> {
        let sql = format!(
            r#"
            SELECT event_work_id, stream_id, perspective_name, event_id, sequence_number, status,
                   attempts, last_error, instance_id, lease_expiry, processed_at, created_at
            FROM {}
            WHERE stream_id = $1 AND perspective_name = $2
            ORDER BY sequence_number ASC
            "#,
            self.schema.perspective_table("events")
        );
        let rows = sqlx::query(&sql)
            .bind(stream_id)
            .bind(perspective_name)
            .fetch_all(&self.pool)
            .await
            .context("Failed to load perspective events")?;
        rows.into_iter()
            .map(|row| {
                Ok(PerspectiveEventRow {
                    event_work_id: row.try_get("event_work_id")?,
                    stream_id: row.try_get("stream_id")?,
                    perspective_name: row.try_get("perspective_name")?,
                    event_id: row.try_get("event_id")?,
                    sequence_number: row.try_get("sequence_number")?,
                    status: row.try_get("status")?,
                    attempts: row.try_get("attempts")?,
                    last_error: row.try_get("last_error")?,
                    instance_id: row.try_get("instance_id")?,
                    lease_expiry: row.try_get("lease_expiry")?,
                    processed_at: row.try_get("processed_at")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn outbox_message(&self, message_id: Uuid) -> StoreResult<Option<OutboxMessageRow>> {
        let sql = format!(
            r#"
            SELECT message_id, destination, event_type, envelope_type, envelope, metadata,
                   stream_id, partition_number, is_event, status, attempts, last_error,
                   instance_id, lease_expiry, created_at
            FROM {}
            WHERE message_id = $1
            "#,
            self.schema.table("outbox")
        );
        let row = sqlx::query(&sql)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load outbox message")?;
        row.map(|row| {
            Ok::<_, sqlx::Error>(OutboxMessageRow {
                message_id: row.try_get("message_id")?,
                destination: row.try_get("destination")?,
                event_type: row.try_get("event_type")?,
                envelope_type: row.try_get("envelope_type")?,
                envelope: row.try_get("envelope")?,
                metadata: row.try_get("metadata")?,
                stream_id: row.try_get("stream_id")?,
                partition_number: row.try_get("partition_number")?,
                is_event: row.try_get("is_event")?,
                status: row.try_get("status")?,
                attempts: row.try_get("attempts")?,
                last_error: row.try_get("last_error")?,
                instance_id: row.try_get("instance_id")?,
                lease_expiry: row.try_get("lease_expiry")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
        .map_err(StoreError::from)
    }

    async fn inbox_message(&self, message_id: Uuid) -> StoreResult<Option<InboxMessageRow>> {
        let sql = format!(
            r#"
            SELECT message_id, source, envelope, stream_id, status, attempts, last_error,
                   instance_id, lease_expiry, received_at
            FROM {}
            WHERE message_id = $1
            "#,
            self.schema.table("inbox")
        );
        let row = sqlx::query(&sql)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load inbox message")?;
        row.map(|row| {
            Ok::<_, sqlx::Error>(InboxMessageRow {
                message_id: row.try_get("message_id")?,
                source: row.try_get("source")?,
                envelope: row.try_get("envelope")?,
                stream_id: row.try_get("stream_id")?,
                status: row.try_get("status")?,
                attempts: row.try_get("attempts")?,
                last_error: row.try_get("last_error")?,
                instance_id: row.try_get("instance_id")?,
                lease_expiry: row.try_get("lease_expiry")?,
                received_at: row.try_get("received_at")?,
            })
        })
        .transpose()
        .map_err(StoreError::from)
    }
}
