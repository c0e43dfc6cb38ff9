//! Postgres-backed outbox store.
//!
//! Claims use `SELECT ... FOR UPDATE SKIP LOCKED` inside a single
//! `UPDATE ... RETURNING` statement, so concurrent workers (in any number of
//! processes) never receive the same row. Every other transition is a
//! conditional single-statement update.
//!
//! ## Error Mapping
//!
//! | SQLx Error | OutboxStoreError |
//! |------------|------------------|
//! | Database (any code) | `Storage` |
//! | PoolClosed, Io, Tls, other | `Storage` |
//! | ColumnDecode / ColumnNotFound | `Decode` |
//!
//! A row whose `status` or `locked_by` cannot be parsed is reported as `Decode`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, PgPool, Row};
use tracing::{Span, instrument};

use courier_core::{EventId, WorkerId};
use courier_events::{EventDraft, EventStatus, OutboxEvent};

use super::r#trait::{
    FailureRecord, OutboxStats, OutboxStore, OutboxStoreError, OutboxWriter, Transition,
};

const SCHEMA: &str = include_str!("../../migrations/0001_create_outbox_events.sql");

const COLUMNS: &str = "id, event_type, payload, occurred_at, status, attempts, last_error, \
                       next_retry_at, locked_by, locked_at, processed_at";

/// Postgres-backed outbox store.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `outbox_events` table and its indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), OutboxStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn fetch_events(
        &self,
        operation: &str,
        sql: &str,
        status: Option<EventStatus>,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let mut query = sqlx::query(sql);
        if let Some(status) = status {
            query = query.bind(status.as_str());
        }
        let rows = query
            .bind(clamp_limit(limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        decode_rows(rows)
    }
}

#[async_trait]
impl OutboxWriter<PgConnection> for PostgresOutboxStore {
    #[instrument(skip(self, uow, draft), fields(event_type = %draft.event_type), err)]
    async fn insert(
        &self,
        uow: &mut PgConnection,
        draft: EventDraft,
    ) -> Result<EventId, OutboxStoreError> {
        let id = EventId::new();

        sqlx::query(
            r#"
            INSERT INTO outbox_events (id, event_type, payload, occurred_at, status, attempts)
            VALUES ($1, $2, $3, $4, 'NEW', 0)
            "#,
        )
        .bind(id.as_uuid())
        .bind(&draft.event_type)
        .bind(&draft.payload)
        .bind(draft.occurred_at)
        .execute(&mut *uow)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        Ok(id)
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(skip(self, worker), fields(worker = %worker, claimed = tracing::field::Empty), err)]
    async fn claim_batch(
        &self,
        worker: &WorkerId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            WITH claimable AS (
                SELECT id
                FROM outbox_events
                WHERE status = 'NEW'
                   OR (status = 'FAILED' AND next_retry_at IS NOT NULL AND next_retry_at <= $1)
                ORDER BY occurred_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_events AS o
            SET status = 'PROCESSING', locked_by = $3, locked_at = $1
            FROM claimable
            WHERE o.id = claimable.id
            RETURNING {}
            "#,
            qualified_columns("o")
        );

        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(clamp_limit(limit))
            .bind(worker.as_str())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_batch", e))?;

        // RETURNING carries no ordering guarantee.
        let mut claimed = decode_rows(rows)?;
        claimed.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then(a.id.cmp(&b.id)));

        Span::current().record("claimed", claimed.len());
        Ok(claimed)
    }

    #[instrument(skip(self, worker), fields(event_id = %id, worker = %worker), err)]
    async fn mark_done(
        &self,
        id: EventId,
        worker: &WorkerId,
        processed_at: DateTime<Utc>,
    ) -> Result<Transition, OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'DONE',
                processed_at = $3,
                next_retry_at = NULL,
                locked_by = NULL,
                locked_at = NULL
            WHERE id = $1 AND status = 'PROCESSING' AND locked_by = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(worker.as_str())
        .bind(processed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_done", e))?;

        Ok(transition(result.rows_affected()))
    }

    #[instrument(
        skip(self, worker, failure),
        fields(event_id = %id, worker = %worker, attempts = failure.attempts),
        err
    )]
    async fn mark_failed(
        &self,
        id: EventId,
        worker: &WorkerId,
        failure: FailureRecord,
    ) -> Result<Transition, OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'FAILED',
                last_error = $3,
                attempts = GREATEST(attempts, $4),
                next_retry_at = $5,
                locked_by = NULL,
                locked_at = NULL
            WHERE id = $1 AND status = 'PROCESSING' AND locked_by = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(worker.as_str())
        .bind(&failure.error)
        .bind(i32::try_from(failure.attempts).unwrap_or(i32::MAX))
        .bind(failure.next_retry_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        Ok(transition(result.rows_affected()))
    }

    #[instrument(skip(self), err)]
    async fn release_stale_locks(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'FAILED',
                next_retry_at = $2,
                last_error = 'lock expired (held by ' || COALESCE(locked_by, 'unknown') || ')',
                locked_by = NULL,
                locked_at = NULL
            WHERE status = 'PROCESSING' AND locked_at < $1
            "#,
        )
        .bind(stale_before)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_stale_locks", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn get(&self, id: EventId) -> Result<Option<OutboxEvent>, OutboxStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM outbox_events WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| decode_row(&row)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_by_status(
        &self,
        status: EventStatus,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM outbox_events WHERE status = $1 \
             ORDER BY occurred_at ASC, id ASC LIMIT $2"
        );
        self.fetch_events("list_by_status", &sql, Some(status), limit)
            .await
    }

    #[instrument(skip(self), err)]
    async fn list_terminal_failures(
        &self,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM outbox_events \
             WHERE status = 'FAILED' AND next_retry_at IS NULL \
             ORDER BY occurred_at ASC, id ASC LIMIT $1"
        );
        self.fetch_events("list_terminal_failures", &sql, None, limit)
            .await
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'NEW') AS new,
                COUNT(*) FILTER (WHERE status = 'PROCESSING') AS processing,
                COUNT(*) FILTER (WHERE status = 'DONE') AS done,
                COUNT(*) FILTER (WHERE status = 'FAILED' AND next_retry_at IS NOT NULL) AS failed_retryable,
                COUNT(*) FILTER (WHERE status = 'FAILED' AND next_retry_at IS NULL) AS failed_terminal
            FROM outbox_events
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |column: &str| -> Result<u64, OutboxStoreError> {
            let value: i64 = row
                .try_get(column)
                .map_err(|e| map_sqlx_error("stats", e))?;
            Ok(value.max(0) as u64)
        };

        Ok(OutboxStats {
            new: count("new")?,
            processing: count("processing")?,
            done: count("done")?,
            failed_retryable: count("failed_retryable")?,
            failed_terminal: count("failed_terminal")?,
        })
    }
}

fn transition(rows_affected: u64) -> Transition {
    if rows_affected == 0 {
        Transition::Skipped
    } else {
        Transition::Applied
    }
}

fn clamp_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn qualified_columns(alias: &str) -> String {
    COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Map SQLx errors to `OutboxStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err
                .code()
                .map(|c| format!(" [{c}]"))
                .unwrap_or_default();
            OutboxStoreError::Storage(format!(
                "database error in {operation}{code}: {}",
                db_err.message()
            ))
        }
        sqlx::Error::ColumnDecode { index, source } => OutboxStoreError::Decode(format!(
            "column {index} could not be decoded in {operation}: {source}"
        )),
        sqlx::Error::ColumnNotFound(column) => {
            OutboxStoreError::Decode(format!("column {column} missing in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            OutboxStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => OutboxStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn decode_rows(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
    rows.iter().map(decode_row).collect()
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<OutboxEvent, OutboxStoreError> {
    let row = OutboxEventRow::from_row(row).map_err(|e| map_sqlx_error("decode_row", e))?;
    OutboxEvent::try_from(row)
}

// SQLx row types

#[derive(Debug)]
struct OutboxEventRow {
    id: uuid::Uuid,
    event_type: String,
    payload: serde_json::Value,
    occurred_at: DateTime<Utc>,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    next_retry_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    processed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for OutboxEventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxEventRow {
            id: row.try_get("id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            occurred_at: row.try_get("occurred_at")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            next_retry_at: row.try_get("next_retry_at")?,
            locked_by: row.try_get("locked_by")?,
            locked_at: row.try_get("locked_at")?,
            processed_at: row.try_get("processed_at")?,
        })
    }
}

impl TryFrom<OutboxEventRow> for OutboxEvent {
    type Error = OutboxStoreError;

    fn try_from(row: OutboxEventRow) -> Result<Self, Self::Error> {
        let status: EventStatus = row
            .status
            .parse()
            .map_err(|e| OutboxStoreError::Decode(format!("event {}: {e}", row.id)))?;
        let locked_by = row
            .locked_by
            .map(WorkerId::new)
            .transpose()
            .map_err(|e| OutboxStoreError::Decode(format!("event {}: {e}", row.id)))?;
        let attempts = u32::try_from(row.attempts).map_err(|_| {
            OutboxStoreError::Decode(format!(
                "event {}: negative attempts {}",
                row.id, row.attempts
            ))
        })?;

        Ok(OutboxEvent {
            id: EventId::from_uuid(row.id),
            event_type: row.event_type,
            payload: row.payload,
            occurred_at: row.occurred_at,
            status,
            attempts,
            last_error: row.last_error,
            next_retry_at: row.next_retry_at,
            locked_by,
            locked_at: row.locked_at,
            processed_at: row.processed_at,
        })
    }
}
