//! Postgres-backed event store implementation.
//!
//! Persists events append-only with tenant isolation and optimistic
//! concurrency enforced at the database level.
//!
//! ## Concurrency control
//!
//! For `ExpectedVersion::Exact(v)` the append never reads the current version
//! first. It inserts directly at `v + 1, v + 2, …` inside one transaction and
//! lets the unique constraint on `(tenant_id, aggregate_id, sequence_number)`
//! detect the race: a violation on the first row means a concurrent writer
//! already advanced the stream, the transaction rolls back (no partial rows),
//! and the caller gets [`EventStoreError::Conflict`]. Catching the constraint
//! violation *is* the concurrency check. This is designed behavior, not an
//! anti-pattern; it is the cheapest correct race detection and holds no locks
//! across round trips.
//!
//! `ExpectedVersion::Any` cannot know the next sequence number without one
//! in-transaction `MAX(sequence_number)` read; two racing `Any` writers are
//! still serialized by the same constraint and the loser maps to a conflict.
//!
//! ## Error Mapping
//!
//! | SQLx error | PG code / constraint | EventStoreError |
//! |---|---|---|
//! | unique violation on `events_stream_revision_key` | `23505` | `Conflict` |
//! | unique violation on `events_event_id_key` | `23505` | `DuplicateEvent` |
//! | check/not-null violation | `23514`/`23502` | `Validation` |
//! | pool closed / io / protocol | n/a | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use tidemark_core::{AggregateId, ExpectedVersion, TenantId};
use tidemark_events::EventMetadata;

use super::r#trait::{
    CatchUp, EventStore, EventStoreError, Snapshot, SnapshotStore, StoredEvent, UncommittedEvent,
    stream_id, validate_batch,
};
use crate::stream::TrackingToken;

/// Connection settings for the Postgres backend.
#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub url: String,
    pub max_connections: u32,
    /// Interval between head checks while a catch-up wait blocks.
    pub poll_interval: Duration,
}

impl PgStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// Postgres-backed append-only event store.
///
/// Clone-cheap: all clones share one connection pool. Connections are
/// acquired per operation and released on every exit path; nothing is held
/// across calls.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
    poll_interval: Duration,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            poll_interval: Duration::from_millis(200),
        }
    }

    /// Connect a pool from config and apply the schema.
    pub async fn connect(config: &PgStoreConfig) -> Result<Self, EventStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| EventStoreError::Storage(format!("connect failed: {e}")))?;
        super::schema::apply_schema(&pool).await?;
        Ok(Self {
            pool: Arc::new(pool),
            poll_interval: config.poll_interval,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(
        skip(self, events),
        fields(
            tenant_id = %tenant_id,
            aggregate_id = %aggregate_id,
            event_count = events.len(),
            expected_version = ?expected_version,
        ),
        err
    )]
    async fn append_events(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        expected_version: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        validate_batch(tenant_id, aggregate_id, aggregate_type, &events)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // `Exact` goes straight to the insert: the stream-revision constraint
        // is the version check. `Any` needs the current version to know where
        // the batch lands.
        let base = match expected_version {
            ExpectedVersion::Exact(v) => v,
            ExpectedVersion::Any => {
                let row = sqlx::query(
                    r#"
                    SELECT COALESCE(MAX(sequence_number), 0) AS current_version
                    FROM events
                    WHERE tenant_id = $1 AND aggregate_id = $2
                    "#,
                )
                .bind(tenant_id.as_uuid())
                .bind(aggregate_id.as_uuid())
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("read_current_version", e))?;
                let current: i64 = row
                    .try_get("current_version")
                    .map_err(|e| EventStoreError::Storage(format!("failed to read current_version: {e}")))?;
                current as u64
            }
        };

        let derived_stream_id = stream_id(aggregate_type, aggregate_id);
        let mut stored_events = Vec::with_capacity(events.len());
        let mut next_sequence = base + 1;

        for event in events {
            let metadata_json = serde_json::to_value(&event.metadata).map_err(|e| {
                EventStoreError::Validation(format!("metadata serialization failed: {e}"))
            })?;

            let row = sqlx::query(
                r#"
                INSERT INTO events (
                    event_id,
                    stream_id,
                    aggregate_id,
                    aggregate_type,
                    tenant_id,
                    sequence_number,
                    event_type,
                    event_version,
                    payload,
                    metadata,
                    occurred_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                RETURNING global_sequence, recorded_at
                "#,
            )
            .bind(event.event_id)
            .bind(&derived_stream_id)
            .bind(aggregate_id.as_uuid())
            .bind(aggregate_type)
            .bind(tenant_id.as_uuid())
            .bind(next_sequence as i64)
            .bind(&event.event_type)
            .bind(event.event_version as i32)
            .bind(&event.payload)
            .bind(&metadata_json)
            .bind(event.occurred_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_insert_error(e, expected_version, next_sequence, event.event_id))?;

            let global_sequence: i64 = row
                .try_get("global_sequence")
                .map_err(|e| EventStoreError::Storage(format!("failed to read global_sequence: {e}")))?;
            let recorded_at: DateTime<Utc> = row
                .try_get("recorded_at")
                .map_err(|e| EventStoreError::Storage(format!("failed to read recorded_at: {e}")))?;

            stored_events.push(StoredEvent {
                global_sequence: global_sequence as u64,
                event_id: event.event_id,
                stream_id: derived_stream_id.clone(),
                tenant_id,
                aggregate_id,
                aggregate_type: aggregate_type.to_string(),
                sequence_number: next_sequence,
                event_type: event.event_type,
                event_version: event.event_version,
                occurred_at: event.occurred_at,
                recorded_at,
                payload: event.payload,
                metadata: event.metadata,
            });
            next_sequence += 1;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(stored_events)
    }

    #[instrument(
        skip(self),
        fields(tenant_id = %tenant_id, aggregate_id = %aggregate_id),
        err
    )]
    async fn read_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        from_sequence: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(SELECT_EVENT_COLUMNS_WHERE_STREAM)
            .bind(tenant_id.as_uuid())
            .bind(aggregate_id.as_uuid())
            .bind(from_sequence as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("read_stream", e))?;

        rows.into_iter().map(decode_event_row).collect()
    }
}

#[async_trait]
impl CatchUp for PostgresEventStore {
    #[instrument(skip(self), fields(token = %token), err)]
    async fn read_batch(
        &self,
        token: TrackingToken,
        max_count: u32,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(SELECT_EVENT_COLUMNS_WHERE_GLOBAL)
            .bind(token.position() as i64)
            .bind(max_count as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("read_batch", e))?;

        // Decode row by row: events before a malformed row are still
        // delivered; the malformed row itself surfaces (with its offset) on
        // the next call, once the consumer has advanced past the good ones.
        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            match decode_event_row(row) {
                Ok(event) => events.push(event),
                Err(err) if events.is_empty() => return Err(err),
                Err(_) => break,
            }
        }
        Ok(events)
    }

    async fn wait_for_events(
        &self,
        token: TrackingToken,
        timeout: Duration,
    ) -> Result<bool, EventStoreError> {
        // Bounded polling; no connection is held while sleeping, so a
        // cancelled wait releases its resources immediately.
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.head_token().await?.position() > token.position() {
                return Ok(true);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn head_token(&self) -> Result<TrackingToken, EventStoreError> {
        let row = sqlx::query("SELECT COALESCE(MAX(global_sequence), 0) AS head FROM events")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("head_token", e))?;
        let head: i64 = row
            .try_get("head")
            .map_err(|e| EventStoreError::Storage(format!("failed to read head: {e}")))?;
        Ok(TrackingToken::at(head as u64))
    }
}

#[async_trait]
impl SnapshotStore for PostgresEventStore {
    #[instrument(
        skip(self, state),
        fields(tenant_id = %tenant_id, aggregate_id = %aggregate_id),
        err
    )]
    async fn save_snapshot(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        last_sequence_number: u64,
        state: JsonValue,
    ) -> Result<(), EventStoreError> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (
                tenant_id,
                aggregate_id,
                last_sequence_number,
                state_payload
            )
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, aggregate_id)
            DO UPDATE SET
                last_sequence_number = EXCLUDED.last_sequence_number,
                state_payload = EXCLUDED.state_payload,
                version = snapshots.version + 1,
                recorded_at = NOW()
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(aggregate_id.as_uuid())
        .bind(last_sequence_number as i64)
        .bind(&state)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_snapshot", e))?;

        Ok(())
    }

    #[instrument(
        skip(self),
        fields(tenant_id = %tenant_id, aggregate_id = %aggregate_id),
        err
    )]
    async fn load_snapshot(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Option<Snapshot>, EventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                tenant_id,
                aggregate_id,
                last_sequence_number,
                state_payload,
                version,
                recorded_at
            FROM snapshots
            WHERE tenant_id = $1 AND aggregate_id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(aggregate_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_snapshot", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        // A snapshot that fails to decode is reported as corrupt, never as a
        // crash: callers fall back to full replay.
        let decode = |e: sqlx::Error| EventStoreError::CorruptSnapshot {
            aggregate_id,
            detail: e.to_string(),
        };
        let last_sequence_number: i64 = row.try_get("last_sequence_number").map_err(decode)?;
        let state: JsonValue = row.try_get("state_payload").map_err(decode)?;
        let version: i64 = row.try_get("version").map_err(decode)?;
        let recorded_at: DateTime<Utc> = row.try_get("recorded_at").map_err(decode)?;

        Ok(Some(Snapshot {
            tenant_id,
            aggregate_id,
            last_sequence_number: last_sequence_number as u64,
            state,
            version: version as u64,
            recorded_at,
        }))
    }
}

const SELECT_EVENT_COLUMNS_WHERE_STREAM: &str = r#"
    SELECT
        global_sequence,
        event_id,
        stream_id,
        aggregate_id,
        aggregate_type,
        tenant_id,
        sequence_number,
        event_type,
        event_version,
        payload,
        metadata,
        occurred_at,
        recorded_at
    FROM events
    WHERE tenant_id = $1 AND aggregate_id = $2 AND sequence_number > $3
    ORDER BY sequence_number ASC
"#;

const SELECT_EVENT_COLUMNS_WHERE_GLOBAL: &str = r#"
    SELECT
        global_sequence,
        event_id,
        stream_id,
        aggregate_id,
        aggregate_type,
        tenant_id,
        sequence_number,
        event_type,
        event_version,
        payload,
        metadata,
        occurred_at,
        recorded_at
    FROM events
    WHERE global_sequence > $1
    ORDER BY global_sequence ASC
    LIMIT $2
"#;

fn decode_event_row(row: sqlx::postgres::PgRow) -> Result<StoredEvent, EventStoreError> {
    let global_sequence: i64 = row
        .try_get("global_sequence")
        .map_err(|e| EventStoreError::Storage(format!("failed to read global_sequence: {e}")))?;

    let malformed = |detail: String| EventStoreError::MalformedRow {
        global_sequence: global_sequence as u64,
        detail,
    };

    let event_id: Uuid = row.try_get("event_id").map_err(|e| malformed(e.to_string()))?;
    let stream_id: String = row.try_get("stream_id").map_err(|e| malformed(e.to_string()))?;
    let aggregate_id: Uuid = row
        .try_get("aggregate_id")
        .map_err(|e| malformed(e.to_string()))?;
    let aggregate_type: String = row
        .try_get("aggregate_type")
        .map_err(|e| malformed(e.to_string()))?;
    let tenant_id: Uuid = row.try_get("tenant_id").map_err(|e| malformed(e.to_string()))?;
    let sequence_number: i64 = row
        .try_get("sequence_number")
        .map_err(|e| malformed(e.to_string()))?;
    let event_type: String = row
        .try_get("event_type")
        .map_err(|e| malformed(e.to_string()))?;
    let event_version: i32 = row
        .try_get("event_version")
        .map_err(|e| malformed(e.to_string()))?;
    let payload: JsonValue = row.try_get("payload").map_err(|e| malformed(e.to_string()))?;
    let metadata_json: JsonValue = row.try_get("metadata").map_err(|e| malformed(e.to_string()))?;
    let occurred_at: DateTime<Utc> = row
        .try_get("occurred_at")
        .map_err(|e| malformed(e.to_string()))?;
    let recorded_at: DateTime<Utc> = row
        .try_get("recorded_at")
        .map_err(|e| malformed(e.to_string()))?;

    let metadata: EventMetadata = serde_json::from_value(metadata_json)
        .map_err(|e| malformed(format!("metadata failed to deserialize: {e}")))?;

    Ok(StoredEvent {
        global_sequence: global_sequence as u64,
        event_id,
        stream_id,
        tenant_id: TenantId::from_uuid(tenant_id),
        aggregate_id: AggregateId::from_uuid(aggregate_id),
        aggregate_type,
        sequence_number: sequence_number as u64,
        event_type,
        event_version: event_version as u32,
        occurred_at,
        recorded_at,
        payload,
        metadata,
    })
}

/// Map an insert failure, turning the stream-revision constraint violation
/// into the optimistic-concurrency verdict and the event-id constraint into
/// an idempotence signal.
fn map_insert_error(
    err: sqlx::Error,
    expected_version: ExpectedVersion,
    sequence_number: u64,
    event_id: Uuid,
) -> EventStoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return match db_err.constraint() {
                Some("events_event_id_key") => EventStoreError::DuplicateEvent(event_id),
                _ => EventStoreError::Conflict(format!(
                    "concurrent append detected: sequence_number {sequence_number} already \
                     exists (expected {expected_version:?})"
                )),
            };
        }
    }
    map_sqlx_error("insert_event", err)
}

/// Map SQLx errors to the store taxonomy.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                // Unique violation outside the insert path still means a
                // concurrent writer won.
                Some("23505") => EventStoreError::Conflict(msg),
                // Check / not-null violations are malformed input.
                Some("23514") | Some("23502") => EventStoreError::Validation(msg),
                _ => EventStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            EventStoreError::Storage(format!("connection pool unavailable in {operation}"))
        }
        sqlx::Error::Io(e) => EventStoreError::Storage(format!("io error in {operation}: {e}")),
        other => EventStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_closed_maps_to_transient_storage() {
        let err = map_sqlx_error("append", sqlx::Error::PoolClosed);
        assert!(matches!(err, EventStoreError::Storage(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn row_not_found_maps_to_storage() {
        let err = map_sqlx_error("read_stream", sqlx::Error::RowNotFound);
        assert!(matches!(err, EventStoreError::Storage(_)));
    }

    #[test]
    fn config_defaults_are_sane() {
        let config = PgStoreConfig::new("postgres://localhost/tidemark");
        assert_eq!(config.max_connections, 10);
        assert!(config.poll_interval > Duration::ZERO);
    }
}
