//! Event store database schema.
//!
//! `global_sequence` is an identity column: monotonic and unique, with gaps
//! allowed (a rolled-back append burns values). Consumers compare positions,
//! they never count rows, so gaps are harmless.
//!
//! The unique constraint on `(tenant_id, aggregate_id, sequence_number)` is
//! load-bearing: it is the optimistic-concurrency check. An insert at
//! `expected + 1` that violates it means a concurrent writer advanced the
//! stream first.

use sqlx::PgPool;

use super::r#trait::EventStoreError;

/// SQL to create the append-only event log.
pub const CREATE_EVENTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS events (
    global_sequence  BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    event_id         UUID NOT NULL,
    stream_id        VARCHAR(512) NOT NULL,
    aggregate_id     UUID NOT NULL,
    aggregate_type   VARCHAR(255) NOT NULL,
    tenant_id        UUID NOT NULL,
    sequence_number  BIGINT NOT NULL CHECK (sequence_number > 0),
    event_type       VARCHAR(255) NOT NULL,
    event_version    INT NOT NULL DEFAULT 1,
    payload          JSONB NOT NULL,
    metadata         JSONB NOT NULL DEFAULT '{}',
    occurred_at      TIMESTAMPTZ NOT NULL,
    recorded_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT events_event_id_key UNIQUE (event_id),
    CONSTRAINT events_stream_revision_key UNIQUE (tenant_id, aggregate_id, sequence_number)
);

CREATE INDEX IF NOT EXISTS idx_events_stream
    ON events (stream_id, sequence_number);

CREATE INDEX IF NOT EXISTS idx_events_tenant_event_type
    ON events (tenant_id, event_type);
";

/// SQL to create the snapshot store (one live row per aggregate).
pub const CREATE_SNAPSHOTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS snapshots (
    tenant_id            UUID NOT NULL,
    aggregate_id         UUID NOT NULL,
    last_sequence_number BIGINT NOT NULL,
    state_payload        JSONB NOT NULL,
    version              BIGINT NOT NULL DEFAULT 1,
    recorded_at          TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (tenant_id, aggregate_id)
);
";

/// SQL to create the per-consumer tracking-token store.
pub const CREATE_CONSUMER_OFFSETS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS consumer_offsets (
    consumer_name VARCHAR(255) PRIMARY KEY,
    token         BIGINT NOT NULL,
    updated_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
";

/// Apply the full schema (idempotent).
pub async fn apply_schema(pool: &PgPool) -> Result<(), EventStoreError> {
    for ddl in [
        CREATE_EVENTS_TABLE,
        CREATE_SNAPSHOTS_TABLE,
        CREATE_CONSUMER_OFFSETS_TABLE,
    ] {
        sqlx::raw_sql(ddl)
            .execute(pool)
            .await
            .map_err(|e| EventStoreError::Storage(format!("schema apply failed: {e}")))?;
    }
    Ok(())
}
