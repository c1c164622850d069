use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use tidemark_core::{AggregateId, ExpectedVersion, TenantId};
use tidemark_events::{EventEnvelope, EventMetadata, MissingTenant};

use crate::stream::TrackingToken;

/// Upper bound on a single event's serialized payload.
pub const MAX_PAYLOAD_BYTES: usize = 256 * 1024;

/// Derived stream key grouping the events of one aggregate instance.
pub fn stream_id(aggregate_type: &str, aggregate_id: AggregateId) -> String {
    format!("{aggregate_type}-{aggregate_id}")
}

/// An event ready to be appended (no sequence numbers assigned yet).
///
/// The append engine assigns `sequence_number` and `global_sequence` during
/// the atomic insert; callers never embed positions. `metadata` arrives
/// pre-stamped by the outbound interceptor chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
    pub metadata: EventMetadata,
}

impl UncommittedEvent {
    /// Build an uncommitted event from a typed domain event.
    ///
    /// Serializes the payload, captures the event's own type/version/time
    /// metadata, and attaches the stamped correlation metadata.
    pub fn from_typed<E>(
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_id: Uuid,
        metadata: EventMetadata,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: tidemark_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event).map_err(|e| {
            EventStoreError::Validation(format!("payload serialization failed: {e}"))
        })?;

        Ok(Self {
            event_id,
            tenant_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
            metadata,
        })
    }
}

/// A committed event with engine-assigned positions.
///
/// `sequence_number` is 1-based and contiguous per `(tenant_id,
/// aggregate_id)`. `global_sequence` totally orders the whole log and is
/// monotonic with gaps allowed (identity column; rollbacks burn values).
/// `recorded_at` is server-assigned at insert time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub global_sequence: u64,
    pub event_id: Uuid,
    pub stream_id: String,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,

    pub payload: JsonValue,
    pub metadata: EventMetadata,
}

impl StoredEvent {
    pub fn stream_version(&self) -> u64 {
        self.sequence_number
    }

    /// Convert into a tenant-scoped envelope for delivery to consumers.
    pub fn to_envelope(&self) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            self.event_id,
            self.tenant_id,
            self.aggregate_id,
            self.aggregate_type.clone(),
            self.sequence_number,
            self.global_sequence,
            self.recorded_at,
            self.metadata.clone(),
            self.payload.clone(),
        )
    }
}

/// Latest materialized state checkpoint for one aggregate.
///
/// One live snapshot per `(tenant_id, aggregate_id)`; `version` counts
/// overwrites and is informational, not an optimistic lock: snapshots are a
/// cache, the event log is the source of truth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub last_sequence_number: u64,
    pub state: JsonValue,
    pub version: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Event store operation error.
///
/// Infrastructure failures only; deterministic domain failures live in
/// `DomainError`. Conflicts and validation errors always surface to the
/// append caller synchronously; they are never logged-and-swallowed.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// Expected version is stale; reload state and retry the whole command.
    #[error("optimistic concurrency conflict: {0}")]
    Conflict(String),

    /// Cross-tenant access attempted. Fatal for the unit of work.
    #[error("tenant mismatch: {0}")]
    TenantMismatch(String),

    /// The unit of work has no resolvable tenant. Fatal, never retried.
    #[error("no tenant available for the current unit of work")]
    MissingTenant,

    /// Malformed input (empty batch, mixed streams, oversized payload).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The `event_id` already exists: a prior append attempt committed.
    #[error("duplicate event_id {0}: a previous append attempt already committed")]
    DuplicateEvent(Uuid),

    /// A historical row failed to decode. Carries the offset so catch-up
    /// consumers can decide skip-vs-abort without losing their position.
    #[error("malformed stored event at global sequence {global_sequence}: {detail}")]
    MalformedRow { global_sequence: u64, detail: String },

    /// Snapshot failed to decode on load; callers fall back to full replay.
    #[error("snapshot for aggregate {aggregate_id} is corrupt: {detail}")]
    CorruptSnapshot {
        aggregate_id: AggregateId,
        detail: String,
    },

    /// Transient infrastructure failure; safe to retry with backoff. The
    /// engine itself never retries writes: a blind retry risks duplicate
    /// application, so callers retry via `event_id` idempotence or after
    /// re-deriving the expected version.
    #[error("storage unavailable: {0}")]
    Storage(String),
}

impl EventStoreError {
    /// Whether a caller may retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, EventStoreError::Storage(_))
    }
}

impl From<MissingTenant> for EventStoreError {
    fn from(_: MissingTenant) -> Self {
        EventStoreError::MissingTenant
    }
}

/// Append-only, tenant-scoped event store.
///
/// Events are organized into streams keyed by `(tenant_id, aggregate_id)`;
/// within a stream, sequence numbers are 1-based and gapless. Implementations
/// must:
/// - enforce tenant isolation on both read and write
/// - enforce optimistic concurrency without a locking read (the uniqueness
///   constraint on the first inserted row is the conflict check)
/// - persist a batch atomically (all rows or none)
/// - assign `global_sequence` monotonically from the storage engine
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a batch to one aggregate stream.
    ///
    /// Sequence numbers `expected + 1, expected + 2, …` are assigned in batch
    /// order. A stale `ExpectedVersion::Exact` fails with
    /// [`EventStoreError::Conflict`] and leaves no partial rows.
    async fn append_events(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        expected_version: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Read a stream in ascending `sequence_number` order, restricted to the
    /// given tenant, starting after `from_sequence` (0 reads from the start).
    ///
    /// Re-issuing the same call with the same arguments is idempotent.
    async fn read_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        from_sequence: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;
}

/// Global catch-up surface over the whole log.
///
/// Spans all tenants by design: the total order is single, every delivered
/// event carries its own `tenant_id`, and consumers re-establish tenant
/// context per event before invoking business logic.
#[async_trait]
pub trait CatchUp: Send + Sync {
    /// Read up to `max_count` events past `token`, ordered by
    /// `global_sequence`.
    ///
    /// When a malformed row is hit, events decoded before it are returned;
    /// the next call reports [`EventStoreError::MalformedRow`] with its
    /// offset so the consumer can decide skip-vs-abort.
    async fn read_batch(
        &self,
        token: TrackingToken,
        max_count: u32,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Block until an event past `token` exists, up to `timeout`.
    ///
    /// Returns `true` when new rows may exist, `false` on timeout. Holds no
    /// connection while waiting; cancelling the wait is always safe.
    async fn wait_for_events(
        &self,
        token: TrackingToken,
        timeout: Duration,
    ) -> Result<bool, EventStoreError>;

    /// Token positioned after the newest committed event ("start from now").
    async fn head_token(&self) -> Result<TrackingToken, EventStoreError>;

    /// Token positioned before the oldest event ("start from the beginning").
    async fn tail_token(&self) -> Result<TrackingToken, EventStoreError> {
        Ok(TrackingToken::ORIGIN)
    }
}

/// Latest-checkpoint store for aggregate state.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Atomically upsert the snapshot for `(tenant_id, aggregate_id)`.
    ///
    /// Last-writer-wins; no optimistic check. A torn write must never be
    /// observable.
    async fn save_snapshot(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        last_sequence_number: u64,
        state: JsonValue,
    ) -> Result<(), EventStoreError>;

    /// Load the live snapshot, or `None` when the aggregate has none yet.
    async fn load_snapshot(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Option<Snapshot>, EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append_events(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        expected_version: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self)
            .append_events(tenant_id, aggregate_id, aggregate_type, expected_version, events)
            .await
    }

    async fn read_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        from_sequence: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self)
            .read_stream(tenant_id, aggregate_id, from_sequence)
            .await
    }
}

#[async_trait]
impl<S> CatchUp for Arc<S>
where
    S: CatchUp + ?Sized,
{
    async fn read_batch(
        &self,
        token: TrackingToken,
        max_count: u32,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).read_batch(token, max_count).await
    }

    async fn wait_for_events(
        &self,
        token: TrackingToken,
        timeout: Duration,
    ) -> Result<bool, EventStoreError> {
        (**self).wait_for_events(token, timeout).await
    }

    async fn head_token(&self) -> Result<TrackingToken, EventStoreError> {
        (**self).head_token().await
    }

    async fn tail_token(&self) -> Result<TrackingToken, EventStoreError> {
        (**self).tail_token().await
    }
}

#[async_trait]
impl<S> SnapshotStore for Arc<S>
where
    S: SnapshotStore + ?Sized,
{
    async fn save_snapshot(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        last_sequence_number: u64,
        state: JsonValue,
    ) -> Result<(), EventStoreError> {
        (**self)
            .save_snapshot(tenant_id, aggregate_id, last_sequence_number, state)
            .await
    }

    async fn load_snapshot(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Option<Snapshot>, EventStoreError> {
        (**self).load_snapshot(tenant_id, aggregate_id).await
    }
}

/// Shared append-side validation, identical across backends.
///
/// All events in a batch must target the call's tenant + aggregate stream,
/// and payloads must fit [`MAX_PAYLOAD_BYTES`].
pub(crate) fn validate_batch(
    tenant_id: TenantId,
    aggregate_id: AggregateId,
    aggregate_type: &str,
    events: &[UncommittedEvent],
) -> Result<(), EventStoreError> {
    if events.is_empty() {
        return Err(EventStoreError::Validation(
            "append batch must not be empty".to_string(),
        ));
    }

    for (idx, e) in events.iter().enumerate() {
        if e.tenant_id != tenant_id {
            return Err(EventStoreError::TenantMismatch(format!(
                "event at index {idx} targets tenant {}, call is scoped to {}",
                e.tenant_id, tenant_id
            )));
        }
        if let Some(stamped) = e.metadata.tenant_id {
            if stamped != tenant_id {
                return Err(EventStoreError::TenantMismatch(format!(
                    "metadata at index {idx} is stamped for tenant {stamped}, call is scoped to {tenant_id}"
                )));
            }
        }
        if e.aggregate_id != aggregate_id {
            return Err(EventStoreError::Validation(format!(
                "batch contains multiple aggregate_ids (index {idx})"
            )));
        }
        if e.aggregate_type != aggregate_type {
            return Err(EventStoreError::Validation(format!(
                "batch contains multiple aggregate_types (index {idx})"
            )));
        }
        if e.event_type.is_empty() {
            return Err(EventStoreError::Validation(format!(
                "event type must not be empty (index {idx})"
            )));
        }
        let payload_len = serde_json::to_vec(&e.payload)
            .map_err(|err| EventStoreError::Validation(format!("unserializable payload: {err}")))?
            .len();
        if payload_len > MAX_PAYLOAD_BYTES {
            return Err(EventStoreError::Validation(format!(
                "payload at index {idx} is {payload_len} bytes, limit is {MAX_PAYLOAD_BYTES}"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uncommitted(tenant_id: TenantId, aggregate_id: AggregateId) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            tenant_id,
            aggregate_id,
            aggregate_type: "billing.invoice".to_string(),
            event_type: "billing.invoice.issued".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: serde_json::json!({"amount": 10}),
            metadata: EventMetadata::for_tenant(tenant_id),
        }
    }

    #[test]
    fn stream_id_joins_type_and_id() {
        let aggregate_id = AggregateId::new();
        assert_eq!(
            stream_id("billing.invoice", aggregate_id),
            format!("billing.invoice-{aggregate_id}")
        );
    }

    #[test]
    fn empty_batch_is_rejected() {
        let err =
            validate_batch(TenantId::new(), AggregateId::new(), "billing.invoice", &[]).unwrap_err();
        assert!(matches!(err, EventStoreError::Validation(_)));
    }

    #[test]
    fn foreign_tenant_in_batch_is_a_tenant_mismatch() {
        let tenant = TenantId::new();
        let aggregate = AggregateId::new();
        let foreign = uncommitted(TenantId::new(), aggregate);

        let err = validate_batch(tenant, aggregate, "billing.invoice", &[foreign]).unwrap_err();
        assert!(matches!(err, EventStoreError::TenantMismatch(_)));
    }

    #[test]
    fn foreign_tenant_in_metadata_is_a_tenant_mismatch() {
        let tenant = TenantId::new();
        let aggregate = AggregateId::new();
        let mut event = uncommitted(tenant, aggregate);
        event.metadata.tenant_id = Some(TenantId::new());

        let err = validate_batch(tenant, aggregate, "billing.invoice", &[event]).unwrap_err();
        assert!(matches!(err, EventStoreError::TenantMismatch(_)));
    }

    #[test]
    fn mixed_aggregates_are_rejected() {
        let tenant = TenantId::new();
        let aggregate = AggregateId::new();
        let stray = uncommitted(tenant, AggregateId::new());

        let err = validate_batch(tenant, aggregate, "billing.invoice", &[stray]).unwrap_err();
        assert!(matches!(err, EventStoreError::Validation(_)));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let tenant = TenantId::new();
        let aggregate = AggregateId::new();
        let mut event = uncommitted(tenant, aggregate);
        event.payload = serde_json::Value::String("x".repeat(MAX_PAYLOAD_BYTES + 1));

        let err = validate_batch(tenant, aggregate, "billing.invoice", &[event]).unwrap_err();
        assert!(matches!(err, EventStoreError::Validation(_)));
    }

    #[test]
    fn only_storage_errors_are_transient() {
        assert!(EventStoreError::Storage("pool closed".into()).is_transient());
        assert!(!EventStoreError::Conflict("stale".into()).is_transient());
        assert!(!EventStoreError::MissingTenant.is_transient());
    }

    #[test]
    fn stored_event_converts_to_envelope() {
        let tenant = TenantId::new();
        let aggregate = AggregateId::new();
        let stored = StoredEvent {
            global_sequence: 17,
            event_id: Uuid::now_v7(),
            stream_id: stream_id("billing.invoice", aggregate),
            tenant_id: tenant,
            aggregate_id: aggregate,
            aggregate_type: "billing.invoice".to_string(),
            sequence_number: 3,
            event_type: "billing.invoice.issued".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            recorded_at: Utc::now(),
            payload: serde_json::json!({"amount": 10}),
            metadata: EventMetadata::for_tenant(tenant),
        };

        let envelope = stored.to_envelope();
        assert_eq!(envelope.tenant_id(), tenant);
        assert_eq!(envelope.sequence_number(), 3);
        assert_eq!(envelope.global_sequence(), 17);
        assert_eq!(envelope.payload(), &stored.payload);
    }
}
