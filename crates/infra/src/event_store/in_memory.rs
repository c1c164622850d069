//! In-memory event store for tests/dev.
//!
//! Implements the same contracts as the Postgres backend. The single write
//! lock plays the role of the relational uniqueness constraint: appends are
//! serialized, so a stale expected version is detected exactly where a
//! constraint violation would be, and the whole batch is rejected with no
//! partial writes.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use tidemark_core::{AggregateId, ExpectedVersion, TenantId};

use super::r#trait::{
    CatchUp, EventStore, EventStoreError, Snapshot, SnapshotStore, StoredEvent, UncommittedEvent,
    stream_id, validate_batch,
};
use crate::stream::TrackingToken;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    tenant_id: TenantId,
    aggregate_id: AggregateId,
}

#[derive(Debug, Default)]
struct LogInner {
    /// Global log in `global_sequence` order. Append-only.
    log: Vec<StoredEvent>,
    /// Stream index: maps stream key to positions in `log`.
    streams: HashMap<StreamKey, Vec<usize>>,
    /// Committed event ids, for duplicate-append detection.
    event_ids: HashSet<Uuid>,
    /// Live snapshot per stream key.
    snapshots: HashMap<StreamKey, Snapshot>,
    /// Last assigned `global_sequence` (0 when empty).
    last_global: u64,
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    inner: RwLock<LogInner>,
    /// Wakes blocked catch-up waiters after each committed append.
    append_signal: Notify,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn head_position(&self) -> Result<u64, EventStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;
        Ok(inner.last_global)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append_events(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        expected_version: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        validate_batch(tenant_id, aggregate_id, aggregate_type, &events)?;

        let key = StreamKey {
            tenant_id,
            aggregate_id,
        };

        {
            let mut inner = self
                .inner
                .write()
                .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

            let current = inner
                .streams
                .get(&key)
                .map(|positions| positions.len() as u64)
                .unwrap_or(0);

            if !expected_version.matches(current) {
                return Err(EventStoreError::Conflict(format!(
                    "expected {expected_version:?}, found {current}"
                )));
            }

            // Reject the whole batch before mutating anything.
            for e in &events {
                if inner.event_ids.contains(&e.event_id) {
                    return Err(EventStoreError::DuplicateEvent(e.event_id));
                }
            }

            let start_len = inner.log.len();
            let mut next_sequence = current + 1;
            for e in events {
                let global_sequence = inner.last_global + 1;
                let stored = StoredEvent {
                    global_sequence,
                    event_id: e.event_id,
                    stream_id: stream_id(&e.aggregate_type, e.aggregate_id),
                    tenant_id: e.tenant_id,
                    aggregate_id: e.aggregate_id,
                    aggregate_type: e.aggregate_type,
                    sequence_number: next_sequence,
                    event_type: e.event_type,
                    event_version: e.event_version,
                    occurred_at: e.occurred_at,
                    recorded_at: Utc::now(),
                    payload: e.payload,
                    metadata: e.metadata,
                };

                let position = inner.log.len();
                inner.event_ids.insert(stored.event_id);
                inner.streams.entry(key).or_default().push(position);
                inner.last_global = global_sequence;
                inner.log.push(stored);
                next_sequence += 1;
            }

            let committed = inner.log[start_len..].to_vec();

            drop(inner);
            self.append_signal.notify_waiters();
            Ok(committed)
        }
    }

    async fn read_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        from_sequence: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let key = StreamKey {
            tenant_id,
            aggregate_id,
        };

        let inner = self
            .inner
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        Ok(inner
            .streams
            .get(&key)
            .map(|positions| {
                positions
                    .iter()
                    .map(|&pos| &inner.log[pos])
                    .filter(|e| e.sequence_number > from_sequence)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl CatchUp for InMemoryEventStore {
    async fn read_batch(
        &self,
        token: TrackingToken,
        max_count: u32,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        // `log` is ordered by global_sequence, so the resume point is a
        // partition point, not a scan.
        let start = inner
            .log
            .partition_point(|e| token.covers(e.global_sequence));
        let end = start.saturating_add(max_count as usize).min(inner.log.len());
        Ok(inner.log[start..end].to_vec())
    }

    async fn wait_for_events(
        &self,
        token: TrackingToken,
        timeout: Duration,
    ) -> Result<bool, EventStoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register the waiter before checking the head so an append
            // between check and wait cannot be missed.
            let notified = self.append_signal.notified();
            if self.head_position()? > token.position() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(false),
            }
        }
    }

    async fn head_token(&self) -> Result<TrackingToken, EventStoreError> {
        Ok(TrackingToken::at(self.head_position()?))
    }
}

#[async_trait]
impl SnapshotStore for InMemoryEventStore {
    async fn save_snapshot(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        last_sequence_number: u64,
        state: JsonValue,
    ) -> Result<(), EventStoreError> {
        let key = StreamKey {
            tenant_id,
            aggregate_id,
        };

        let mut inner = self
            .inner
            .write()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        let version = inner
            .snapshots
            .get(&key)
            .map(|s| s.version + 1)
            .unwrap_or(1);
        inner.snapshots.insert(
            key,
            Snapshot {
                tenant_id,
                aggregate_id,
                last_sequence_number,
                state,
                version,
                recorded_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn load_snapshot(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Option<Snapshot>, EventStoreError> {
        let key = StreamKey {
            tenant_id,
            aggregate_id,
        };

        let inner = self
            .inner
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;
        Ok(inner.snapshots.get(&key).cloned())
    }
}
