//! Command execution pipeline (application-level orchestration).
//!
//! Orchestrates the full event-sourced lifecycle for one command:
//!
//! ```text
//! Command
//!   ↓
//! 1. Outbound interceptors (tenant + correlation stamping, from context)
//!   ↓
//! 2. Load snapshot (corrupt → fall back to full replay)
//!   ↓
//! 3. Read remaining events (tenant-scoped, after the snapshot)
//!   ↓
//! 4. Rehydrate aggregate, handle command (pure decision logic)
//!   ↓
//! 5. Append with Exact(version) (atomic, optimistic)
//!   ↓
//! 6. Publish committed envelopes to the bus (only after append)
//! ```
//!
//! The dispatcher composes the `EventStore`/`SnapshotStore`/`EventBus` traits
//! and contains no IO of its own. Handlers never see `tenant_id`; the
//! interceptor chain resolves it from [`TenantContext`] before any IO runs,
//! and every engine call then receives it explicitly.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::warn;
use uuid::Uuid;

use tidemark_core::{Aggregate, AggregateId, DomainError, ExpectedVersion, TenantId};
use tidemark_events::{
    CommandEnvelope, CommandPipeline, CorrelationStamping, EventBus, EventEnvelope, MissingTenant,
    TenantStamping,
};

use crate::event_store::{
    EventStore, EventStoreError, SnapshotStore, StoredEvent, UncommittedEvent,
};

#[derive(Debug)]
pub enum DispatchError {
    /// Optimistic concurrency failure (stale aggregate version). Reload and
    /// retry the whole command, not just the write.
    Concurrency(String),
    /// Tenant isolation violation (cross-tenant stream access).
    TenantIsolation(String),
    /// The command had no resolvable tenant. Fatal, never retried.
    MissingTenant,
    /// Domain validation failure (deterministic).
    Validation(String),
    /// Domain invariant failure (deterministic).
    InvariantViolation(String),
    /// Domain authorization failure.
    Unauthorized,
    /// Domain-level not found.
    NotFound,
    /// Historical payloads failed to deserialize into the aggregate's event type.
    Deserialize(String),
    /// The event store failed.
    Store(EventStoreError),
    /// Publication failed after a successful append (at-least-once; the
    /// events are durable and may be re-published from the log).
    Publish(String),
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Conflict(msg) => DispatchError::Concurrency(msg),
            EventStoreError::TenantMismatch(msg) => DispatchError::TenantIsolation(msg),
            EventStoreError::MissingTenant => DispatchError::MissingTenant,
            other => DispatchError::Store(other),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => DispatchError::Validation(msg),
            DomainError::InvariantViolation(msg) => DispatchError::InvariantViolation(msg),
            DomainError::Conflict(msg) => DispatchError::Concurrency(msg),
            DomainError::Unauthorized => DispatchError::Unauthorized,
            DomainError::NotFound => DispatchError::NotFound,
            DomainError::InvalidId(msg) => DispatchError::Validation(msg),
        }
    }
}

impl From<MissingTenant> for DispatchError {
    fn from(_: MissingTenant) -> Self {
        DispatchError::MissingTenant
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// Generic over the store and bus so tests run on the in-memory backends and
/// production swaps in Postgres without touching domain code.
#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
    /// Save a state checkpoint whenever the stream version crosses a
    /// multiple of this. `None` disables snapshotting.
    snapshot_every: Option<u64>,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self {
            store,
            bus,
            snapshot_every: None,
        }
    }

    /// Enable snapshotting every `every` events per aggregate.
    pub fn with_snapshot_every(mut self, every: u64) -> Self {
        self.snapshot_every = (every > 0).then_some(every);
        self
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore + SnapshotStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Dispatch a command through the full pipeline.
    ///
    /// The tenant comes from the ambient [`TenantContext`]; a command
    /// dispatched outside a tenant scope fails with
    /// [`DispatchError::MissingTenant`] before any IO happens.
    ///
    /// Returns the committed events (with assigned sequence numbers); the
    /// new aggregate version is the last one's `sequence_number`.
    ///
    /// [`TenantContext`]: tidemark_events::TenantContext
    pub async fn dispatch<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        command: A::Command,
        make_aggregate: impl FnOnce(TenantId, AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError> + Serialize + DeserializeOwned,
        A::Event: tidemark_events::Event + Serialize + DeserializeOwned,
    {
        // 1) Outbound interceptors: stamp tenant + correlation before any IO.
        //    The innermost "handler" just hands the stamped envelope back.
        let pipeline =
            CommandPipeline::new(|env: CommandEnvelope<A::Command>| Ok::<_, DispatchError>(env))
                .layer(CorrelationStamping)
                .layer(TenantStamping);
        let env = pipeline.dispatch(command)?;
        let metadata = env.metadata.clone();
        let tenant_id = metadata.tenant_id.ok_or(DispatchError::MissingTenant)?;

        // 2) Snapshot fast path. Corrupt or undecodable snapshots degrade to
        //    full replay; they never fail the command.
        let mut aggregate = make_aggregate(tenant_id, aggregate_id);
        let mut base = 0u64;
        match self.store.load_snapshot(tenant_id, aggregate_id).await {
            Ok(Some(snapshot)) => match serde_json::from_value::<A>(snapshot.state) {
                Ok(state) => {
                    aggregate = state;
                    base = snapshot.last_sequence_number;
                }
                Err(err) => warn!(
                    %tenant_id, %aggregate_id, error = %err,
                    "snapshot state failed to deserialize; replaying from scratch"
                ),
            },
            Ok(None) => {}
            Err(EventStoreError::CorruptSnapshot { detail, .. }) => warn!(
                %tenant_id, %aggregate_id, detail = %detail,
                "snapshot is corrupt; replaying from scratch"
            ),
            Err(other) => return Err(other.into()),
        }

        // 3) Load the remaining history (tenant-scoped).
        let history = self
            .store
            .read_stream(tenant_id, aggregate_id, base)
            .await?;
        validate_loaded_stream(tenant_id, aggregate_id, base, &history)?;
        let expected = base + history.len() as u64;

        // 4) Rehydrate and decide (no mutation during handle).
        apply_history::<A>(&mut aggregate, history)?;
        let decided = aggregate.handle(&env.command).map_err(DispatchError::from)?;
        if decided.is_empty() {
            return Ok(vec![]);
        }

        // 5) Persist atomically with the optimistic expectation.
        let uncommitted = decided
            .iter()
            .map(|ev| {
                UncommittedEvent::from_typed(
                    tenant_id,
                    aggregate_id,
                    aggregate_type,
                    Uuid::now_v7(),
                    metadata.clone(),
                    ev,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self
            .store
            .append_events(
                tenant_id,
                aggregate_id,
                aggregate_type,
                ExpectedVersion::Exact(expected),
                uncommitted,
            )
            .await?;

        // 6) Evolve local state past the append and checkpoint when due.
        //    Snapshot failures never fail an already-committed command.
        for ev in &decided {
            aggregate.apply(ev);
        }
        let new_version = committed.last().map(|e| e.sequence_number).unwrap_or(expected);
        if let Some(every) = self.snapshot_every {
            if new_version / every > expected / every {
                match serde_json::to_value(&aggregate) {
                    Ok(state) => {
                        if let Err(err) = self
                            .store
                            .save_snapshot(tenant_id, aggregate_id, new_version, state)
                            .await
                        {
                            warn!(%tenant_id, %aggregate_id, error = %err, "snapshot save failed");
                        }
                    }
                    Err(err) => warn!(
                        %tenant_id, %aggregate_id, error = %err,
                        "aggregate state failed to serialize for snapshotting"
                    ),
                }
            }
        }

        // 7) Publish committed events (only after a successful append).
        for stored in &committed {
            self.bus
                .publish(stored.to_envelope())
                .map_err(|e| DispatchError::Publish(format!("{e:?}")))?;
        }

        Ok(committed)
    }
}

/// Defense in depth: even a buggy backend must not hand us another tenant's
/// stream, and the run after `base` must be contiguous.
fn validate_loaded_stream(
    tenant_id: TenantId,
    aggregate_id: AggregateId,
    base: u64,
    stream: &[StoredEvent],
) -> Result<(), DispatchError> {
    for (idx, e) in stream.iter().enumerate() {
        if e.tenant_id != tenant_id {
            return Err(DispatchError::TenantIsolation(format!(
                "loaded stream contains wrong tenant_id at index {idx}"
            )));
        }
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::TenantIsolation(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            )));
        }
        let expected_sequence = base + idx as u64 + 1;
        if e.sequence_number != expected_sequence {
            return Err(DispatchError::Store(EventStoreError::Validation(format!(
                "gap in loaded stream: expected sequence {expected_sequence}, found {}",
                e.sequence_number
            ))));
        }
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: Vec<StoredEvent>) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let ev: A::Event = serde_json::from_value(stored.payload)
            .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
        aggregate.apply(&ev);
    }
    Ok(())
}
