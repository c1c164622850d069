use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tidemark_core::{AggregateId, TenantId};

use crate::metadata::EventMetadata;

/// Envelope for a committed event: multi-tenant + stream + global-order metadata.
///
/// This is the unit delivered to consumers (live subscribers and catch-up
/// readers alike).
///
/// Notes:
/// - **Multi-tenancy** is enforced here via `tenant_id`; consumers restore
///   their tenant context from this field, never from ambient state.
/// - `sequence_number` is 1-based and gapless per `(tenant_id, aggregate_id)`.
/// - `global_sequence` is the engine-assigned total order across the whole
///   log, used by tracking tokens.
/// - `payload` is the domain-agnostic event payload; `metadata` carries the
///   correlation fields stamped at command time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    tenant_id: TenantId,

    aggregate_id: AggregateId,
    aggregate_type: String,

    /// Position in the aggregate stream (1-based, contiguous).
    sequence_number: u64,
    /// Position in the global log (monotonic, gaps allowed).
    global_sequence: u64,

    recorded_at: DateTime<Utc>,
    metadata: EventMetadata,

    payload: E,
}

impl<E> EventEnvelope<E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_id: Uuid,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        sequence_number: u64,
        global_sequence: u64,
        recorded_at: DateTime<Utc>,
        metadata: EventMetadata,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            tenant_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            sequence_number,
            global_sequence,
            recorded_at,
            metadata,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn global_sequence(&self) -> u64 {
        self.global_sequence
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
