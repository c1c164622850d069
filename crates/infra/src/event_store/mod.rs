//! Append-only event store boundary.
//!
//! Defines the storage-facing contracts (append engine, by-aggregate reads,
//! global catch-up, snapshots) plus the Postgres and in-memory backends.

pub mod in_memory;
pub mod postgres;
pub mod schema;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::{PgStoreConfig, PostgresEventStore};
pub use r#trait::{
    CatchUp, EventStore, EventStoreError, MAX_PAYLOAD_BYTES, Snapshot, SnapshotStore, StoredEvent,
    UncommittedEvent, stream_id,
};
