use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use uuid::Uuid;

use tidemark_core::{AggregateId, ExpectedVersion, TenantId};
use tidemark_events::EventMetadata;
use tidemark_infra::event_store::{EventStore, InMemoryEventStore, UncommittedEvent};

/// Naive CRUD baseline: direct key-value updates, no history, no isolation
/// guarantees beyond the lock.
#[derive(Debug, Clone, Default)]
struct NaiveCrudStore {
    inner: Arc<RwLock<HashMap<(TenantId, AggregateId), u64>>>,
}

impl NaiveCrudStore {
    fn bump(&self, tenant_id: TenantId, aggregate_id: AggregateId) {
        let mut map = self.inner.write().unwrap();
        *map.entry((tenant_id, aggregate_id)).or_insert(0) += 1;
    }
}

fn proposed(tenant_id: TenantId, aggregate_id: AggregateId) -> UncommittedEvent {
    UncommittedEvent {
        event_id: Uuid::now_v7(),
        tenant_id,
        aggregate_id,
        aggregate_type: "bench.counter".to_string(),
        event_type: "bench.counter.bumped".to_string(),
        event_version: 1,
        occurred_at: Utc::now(),
        payload: serde_json::json!({ "delta": 1 }),
        metadata: EventMetadata::for_tenant(tenant_id),
    }
}

fn bench_appends(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime");

    let mut group = c.benchmark_group("append");
    group.throughput(Throughput::Elements(1));

    group.bench_function("event_sourced_append", |b| {
        let store = InMemoryEventStore::new();
        let tenant_id = TenantId::new();
        let aggregate_id = AggregateId::new();
        let mut version = 0u64;

        b.iter(|| {
            let committed = rt
                .block_on(store.append_events(
                    tenant_id,
                    aggregate_id,
                    "bench.counter",
                    ExpectedVersion::Exact(version),
                    vec![proposed(tenant_id, aggregate_id)],
                ))
                .expect("append");
            version = committed.last().expect("committed").sequence_number;
            black_box(committed);
        });
    });

    group.bench_function("naive_crud_update", |b| {
        let store = NaiveCrudStore::default();
        let tenant_id = TenantId::new();
        let aggregate_id = AggregateId::new();

        b.iter(|| {
            store.bump(tenant_id, aggregate_id);
            black_box(&store);
        });
    });

    group.finish();
}

fn bench_stream_reads(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime");

    let store = InMemoryEventStore::new();
    let tenant_id = TenantId::new();
    let aggregate_id = AggregateId::new();

    rt.block_on(async {
        for version in 0..100u64 {
            store
                .append_events(
                    tenant_id,
                    aggregate_id,
                    "bench.counter",
                    ExpectedVersion::Exact(version),
                    vec![proposed(tenant_id, aggregate_id)],
                )
                .await
                .expect("seed");
        }
    });

    let mut group = c.benchmark_group("read");
    group.throughput(Throughput::Elements(100));

    group.bench_function("full_stream_rehydration_read", |b| {
        b.iter(|| {
            let events = rt
                .block_on(store.read_stream(tenant_id, aggregate_id, 0))
                .expect("read");
            black_box(events);
        });
    });

    group.bench_function("snapshot_tail_read", |b| {
        b.iter(|| {
            let events = rt
                .block_on(store.read_stream(tenant_id, aggregate_id, 90))
                .expect("read");
            black_box(events);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_appends, bench_stream_reads);
criterion_main!(benches);
