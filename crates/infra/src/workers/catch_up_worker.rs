//! Background consumer loop over the catch-up cursor.
//!
//! The worker is the harness every downstream processor (projection builder,
//! messaging relay) runs in: it drives a [`CatchUpCursor`], delivers each
//! event through the inbound tenant interceptor, and commits its durable
//! offset only after the handler returns success. A failing handler leaves
//! the offset untouched and the batch is re-read from the committed position
//! after a delay. Failure is communicated exclusively as "token not
//! advanced". Retry/backoff sophistication and dead-lettering belong to the
//! consumer behind the handler, never to the event log.

use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use tidemark_core::TenantId;
use tidemark_events::{EventEnvelope, deliver_scoped};

use crate::event_store::{CatchUp, EventStoreError};
use crate::offset_store::ConsumerOffsetStore;
use crate::stream::{CatchUpConfig, CatchUpCursor};

/// Where a consumer with no committed offset begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartFrom {
    /// Replay the whole log (tail token).
    #[default]
    Origin,
    /// Consume from "now" (head token).
    Head,
}

/// What to do when the log contains a row the reader cannot decode.
///
/// The store reports the failing offset and leaves the decision here, with
/// the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MalformedRowPolicy {
    /// Stop the worker; the offset stays before the bad row.
    #[default]
    Halt,
    /// Log, advance past the bad row, keep consuming.
    Skip,
}

/// Worker tuning.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerOptions {
    pub catch_up: CatchUpConfig,
    pub start_from: StartFrom,
    pub on_malformed: MalformedRowPolicy,
    /// When set, events of other tenants are skipped (their offsets still
    /// advance). Defense in depth for single-tenant consumers.
    pub tenant_filter: Option<TenantId>,
}

/// Handle to control and join a background worker.
///
/// Dropping the handle also requests shutdown (the worker notices at its
/// next loop turn).
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

/// Generic catch-up consumer loop.
///
/// - Resumes from the consumer's committed offset (or `start_from`)
/// - Restores tenant context per event before the handler runs
/// - Advances the offset only after the handler succeeds
/// - Supports graceful shutdown
#[derive(Debug)]
pub struct CatchUpWorker;

impl CatchUpWorker {
    /// Spawn a worker task named `name` (also its offset-store key).
    ///
    /// `handler` must be idempotent: offset commits can trail deliveries, so
    /// redelivery after a crash is possible (at-least-once).
    pub fn spawn<S, O, H, E>(
        name: &'static str,
        store: S,
        offsets: O,
        options: WorkerOptions,
        handler: H,
    ) -> WorkerHandle
    where
        S: CatchUp + Send + Sync + 'static,
        O: ConsumerOffsetStore + Send + Sync + 'static,
        H: FnMut(&EventEnvelope<JsonValue>) -> Result<(), E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(worker_loop(name, store, offsets, options, handler, shutdown_rx));

        WorkerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

async fn worker_loop<S, O, H, E>(
    name: &'static str,
    store: S,
    offsets: O,
    options: WorkerOptions,
    mut handler: H,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: CatchUp + Send + Sync,
    O: ConsumerOffsetStore + Send + Sync,
    H: FnMut(&EventEnvelope<JsonValue>) -> Result<(), E> + Send,
    E: core::fmt::Debug,
{
    let retry_delay = options.catch_up.poll_interval;

    // Resolve the starting position. Transient failures here retry forever;
    // there is no safe position to invent.
    let mut committed = loop {
        if *shutdown_rx.borrow() {
            return;
        }
        let resolved = match offsets.load(name).await {
            Ok(Some(token)) => Ok(Some(token)),
            Ok(None) => match options.start_from {
                StartFrom::Origin => store.tail_token().await.map(Some),
                StartFrom::Head => store.head_token().await.map(Some),
            },
            Err(err) => Err(err),
        };
        match resolved {
            Ok(Some(token)) => break token,
            Ok(None) => unreachable!("start token resolution always yields a token"),
            Err(err) => warn!(worker = name, error = %err, "failed to resolve start position"),
        }
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            _ = tokio::time::sleep(retry_delay) => {}
        }
    };

    let mut cursor = CatchUpCursor::with_config(store, committed, options.catch_up);

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let batch = tokio::select! {
            _ = shutdown_rx.changed() => return,
            batch = cursor.next_batch() => batch,
        };

        match batch {
            Ok(events) => {
                for event in events {
                    let global_sequence = event.global_sequence;
                    let envelope = event.to_envelope();

                    if let Some(pinned) = options.tenant_filter {
                        if envelope.tenant_id() != pinned {
                            committed = committed.advance_to(global_sequence);
                            commit_offset(name, &offsets, committed).await;
                            continue;
                        }
                    }

                    match deliver_scoped(&envelope, |env| handler(env)) {
                        Ok(()) => {
                            committed = committed.advance_to(global_sequence);
                            commit_offset(name, &offsets, committed).await;
                        }
                        Err(err) => {
                            warn!(
                                worker = name,
                                global_sequence,
                                error = ?err,
                                "handler failed; token not advanced"
                            );
                            cursor.seek(committed);
                            tokio::select! {
                                _ = shutdown_rx.changed() => return,
                                _ = tokio::time::sleep(retry_delay) => {}
                            }
                            break;
                        }
                    }
                }
            }
            Err(EventStoreError::MalformedRow {
                global_sequence,
                detail,
            }) => match options.on_malformed {
                MalformedRowPolicy::Skip => {
                    warn!(worker = name, global_sequence, detail = %detail, "skipping malformed row");
                    committed = committed.advance_to(global_sequence);
                    commit_offset(name, &offsets, committed).await;
                    cursor.seek(committed);
                }
                MalformedRowPolicy::Halt => {
                    error!(worker = name, global_sequence, detail = %detail, "halting on malformed row");
                    return;
                }
            },
            Err(err) => {
                warn!(worker = name, error = %err, "catch-up read failed");
                cursor.seek(committed);
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    _ = tokio::time::sleep(retry_delay) => {}
                }
            }
        }
    }
}

/// Commit failures degrade to at-least-once, never to data loss: the worker
/// keeps delivering and the offset catches up on the next success.
async fn commit_offset<O>(name: &'static str, offsets: &O, token: crate::stream::TrackingToken)
where
    O: ConsumerOffsetStore,
{
    if let Err(err) = offsets.commit(name, token).await {
        warn!(worker = name, error = %err, "offset commit failed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::Utc;
    use uuid::Uuid;

    use tidemark_core::{AggregateId, ExpectedVersion, TenantId};
    use tidemark_events::{EventMetadata, TenantContext};

    use super::*;
    use crate::event_store::{EventStore, InMemoryEventStore, UncommittedEvent};
    use crate::offset_store::InMemoryOffsetStore;
    use crate::stream::TrackingToken;

    const AGGREGATE_TYPE: &str = "sales.order";

    fn proposed(tenant_id: TenantId, aggregate_id: AggregateId, label: &str) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            tenant_id,
            aggregate_id,
            aggregate_type: AGGREGATE_TYPE.to_string(),
            event_type: format!("sales.order.{label}"),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: serde_json::json!({ "label": label }),
            metadata: EventMetadata::for_tenant(tenant_id),
        }
    }

    fn fast_options() -> WorkerOptions {
        WorkerOptions {
            catch_up: crate::stream::CatchUpConfig {
                batch_size: 16,
                poll_interval: Duration::from_millis(5),
                idle_wait: Duration::from_millis(20),
            },
            ..WorkerOptions::default()
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delivers_in_order_with_tenant_context_restored() {
        let store = Arc::new(InMemoryEventStore::new());
        let offsets = Arc::new(InMemoryOffsetStore::new());
        let tenant = TenantId::new();
        let aggregate = AggregateId::new();

        store
            .append_events(
                tenant,
                aggregate,
                AGGREGATE_TYPE,
                ExpectedVersion::Exact(0),
                vec![
                    proposed(tenant, aggregate, "placed"),
                    proposed(tenant, aggregate, "confirmed"),
                ],
            )
            .await
            .expect("seed");

        let seen: Arc<Mutex<Vec<(Option<TenantId>, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let worker = CatchUpWorker::spawn(
            "order-projection",
            store.clone(),
            offsets.clone(),
            fast_options(),
            move |envelope| {
                sink.lock()
                    .expect("sink lock")
                    .push((TenantContext::current(), envelope.sequence_number()));
                Ok::<_, String>(())
            },
        );

        wait_until(|| seen.lock().expect("sink lock").len() == 2).await;
        worker.shutdown().await;

        let seen = seen.lock().expect("sink lock");
        assert_eq!(
            *seen,
            vec![(Some(tenant), 1), (Some(tenant), 2)],
            "delivery restores the event's own tenant, in order"
        );
        assert_eq!(
            offsets.load("order-projection").await.expect("load"),
            Some(TrackingToken::at(2))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_handler_leaves_the_offset_unchanged() {
        let store = Arc::new(InMemoryEventStore::new());
        let offsets = Arc::new(InMemoryOffsetStore::new());
        let tenant = TenantId::new();
        let aggregate = AggregateId::new();

        store
            .append_events(
                tenant,
                aggregate,
                AGGREGATE_TYPE,
                ExpectedVersion::Exact(0),
                vec![proposed(tenant, aggregate, "placed")],
            )
            .await
            .expect("seed");

        let attempts = Arc::new(Mutex::new(0u32));
        let counter = attempts.clone();
        let worker = CatchUpWorker::spawn(
            "broken-projection",
            store.clone(),
            offsets.clone(),
            fast_options(),
            move |_envelope| {
                *counter.lock().expect("counter lock") += 1;
                Err::<(), _>("downstream sink unavailable")
            },
        );

        wait_until(|| *attempts.lock().expect("counter lock") >= 3).await;
        worker.shutdown().await;

        assert_eq!(
            offsets.load("broken-projection").await.expect("load"),
            None,
            "a failing consumer must not advance its token"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_resumes_without_duplicates_or_gaps() {
        let store = Arc::new(InMemoryEventStore::new());
        let offsets = Arc::new(InMemoryOffsetStore::new());
        let tenant = TenantId::new();
        let aggregate = AggregateId::new();

        store
            .append_events(
                tenant,
                aggregate,
                AGGREGATE_TYPE,
                ExpectedVersion::Exact(0),
                vec![
                    proposed(tenant, aggregate, "e1"),
                    proposed(tenant, aggregate, "e2"),
                ],
            )
            .await
            .expect("seed");

        let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));

        // First incarnation processes the backlog, then stops.
        let sink = seen.clone();
        let first = CatchUpWorker::spawn(
            "resumable",
            store.clone(),
            offsets.clone(),
            fast_options(),
            move |envelope| {
                sink.lock().expect("sink lock").push(envelope.global_sequence());
                Ok::<_, String>(())
            },
        );
        wait_until(|| seen.lock().expect("sink lock").len() == 2).await;
        first.shutdown().await;

        // More events arrive while no worker is running.
        store
            .append_events(
                tenant,
                aggregate,
                AGGREGATE_TYPE,
                ExpectedVersion::Exact(2),
                vec![proposed(tenant, aggregate, "e3")],
            )
            .await
            .expect("late event");

        // Second incarnation picks up exactly where the first committed.
        let sink = seen.clone();
        let second = CatchUpWorker::spawn(
            "resumable",
            store.clone(),
            offsets.clone(),
            fast_options(),
            move |envelope| {
                sink.lock().expect("sink lock").push(envelope.global_sequence());
                Ok::<_, String>(())
            },
        );
        wait_until(|| seen.lock().expect("sink lock").len() == 3).await;
        second.shutdown().await;

        assert_eq!(*seen.lock().expect("sink lock"), vec![1, 2, 3]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn head_start_skips_the_backlog() {
        let store = Arc::new(InMemoryEventStore::new());
        let offsets = Arc::new(InMemoryOffsetStore::new());
        let tenant = TenantId::new();
        let aggregate = AggregateId::new();

        store
            .append_events(
                tenant,
                aggregate,
                AGGREGATE_TYPE,
                ExpectedVersion::Exact(0),
                vec![proposed(tenant, aggregate, "old")],
            )
            .await
            .expect("backlog");

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let worker = CatchUpWorker::spawn(
            "live-only",
            store.clone(),
            offsets.clone(),
            WorkerOptions {
                start_from: StartFrom::Head,
                ..fast_options()
            },
            move |envelope| {
                sink.lock()
                    .expect("sink lock")
                    .push(envelope.payload()["label"].as_str().unwrap_or("").to_string());
                Ok::<_, String>(())
            },
        );

        // Give the worker a moment to position itself, then append.
        tokio::time::sleep(Duration::from_millis(30)).await;
        store
            .append_events(
                tenant,
                aggregate,
                AGGREGATE_TYPE,
                ExpectedVersion::Exact(1),
                vec![proposed(tenant, aggregate, "new")],
            )
            .await
            .expect("live event");

        wait_until(|| !seen.lock().expect("sink lock").is_empty()).await;
        worker.shutdown().await;

        assert_eq!(*seen.lock().expect("sink lock"), vec!["new".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tenant_pinned_worker_skips_other_tenants_but_advances() {
        let store = Arc::new(InMemoryEventStore::new());
        let offsets = Arc::new(InMemoryOffsetStore::new());
        let pinned = TenantId::new();
        let other = TenantId::new();
        let aggregate = AggregateId::new();

        store
            .append_events(
                other,
                aggregate,
                AGGREGATE_TYPE,
                ExpectedVersion::Exact(0),
                vec![proposed(other, aggregate, "foreign")],
            )
            .await
            .expect("foreign event");
        store
            .append_events(
                pinned,
                aggregate,
                AGGREGATE_TYPE,
                ExpectedVersion::Exact(0),
                vec![proposed(pinned, aggregate, "ours")],
            )
            .await
            .expect("pinned event");

        let seen: Arc<Mutex<Vec<TenantId>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let worker = CatchUpWorker::spawn(
            "pinned",
            store.clone(),
            offsets.clone(),
            WorkerOptions {
                tenant_filter: Some(pinned),
                ..fast_options()
            },
            move |envelope| {
                sink.lock().expect("sink lock").push(envelope.tenant_id());
                Ok::<_, String>(())
            },
        );

        wait_until(|| seen.lock().expect("sink lock").len() == 1).await;
        worker.shutdown().await;

        assert_eq!(*seen.lock().expect("sink lock"), vec![pinned]);
        assert_eq!(
            offsets.load("pinned").await.expect("load"),
            Some(TrackingToken::at(2)),
            "skipped events still advance the offset"
        );
    }
}
