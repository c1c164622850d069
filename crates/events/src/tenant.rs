//! Per-unit-of-work tenant context.
//!
//! The context is a task-local value, not a process-wide static: each logical
//! unit of work (a command dispatch, one event delivery) establishes it with
//! [`TenantContext::scope`] / [`TenantContext::sync_scope`] and the runtime
//! tears it down on every exit path: normal return, error, panic unwind, or
//! task cancellation. There is deliberately no `set`/`clear` pair to misuse;
//! an unpaired set on a reused worker would leak one tenant's context into
//! the next unit of work.

use thiserror::Error;

use tidemark_core::TenantId;

use crate::EventEnvelope;

tokio::task_local! {
    static CURRENT_TENANT: TenantId;
}

/// No tenant context is established for the current unit of work.
///
/// Fatal for the unit of work that hits it; never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no tenant context established for the current unit of work")]
pub struct MissingTenant;

/// Accessor for the tenant the current unit of work acts for.
///
/// Works for any concurrency granularity tokio offers: each task (and each
/// `sync_scope` call stack) carries its own independent value, and a child
/// unit of work spawned via [`TenantContext::spawn_inheriting`] receives the
/// parent's tenant id by value.
#[derive(Debug)]
pub struct TenantContext;

impl TenantContext {
    /// The active tenant, if a scope is established.
    pub fn current() -> Option<TenantId> {
        CURRENT_TENANT.try_with(|t| *t).ok()
    }

    /// The active tenant, or [`MissingTenant`] when called outside a scope.
    pub fn require() -> Result<TenantId, MissingTenant> {
        Self::current().ok_or(MissingTenant)
    }

    /// Run a future with `tenant_id` as the active tenant.
    ///
    /// Teardown is guaranteed on every exit path, including cancellation of
    /// the returned future. Nested scopes shadow the outer tenant for the
    /// duration of the inner block.
    pub async fn scope<F>(tenant_id: TenantId, f: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_TENANT.scope(tenant_id, f).await
    }

    /// Run a closure with `tenant_id` as the active tenant.
    ///
    /// The synchronous twin of [`TenantContext::scope`]; teardown also runs
    /// on panic unwind.
    pub fn sync_scope<R>(tenant_id: TenantId, f: impl FnOnce() -> R) -> R {
        CURRENT_TENANT.sync_scope(tenant_id, f)
    }

    /// Spawn a child unit of work that inherits the caller's tenant by value.
    ///
    /// Without an active tenant the child starts with no context, same as a
    /// plain `tokio::spawn`. Must be called from within a tokio runtime.
    pub fn spawn_inheriting<F>(f: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match Self::current() {
            Some(tenant_id) => tokio::spawn(CURRENT_TENANT.scope(tenant_id, f)),
            None => tokio::spawn(f),
        }
    }
}

/// Helper trait for tenant-scoped messages.
///
/// Marks types that carry an associated tenant id, enabling tenant-aware
/// processing in infrastructure components: pinning a consumer to one tenant,
/// filtering subscription loops, or validating that a message belongs to the
/// expected tenant before it is handed to business logic.
pub trait TenantScoped {
    fn tenant_id(&self) -> TenantId;
}

impl<E> TenantScoped for EventEnvelope<E> {
    fn tenant_id(&self) -> TenantId {
        EventEnvelope::tenant_id(self)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use tidemark_core::AggregateId;

    use crate::metadata::EventMetadata;

    use super::*;

    #[test]
    fn tenant_scoped_messages_expose_their_tenant() {
        fn tenant_of<M: TenantScoped>(message: &M) -> TenantId {
            message.tenant_id()
        }

        let tenant = TenantId::new();
        let envelope = EventEnvelope::new(
            uuid::Uuid::now_v7(),
            tenant,
            AggregateId::new(),
            "test.aggregate",
            1,
            1,
            Utc::now(),
            EventMetadata::for_tenant(tenant),
            serde_json::json!({}),
        );
        assert_eq!(tenant_of(&envelope), tenant);
    }

    #[test]
    fn current_is_none_outside_any_scope() {
        assert_eq!(TenantContext::current(), None);
        assert_eq!(TenantContext::require(), Err(MissingTenant));
    }

    #[test]
    fn sync_scope_establishes_and_tears_down() {
        let tenant = TenantId::new();
        let seen = TenantContext::sync_scope(tenant, TenantContext::current);
        assert_eq!(seen, Some(tenant));
        assert_eq!(TenantContext::current(), None);
    }

    #[test]
    fn nested_scopes_shadow_and_restore() {
        let outer = TenantId::new();
        let inner = TenantId::new();

        TenantContext::sync_scope(outer, || {
            assert_eq!(TenantContext::current(), Some(outer));
            TenantContext::sync_scope(inner, || {
                assert_eq!(TenantContext::current(), Some(inner));
            });
            assert_eq!(TenantContext::current(), Some(outer));
        });
    }

    #[test]
    fn teardown_runs_on_panic_unwind() {
        let tenant = TenantId::new();
        let result = std::panic::catch_unwind(|| {
            TenantContext::sync_scope(tenant, || panic!("handler exploded"));
        });
        assert!(result.is_err());
        assert_eq!(TenantContext::current(), None);
    }

    #[tokio::test]
    async fn async_scope_establishes_across_await_points() {
        let tenant = TenantId::new();
        let seen = TenantContext::scope(tenant, async {
            tokio::task::yield_now().await;
            TenantContext::current()
        })
        .await;
        assert_eq!(seen, Some(tenant));
        assert_eq!(TenantContext::current(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_tasks_have_independent_contexts() {
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();

        let task_a = tokio::spawn(TenantContext::scope(tenant_a, async {
            tokio::task::yield_now().await;
            TenantContext::current()
        }));
        let task_b = tokio::spawn(TenantContext::scope(tenant_b, async {
            tokio::task::yield_now().await;
            TenantContext::current()
        }));

        assert_eq!(task_a.await.expect("task a"), Some(tenant_a));
        assert_eq!(task_b.await.expect("task b"), Some(tenant_b));
    }

    #[tokio::test]
    async fn spawned_child_inherits_tenant_by_value() {
        let tenant = TenantId::new();
        let seen = TenantContext::scope(tenant, async {
            TenantContext::spawn_inheriting(async { TenantContext::current() })
                .await
                .expect("child join")
        })
        .await;
        assert_eq!(seen, Some(tenant));
    }
}
