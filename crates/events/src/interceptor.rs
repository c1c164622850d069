//! Tenant-aware interception around the command → event boundary.
//!
//! Interception is explicit middleware composition: an ordered chain of
//! `(next) -> handler` wrappers, each with one responsibility. No proxies, no
//! annotation scanning. A [`CommandPipeline`] is built in plain code and the
//! order of `layer` calls is the order of execution (last layered runs first,
//! i.e. outermost).
//!
//! Outbound, [`TenantStamping`] resolves the tenant from [`TenantContext`]
//! (rejecting the command when none is established) and [`CorrelationStamping`]
//! fills the correlation/causation ids. Handlers therefore never thread
//! `tenant_id` through business logic; the events they produce inherit the
//! stamped metadata.
//!
//! Inbound, [`deliver_scoped`] restores the tenant context from the event's
//! own `tenant_id` before the handler runs and tears it down afterwards, so
//! replayed and live events are processed under identical isolation rules.

use tracing::debug;
use uuid::Uuid;

use crate::envelope::EventEnvelope;
use crate::metadata::EventMetadata;
use crate::tenant::{MissingTenant, TenantContext};

/// A command on its way to a handler, with the metadata stamped so far.
#[derive(Debug, Clone)]
pub struct CommandEnvelope<C> {
    pub command: C,
    pub metadata: EventMetadata,
}

impl<C> CommandEnvelope<C> {
    pub fn new(command: C) -> Self {
        Self {
            command,
            metadata: EventMetadata::new(),
        }
    }
}

/// The continuation of a pipeline: either the next interceptor or the handler.
pub type Next<'a, C, R, E> = Box<dyn Fn(CommandEnvelope<C>) -> Result<R, E> + 'a>;

/// One stage of the outbound command pipeline.
///
/// Implementations wrap `next` and decide whether (and with what metadata) to
/// invoke it. Keeping the trait generic over the handler's result and error
/// lets the same interceptors sit in front of any command handler.
pub trait CommandInterceptor {
    fn wrap<'a, C, R, E>(&self, next: Next<'a, C, R, E>) -> Next<'a, C, R, E>
    where
        C: 'a,
        R: 'a,
        E: From<MissingTenant> + 'a;
}

/// An ordered interceptor chain in front of a command handler.
pub struct CommandPipeline<'a, C, R, E> {
    handler: Next<'a, C, R, E>,
}

impl<'a, C, R, E> CommandPipeline<'a, C, R, E>
where
    C: 'a,
    R: 'a,
    E: From<MissingTenant> + 'a,
{
    /// Start a pipeline from the innermost handler.
    pub fn new(handler: impl Fn(CommandEnvelope<C>) -> Result<R, E> + 'a) -> Self {
        Self {
            handler: Box::new(handler),
        }
    }

    /// Wrap the current chain in another interceptor.
    ///
    /// The interceptor added last runs first (outermost).
    pub fn layer(self, interceptor: impl CommandInterceptor) -> Self {
        Self {
            handler: interceptor.wrap(self.handler),
        }
    }

    /// Run a command through the chain with empty starting metadata.
    pub fn dispatch(&self, command: C) -> Result<R, E> {
        self.dispatch_with(command, EventMetadata::new())
    }

    /// Run a command through the chain with caller-provided starting metadata
    /// (e.g. a causation id carried over from an upstream message).
    pub fn dispatch_with(&self, command: C, metadata: EventMetadata) -> Result<R, E> {
        (self.handler)(CommandEnvelope { command, metadata })
    }
}

/// Stamps the active tenant into the command metadata.
///
/// A command arriving with no resolvable tenant is rejected here, before it
/// can reach a handler or the append engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct TenantStamping;

impl CommandInterceptor for TenantStamping {
    fn wrap<'a, C, R, E>(&self, next: Next<'a, C, R, E>) -> Next<'a, C, R, E>
    where
        C: 'a,
        R: 'a,
        E: From<MissingTenant> + 'a,
    {
        Box::new(move |mut env| {
            let tenant_id = match TenantContext::require() {
                Ok(t) => t,
                Err(missing) => {
                    debug!("command rejected: no tenant context established");
                    return Err(missing.into());
                }
            };
            env.metadata.tenant_id = Some(tenant_id);
            next(env)
        })
    }
}

/// Fills the correlation/causation ids when the caller did not provide them.
///
/// A fresh correlation id is minted per command; causation defaults to the
/// correlation id so the first event in a chain points at its trigger.
#[derive(Debug, Default, Clone, Copy)]
pub struct CorrelationStamping;

impl CommandInterceptor for CorrelationStamping {
    fn wrap<'a, C, R, E>(&self, next: Next<'a, C, R, E>) -> Next<'a, C, R, E>
    where
        C: 'a,
        R: 'a,
        E: From<MissingTenant> + 'a,
    {
        Box::new(move |mut env| {
            let correlation_id = *env
                .metadata
                .correlation_id
                .get_or_insert_with(Uuid::now_v7);
            env.metadata.causation_id.get_or_insert(correlation_id);
            next(env)
        })
    }
}

/// Inbound interceptor: deliver an event under its own tenant's context.
///
/// Restores [`TenantContext`] from the envelope's `tenant_id`, invokes the
/// handler, and tears the context down on every exit path. Used identically
/// for live delivery and catch-up replay.
pub fn deliver_scoped<P, R>(
    envelope: &EventEnvelope<P>,
    handler: impl FnOnce(&EventEnvelope<P>) -> R,
) -> R {
    TenantContext::sync_scope(envelope.tenant_id(), || handler(envelope))
}

/// Async twin of [`deliver_scoped`] for handlers that await.
pub async fn deliver_scoped_async<P, R, Fut>(
    envelope: EventEnvelope<P>,
    handler: impl FnOnce(EventEnvelope<P>) -> Fut,
) -> R
where
    Fut: Future<Output = R>,
{
    let tenant_id = envelope.tenant_id();
    TenantContext::scope(tenant_id, handler(envelope)).await
}
