//! `tidemark-events`: event vocabulary, tenant context, and interceptors.
//!
//! This crate defines what travels between the command side and the event
//! store: the [`Event`] trait, the persisted/delivered [`EventEnvelope`], the
//! correlation [`EventMetadata`] stamped by interceptors, the per-unit-of-work
//! [`TenantContext`], and the pub/sub [`EventBus`] boundary consumed by
//! downstream relays.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod interceptor;
pub mod metadata;
pub mod tenant;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use handler::execute;
pub use in_memory_bus::InMemoryEventBus;
pub use interceptor::{
    CommandEnvelope, CommandInterceptor, CommandPipeline, CorrelationStamping, TenantStamping,
    deliver_scoped, deliver_scoped_async,
};
pub use metadata::EventMetadata;
pub use tenant::{MissingTenant, TenantContext, TenantScoped};
