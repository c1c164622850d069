//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus is the boundary an external messaging relay plugs into. It is
//! intentionally lightweight:
//!
//! - **Transport-agnostic**: in-memory channels here, a broker adapter elsewhere.
//! - **At-least-once**: events are persisted to the store *before* they are
//!   published, so a failed publish can always be retried from the log;
//!   consumers must be idempotent.
//! - **No persistence**: the bus distributes, the event store is the source of
//!   truth. A consumer that needs replay or resume reads the catch-up cursor
//!   instead and advances its own tracking token.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to an event stream.
///
/// Each subscription receives a copy of every message published after it was
/// created (broadcast semantics). Designed for single-threaded consumption;
/// a worker loop typically alternates `recv_timeout` with a shutdown check.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// Sits between the event store and event consumers:
///
/// ```text
/// Command → Event Store (append) → Event Bus (publish) → Consumers
/// ```
///
/// Events are stored first, then published. Publication failures surface to
/// the caller; since the events are already durable, retrying publication is
/// safe (at-least-once).
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
