//! Aggregate root trait and the optimistic-concurrency vocabulary.

use crate::error::{DomainError, DomainResult};

/// Aggregate root marker + minimal interface.
///
/// An aggregate is the consistency boundary the event store enforces ordering
/// and optimistic concurrency across. This trait is intentionally small so
/// callers decide how they model state transitions.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Monotonically increasing version of the aggregate's state.
    ///
    /// For event-sourced aggregates this is the `sequence_number` of the last
    /// applied event (0 for a brand-new instance).
    fn version(&self) -> u64;
}

/// Optimistic concurrency expectation for an append.
///
/// `Exact(0)` means "this aggregate must be new". The append engine turns a
/// stale `Exact` expectation into a conflict without holding any locks during
/// the read-modify-write cycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking (idempotent commands, migrations).
    Any,
    /// Require the stream to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}

/// Aggregate execution semantics (pure, deterministic).
///
/// - **Decision logic**: `handle(&self, cmd)` returns events.
/// - **State mutation**: `apply(&mut self, event)` evolves state.
///
/// Aggregates must not perform IO or side effects; they only return events
/// describing what happened. Rehydration applies a snapshot (if any) followed
/// by the remaining events in `sequence_number` order.
pub trait Aggregate: AggregateRoot {
    type Command: Clone + core::fmt::Debug;
    type Event: Clone + core::fmt::Debug;
    type Error: core::fmt::Debug;

    /// Evolve in-memory state from a single event.
    ///
    /// Implementations must stay deterministic and keep `version()` in step
    /// (+1 per applied event).
    fn apply(&mut self, event: &Self::Event);

    /// Decide which events to emit given the current state and a command.
    ///
    /// Must not mutate state; state evolution happens through `apply`.
    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_matches_every_version() {
        assert!(ExpectedVersion::Any.matches(0));
        assert!(ExpectedVersion::Any.matches(41));
    }

    #[test]
    fn exact_matches_only_its_own_version() {
        assert!(ExpectedVersion::Exact(3).matches(3));
        assert!(!ExpectedVersion::Exact(3).matches(4));
        assert!(ExpectedVersion::Exact(0).matches(0));
    }

    #[test]
    fn check_reports_a_conflict() {
        let err = ExpectedVersion::Exact(2).check(5).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }
}
