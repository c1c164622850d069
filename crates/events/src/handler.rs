//! Deterministic command execution helper.

/// Execute an aggregate command deterministically (no IO, no async).
///
/// The canonical decide-then-evolve cycle in one step:
///
/// 1. **Decide**: `aggregate.handle(command)` produces events (no mutation).
/// 2. **Evolve**: each event is applied via `aggregate.apply(event)`.
///
/// Useful in tests and inline processing; the full pipeline with persistence,
/// optimistic concurrency, and publication lives in the infra dispatcher.
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>
where
    A: tidemark_core::Aggregate,
{
    let events = A::handle(aggregate, command)?;
    for ev in &events {
        A::apply(aggregate, ev);
    }
    Ok(events)
}
