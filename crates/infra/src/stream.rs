//! Tracking tokens and the catch-up cursor.
//!
//! A [`TrackingToken`] is an opaque, comparable, serializable position in the
//! global event order: the `global_sequence` of the last event the holder has
//! consumed (0 before the oldest event). Tokens compare positions; they never
//! count rows, so gaps in `global_sequence` (rolled-back appends burn
//! identity values) are invisible to consumers.
//!
//! A [`CatchUpCursor`] turns a token into a lazy, restartable sequence of
//! bounded batches ordered by `global_sequence`. The cursor's token advances
//! only when a batch is returned; a failed or cancelled read leaves it
//! unchanged, so resuming from the same position yields no gaps and no
//! duplicates.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::event_store::{CatchUp, EventStoreError, StoredEvent};

/// Opaque cursor over the global event order.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TrackingToken(u64);

impl TrackingToken {
    /// Before the oldest event: consuming from here replays the whole log.
    pub const ORIGIN: TrackingToken = TrackingToken(0);

    /// Token positioned directly after the event at `global_sequence`.
    pub fn at(global_sequence: u64) -> Self {
        Self(global_sequence)
    }

    /// The `global_sequence` of the last covered event (0 at the origin).
    pub fn position(&self) -> u64 {
        self.0
    }

    /// Whether the event at `global_sequence` has already been consumed.
    pub fn covers(&self, global_sequence: u64) -> bool {
        global_sequence <= self.0
    }

    /// Token advanced past `global_sequence`. Never moves backwards.
    #[must_use]
    pub fn advance_to(&self, global_sequence: u64) -> Self {
        Self(self.0.max(global_sequence))
    }
}

impl core::fmt::Display for TrackingToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Tuning for catch-up reads.
#[derive(Debug, Clone, Copy)]
pub struct CatchUpConfig {
    /// Upper bound on events per batch; keeps far-behind consumers from
    /// pulling the whole backlog into memory.
    pub batch_size: u32,
    /// Consumer retry cadence: how long a worker pauses before re-reading
    /// after a failed delivery or a transient read error.
    pub poll_interval: Duration,
    /// Upper bound on how long [`CatchUpCursor::next_batch`] blocks at the
    /// head of the log before returning an empty batch.
    pub idle_wait: Duration,
}

impl Default for CatchUpConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            poll_interval: Duration::from_millis(200),
            idle_wait: Duration::from_secs(5),
        }
    }
}

/// Lazy reader over the global log, resumable from its token.
///
/// `next_batch` never skips rows: it returns the next run of events past the
/// token, or an empty batch once `idle_wait` elapses with nothing new. The
/// token moves only after events are handed to the caller, so dropping the
/// cursor mid-wait (cancellation) loses nothing.
#[derive(Debug)]
pub struct CatchUpCursor<S> {
    store: S,
    token: TrackingToken,
    config: CatchUpConfig,
}

impl<S> CatchUpCursor<S>
where
    S: CatchUp,
{
    /// Open a cursor positioned at `token`.
    pub fn new(store: S, token: TrackingToken) -> Self {
        Self::with_config(store, token, CatchUpConfig::default())
    }

    pub fn with_config(store: S, token: TrackingToken, config: CatchUpConfig) -> Self {
        Self {
            store,
            token,
            config,
        }
    }

    /// The resume position: everything at or before it has been returned.
    pub fn token(&self) -> TrackingToken {
        self.token
    }

    /// Rewind (or fast-forward) to an externally committed position.
    ///
    /// Consumers that failed mid-batch call this with their last durably
    /// committed token before reading again.
    pub fn seek(&mut self, token: TrackingToken) {
        self.token = token;
    }

    /// Read the next batch of events past the token, in `global_sequence`
    /// order.
    ///
    /// Blocks up to `idle_wait` when the cursor is at the head; an empty
    /// result means "no new events yet", never "rows were skipped". Errors
    /// leave the token unchanged.
    pub async fn next_batch(&mut self) -> Result<Vec<StoredEvent>, EventStoreError> {
        let batch = self
            .store
            .read_batch(self.token, self.config.batch_size)
            .await?;

        let batch = if batch.is_empty() {
            // At the head: wait (bounded) for an append, then re-read once.
            if !self
                .store
                .wait_for_events(self.token, self.config.idle_wait)
                .await?
            {
                return Ok(Vec::new());
            }
            self.store
                .read_batch(self.token, self.config.batch_size)
                .await?
        } else {
            batch
        };

        if let Some(last) = batch.last() {
            self.token = self.token.advance_to(last.global_sequence);
        }
        Ok(batch)
    }
}
