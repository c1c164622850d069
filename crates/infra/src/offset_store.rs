//! Per-consumer tracking-token persistence.
//!
//! Downstream consumers (projection builders, the messaging relay) resume
//! from the token stored here. The committed token only ever moves forward:
//! a consumer advances it after its own side effects are durable, and a
//! consumer that fails simply leaves it where it was; "token not advanced"
//! is the whole failure protocol.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::sync::Arc;

use crate::event_store::EventStoreError;
use crate::stream::TrackingToken;

/// Durable store for consumer positions in the global log.
#[async_trait]
pub trait ConsumerOffsetStore: Send + Sync {
    /// The consumer's committed token, or `None` if it never committed one.
    async fn load(&self, consumer_name: &str) -> Result<Option<TrackingToken>, EventStoreError>;

    /// Commit a new token. Never moves the stored token backwards.
    async fn commit(
        &self,
        consumer_name: &str,
        token: TrackingToken,
    ) -> Result<(), EventStoreError>;
}

#[async_trait]
impl<S> ConsumerOffsetStore for Arc<S>
where
    S: ConsumerOffsetStore + ?Sized,
{
    async fn load(&self, consumer_name: &str) -> Result<Option<TrackingToken>, EventStoreError> {
        (**self).load(consumer_name).await
    }

    async fn commit(
        &self,
        consumer_name: &str,
        token: TrackingToken,
    ) -> Result<(), EventStoreError> {
        (**self).commit(consumer_name, token).await
    }
}

/// Postgres-backed offset store.
#[derive(Debug, Clone)]
pub struct PostgresOffsetStore {
    pool: Arc<PgPool>,
}

impl PostgresOffsetStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl ConsumerOffsetStore for PostgresOffsetStore {
    async fn load(&self, consumer_name: &str) -> Result<Option<TrackingToken>, EventStoreError> {
        let row = sqlx::query("SELECT token FROM consumer_offsets WHERE consumer_name = $1")
            .bind(consumer_name)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| EventStoreError::Storage(format!("load offset failed: {e}")))?;

        row.map(|r| {
            let token: i64 = r
                .try_get("token")
                .map_err(|e| EventStoreError::Storage(format!("failed to read token: {e}")))?;
            Ok(TrackingToken::at(token as u64))
        })
        .transpose()
    }

    async fn commit(
        &self,
        consumer_name: &str,
        token: TrackingToken,
    ) -> Result<(), EventStoreError> {
        sqlx::query(
            r#"
            INSERT INTO consumer_offsets (consumer_name, token)
            VALUES ($1, $2)
            ON CONFLICT (consumer_name)
            DO UPDATE SET
                token = GREATEST(consumer_offsets.token, EXCLUDED.token),
                updated_at = NOW()
            "#,
        )
        .bind(consumer_name)
        .bind(token.position() as i64)
        .execute(&*self.pool)
        .await
        .map_err(|e| EventStoreError::Storage(format!("commit offset failed: {e}")))?;

        Ok(())
    }
}

/// In-memory offset store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryOffsetStore {
    offsets: Mutex<HashMap<String, TrackingToken>>,
}

impl InMemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConsumerOffsetStore for InMemoryOffsetStore {
    async fn load(&self, consumer_name: &str) -> Result<Option<TrackingToken>, EventStoreError> {
        let offsets = self
            .offsets
            .lock()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;
        Ok(offsets.get(consumer_name).copied())
    }

    async fn commit(
        &self,
        consumer_name: &str,
        token: TrackingToken,
    ) -> Result<(), EventStoreError> {
        let mut offsets = self
            .offsets
            .lock()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;
        let entry = offsets.entry(consumer_name.to_string()).or_default();
        *entry = entry.advance_to(token.position());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_is_none_for_unknown_consumers() {
        let store = InMemoryOffsetStore::new();
        assert_eq!(store.load("relay").await.expect("load"), None);
    }

    #[tokio::test]
    async fn commit_then_load_round_trips() {
        let store = InMemoryOffsetStore::new();
        store
            .commit("relay", TrackingToken::at(12))
            .await
            .expect("commit");
        assert_eq!(
            store.load("relay").await.expect("load"),
            Some(TrackingToken::at(12))
        );
    }

    #[tokio::test]
    async fn committed_token_never_moves_backwards() {
        let store = InMemoryOffsetStore::new();
        store
            .commit("relay", TrackingToken::at(20))
            .await
            .expect("commit");
        store
            .commit("relay", TrackingToken::at(5))
            .await
            .expect("stale commit is a no-op");
        assert_eq!(
            store.load("relay").await.expect("load"),
            Some(TrackingToken::at(20))
        );
    }

    #[tokio::test]
    async fn consumers_are_independent() {
        let store = InMemoryOffsetStore::new();
        store
            .commit("relay", TrackingToken::at(7))
            .await
            .expect("commit");
        assert_eq!(store.load("audit").await.expect("load"), None);
    }
}
