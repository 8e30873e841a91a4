//! Deduplication of retried mutations by client-supplied key.

use std::future::Future;
use std::sync::Arc;

use chrono::Duration;
use council_core::{Clock, CoreError, IdempotencyRecord, Repository};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::GuardError;
use crate::locks::KeyedLocks;

/// Remembers mutation results so a retried request has at most one effect.
///
/// The lookup and the write of a key happen under a per-key lock, so two
/// concurrent requests with the same key run the computation once. Failed
/// computations are not remembered; the client may retry them. Once a
/// computation has succeeded its result is always returned, even when the
/// record cannot be written.
pub struct IdempotencyStore {
    repo: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    locks: KeyedLocks,
}

impl IdempotencyStore {
    pub fn new(repo: Arc<dyn Repository>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            repo,
            clock,
            ttl,
            locks: KeyedLocks::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the stored result for `key`, or run `compute` and store its result.
    pub async fn get_or_compute<T, E, F, Fut>(&self, key: &str, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<GuardError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _guard = self.locks.lock(key).await;
        let now = self.clock.now();

        let existing = self
            .repo
            .get_idempotency(key)
            .await
            .map_err(GuardError::from)?;
        if let Some(record) = existing.filter(|r| r.is_live(now)) {
            debug!("Replaying stored result for idempotency key {}", key);
            let value = serde_json::from_value(record.result)
                .map_err(|e| GuardError::from(CoreError::from(e)))?;
            return Ok(value);
        }

        let result = compute().await?;

        self.remember(key, &result).await;
        Ok(result)
    }

    /// Store a successful result. A transient write failure is retried once;
    /// after that the key is left unrecorded.
    async fn remember<T: Serialize>(&self, key: &str, result: &T) {
        let stored = match serde_json::to_value(result) {
            Ok(value) => value,
            Err(e) => {
                warn!("Result for idempotency key {} not recorded: {}", key, e);
                return;
            }
        };
        let now = self.clock.now();
        let record = IdempotencyRecord {
            key: key.to_string(),
            result: stored,
            created_at: now,
            expires_at: now + self.ttl,
        };

        let first = match self.repo.put_idempotency(record.clone()).await {
            Ok(()) => return,
            Err(e) if e.is_transient() => e,
            Err(e) => {
                warn!("Result for idempotency key {} not recorded: {}", key, e);
                return;
            }
        };
        debug!("Retrying idempotency write for {}: {}", key, first);
        if let Err(e) = self.repo.put_idempotency(record).await {
            warn!("Result for idempotency key {} not recorded: {}", key, e);
        }
    }

    /// Remove expired records. Returns how many were dropped.
    pub async fn purge_expired(&self) -> Result<usize, GuardError> {
        let removed = self.repo.purge_idempotency(self.clock.now()).await?;
        if removed > 0 {
            info!("Purged {} expired idempotency keys", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use council_core::{ArenaRepository, ManualClock, Repository};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store(clock: Arc<ManualClock>) -> IdempotencyStore {
        IdempotencyStore::new(Arc::new(ArenaRepository::new()), clock, Duration::minutes(10))
    }

    #[tokio::test]
    async fn test_compute_runs_once_within_ttl() {
        let clock = Arc::new(ManualClock::default());
        let store = store(clock);
        let calls = AtomicUsize::new(0);

        let first: Result<String, GuardError> = store
            .get_or_compute("k1", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("advisor-1".to_string())
            })
            .await;
        let second: Result<String, GuardError> = store
            .get_or_compute("k1", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("advisor-2".to_string())
            })
            .await;

        assert_eq!(first.unwrap(), "advisor-1");
        assert_eq!(second.unwrap(), "advisor-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_key_recomputes() {
        let clock = Arc::new(ManualClock::default());
        let store = store(clock.clone());

        let _: Result<u32, GuardError> = store.get_or_compute("k", || async { Ok(1) }).await;
        clock.advance(Duration::minutes(10));
        let again: Result<u32, GuardError> = store.get_or_compute("k", || async { Ok(2) }).await;

        assert_eq!(again.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failed_compute_not_stored() {
        let clock = Arc::new(ManualClock::default());
        let store = store(clock);

        let failed: Result<u32, GuardError> = store
            .get_or_compute("k", || async { Err(GuardError::Unauthenticated) })
            .await;
        assert!(failed.is_err());

        let retried: Result<u32, GuardError> = store.get_or_compute("k", || async { Ok(7) }).await;
        assert_eq!(retried.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_concurrent_same_key_runs_once() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(store(clock));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                let result: Result<usize, GuardError> = store
                    .get_or_compute("shared", || async move {
                        tokio::task::yield_now().await;
                        Ok(calls.fetch_add(1, Ordering::SeqCst))
                    })
                    .await;
                result.unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 0);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_record_write_retried_once() {
        let repo = Arc::new(ArenaRepository::new());
        let store = IdempotencyStore::new(
            repo.clone(),
            Arc::new(ManualClock::default()),
            Duration::minutes(10),
        );
        repo.fail_next_writes(1);

        let first: Result<u32, GuardError> = store.get_or_compute("k", || async { Ok(1) }).await;
        assert_eq!(first.unwrap(), 1);
        let replay: Result<u32, GuardError> = store.get_or_compute("k", || async { Ok(2) }).await;
        assert_eq!(replay.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_success_returned_when_record_cannot_be_written() {
        let repo = Arc::new(ArenaRepository::new());
        let store = IdempotencyStore::new(
            repo.clone(),
            Arc::new(ManualClock::default()),
            Duration::minutes(10),
        );
        repo.fail_next_writes(2);

        let result: Result<u32, GuardError> = store.get_or_compute("k", || async { Ok(5) }).await;
        assert_eq!(result.unwrap(), 5);
        assert!(repo.get_idempotency("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let clock = Arc::new(ManualClock::default());
        let store = store(clock.clone());
        let _: Result<u8, GuardError> = store.get_or_compute("a", || async { Ok(1) }).await;
        clock.advance(Duration::hours(1));
        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }
}
