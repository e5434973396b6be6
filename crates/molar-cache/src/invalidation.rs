//! Pattern-based invalidation.
//!
//! Keys are found with cursor-based `SCAN` rather than `KEYS`, so a large
//! keyspace never blocks the store. Each batch is removed with one `DEL`.

use crate::cache::Cache;
use crate::metrics;

impl Cache {
    /// Deletes every key matching the glob `pattern`; returns how many were removed.
    ///
    /// A scan or delete failure stops the walk and the count so far is
    /// returned.
    pub async fn delete_by_pattern(&self, pattern: &str) -> u64 {
        let kv = &self.inner.kv;
        if !kv.is_available() {
            return 0;
        }

        let mut cursor = 0;
        let mut deleted = 0;
        loop {
            let (next, keys) = match kv.try_scan(cursor, pattern, self.inner.scan_batch_size).await {
                Ok(step) => step,
                Err(e) => {
                    tracing::warn!(
                        pattern = %pattern,
                        deleted,
                        error = %e,
                        "SCAN failed during invalidation"
                    );
                    break;
                }
            };

            if !keys.is_empty() {
                match kv.try_delete_many(&keys).await {
                    Ok(n) => deleted += n,
                    Err(e) => {
                        tracing::warn!(
                            pattern = %pattern,
                            deleted,
                            error = %e,
                            "DEL failed during invalidation"
                        );
                        break;
                    }
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        metrics::record_keys_invalidated(deleted);
        tracing::debug!(pattern = %pattern, deleted, "invalidated cache keys");
        deleted
    }

    /// Runs [`Cache::delete_by_pattern`] for each pattern and sums the counts.
    pub async fn delete_by_patterns<S: AsRef<str>>(&self, patterns: &[S]) -> u64 {
        let mut deleted = 0;
        for pattern in patterns {
            deleted += self.delete_by_pattern(pattern.as_ref()).await;
        }
        deleted
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::cache::Cache;
    use crate::error::KvError;
    use crate::kv::{KvClient, KvOptions, KvStore, MemoryStore};

    /// Store whose SCAN fails after a number of successful steps.
    struct ScanFailsAfter {
        ok_steps: AtomicU32,
        inner: MemoryStore,
    }

    #[async_trait]
    impl KvStore for ScanFailsAfter {
        async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
            self.inner.get(key).await
        }

        async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError> {
            self.inner.set_ex(key, value, ttl_secs).await
        }

        async fn del(&self, keys: &[String]) -> Result<u64, KvError> {
            self.inner.del(keys).await
        }

        async fn exists(&self, key: &str) -> Result<bool, KvError> {
            self.inner.exists(key).await
        }

        async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
            self.inner.ttl(key).await
        }

        async fn scan(
            &self,
            cursor: u64,
            pattern: &str,
            count: usize,
        ) -> Result<(u64, Vec<String>), KvError> {
            let left = self.ok_steps.load(Ordering::SeqCst);
            if left == 0 {
                return Err(KvError::unavailable("connection lost"));
            }
            self.ok_steps.store(left - 1, Ordering::SeqCst);
            self.inner.scan(cursor, pattern, count).await
        }

        fn backend_name(&self) -> &'static str {
            "scan-fails"
        }
    }

    #[tokio::test]
    async fn test_walks_every_batch() {
        let cache = Cache::with_scan_batch_size(KvClient::in_memory(), 4);
        for i in 0..10 {
            cache.set(&format!("t1:patients:{i}"), &i, Duration::from_secs(60)).await;
        }
        cache.set("t2:patients:1", &1, Duration::from_secs(60)).await;

        assert_eq!(cache.delete_by_pattern("t1:patients:*").await, 10);
        assert!(cache.exists("t2:patients:1").await);
    }

    #[tokio::test]
    async fn test_multiple_patterns_sum() {
        let cache = Cache::new(KvClient::in_memory());
        for key in ["a:1", "a:2", "b:1", "c:1"] {
            cache.set(key, &true, Duration::from_secs(60)).await;
        }

        assert_eq!(cache.delete_by_patterns(&["a:*", "b:*", "z:*"]).await, 3);
        assert!(cache.exists("c:1").await);
    }

    #[tokio::test]
    async fn test_scan_failure_returns_partial_count() {
        let store = Arc::new(ScanFailsAfter {
            ok_steps: AtomicU32::new(1),
            inner: MemoryStore::new(),
        });
        for i in 0..6 {
            store.inner.set_ex(&format!("k:{i}"), "1", 60).await.unwrap();
        }
        let cache = Cache::with_scan_batch_size(KvClient::with_store(store, KvOptions::default()), 2);

        assert_eq!(cache.delete_by_pattern("k:*").await, 2);
    }

    #[tokio::test]
    async fn test_unavailable_store_deletes_nothing() {
        let cache = Cache::new(KvClient::unavailable());
        assert_eq!(cache.delete_by_pattern("*").await, 0);
    }
}
