//! In-process store used for single-instance deployments and tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::KvStore;
use crate::error::KvError;
use crate::pattern::KeyPattern;

/// Minimum clock time between two expiry sweeps triggered by writes.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct MemEntry {
    value: String,
    expires_at: Instant,
    /// Insertion order, doubles as the SCAN cursor position.
    seq: u64,
}

impl MemEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// DashMap-backed [`KvStore`] with per-key expiry.
///
/// Expiry uses `tokio::time::Instant`, so tests can drive it with a paused
/// clock. `SCAN` walks keys in insertion order and is stable under deletes.
///
/// Reads drop the expired key they touch; writes sweep every expired entry
/// at most once per [`SWEEP_INTERVAL`], so keys that are written once and
/// never read again (stats buckets, one-off filter digests) do not pile up.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, MemEntry>,
    next_seq: AtomicU64,
    epoch: Instant,
    last_sweep_ms: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_seq: AtomicU64::new(0),
            epoch: Instant::now(),
            last_sweep_ms: AtomicU64::new(0),
        }
    }

    /// Entries held in memory, including expired ones not yet swept.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            if entry.is_expired(now) {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    fn maybe_sweep(&self, now: Instant) {
        let now_ms = u64::try_from(now.saturating_duration_since(self.epoch).as_millis())
            .unwrap_or(u64::MAX);
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < SWEEP_INTERVAL.as_millis() as u64 {
            return;
        }
        if self
            .last_sweep_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let removed = self.purge_expired();
        if removed > 0 {
            tracing::debug!(removed, retained = self.entries.len(), "swept expired entries");
        }
    }

    fn live_value(&self, key: &str) -> Option<MemEntry> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Some(entry.clone());
            }
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired(now));
        }
        None
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.live_value(key).map(|e| e.value))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError> {
        let now = Instant::now();
        self.maybe_sweep(now);

        // Sequence numbers start at 1; cursor 0 means "from the beginning".
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.entries.insert(
            key.to_string(),
            MemEntry {
                value: value.to_string(),
                expires_at: now + Duration::from_secs(ttl_secs),
                seq,
            },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, KvError> {
        let now = Instant::now();
        let mut removed = 0;
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(key) {
                if !entry.is_expired(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.live_value(key).is_some())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        Ok(self
            .live_value(key)
            .map(|e| e.expires_at.saturating_duration_since(Instant::now())))
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), KvError> {
        let matcher = KeyPattern::new(pattern)?;
        let now = Instant::now();

        let mut window: Vec<(u64, String, bool)> = self
            .entries
            .iter()
            .filter(|e| e.seq >= cursor)
            .map(|e| (e.seq, e.key().clone(), e.is_expired(now)))
            .collect();
        window.sort_unstable_by_key(|(seq, _, _)| *seq);

        let count = count.max(1);
        let more = window.len() > count;
        window.truncate(count);

        let next = match (more, window.last()) {
            (true, Some((seq, _, _))) => seq + 1,
            _ => 0,
        };
        let keys = window
            .into_iter()
            .filter(|(_, key, expired)| !expired && matcher.matches(key))
            .map(|(_, key, _)| key)
            .collect();
        Ok((next, keys))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn scan_all(store: &MemoryStore, pattern: &str, count: usize) -> (Vec<String>, usize) {
        let mut cursor = 0;
        let mut keys = Vec::new();
        let mut steps = 0;
        loop {
            let (next, batch) = store.scan(cursor, pattern, count).await.unwrap();
            steps += 1;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        (keys, steps)
    }

    #[tokio::test]
    async fn test_set_get_del() {
        let store = MemoryStore::new();
        store.set_ex("a", "1", 60).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert!(store.exists("a").await.unwrap());
        assert_eq!(store.del(&["a".into(), "missing".into()]).await.unwrap(), 1);
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let store = MemoryStore::new();
        store.set_ex("short", "v", 1).await.unwrap();
        assert_eq!(
            store.ttl("short").await.unwrap(),
            Some(Duration::from_secs(1))
        );

        tokio::time::advance(Duration::from_millis(1001)).await;

        assert_eq!(store.get("short").await.unwrap(), None);
        assert!(!store.exists("short").await.unwrap());
        assert_eq!(store.ttl("short").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scan_iterates_in_batches() {
        let store = MemoryStore::new();
        for i in 0..25 {
            store.set_ex(&format!("ns:a:{i}"), "v", 60).await.unwrap();
            store.set_ex(&format!("ns:b:{i}"), "v", 60).await.unwrap();
        }

        let (keys, steps) = scan_all(&store, "ns:a:*", 10).await;
        assert_eq!(keys.len(), 25);
        assert!(keys.iter().all(|k| k.starts_with("ns:a:")));
        assert_eq!(steps, 5);
    }

    #[tokio::test]
    async fn test_scan_stable_under_delete() {
        let store = MemoryStore::new();
        for i in 0..30 {
            store.set_ex(&format!("k:{i}"), "v", 60).await.unwrap();
        }

        let mut cursor = 0;
        let mut deleted = 0;
        loop {
            let (next, batch) = store.scan(cursor, "k:*", 7).await.unwrap();
            deleted += store.del(&batch).await.unwrap();
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(deleted, 30);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = MemoryStore::new();
        store.set_ex("a", "v", 1).await.unwrap();
        store.set_ex("b", "v", 60).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_sweep_expired_entries() {
        let store = MemoryStore::new();
        for i in 0..10_000 {
            store.set_ex(&format!("apm:stats:5m:{i}"), "{}", 1).await.unwrap();
        }
        assert_eq!(store.entry_count(), 10_000);

        tokio::time::advance(Duration::from_secs(10)).await;
        store.set_ex("live", "v", 60).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.entry_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_waits_for_interval() {
        let store = MemoryStore::new();
        store.set_ex("a", "v", 1).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        store.set_ex("b", "v", 60).await.unwrap();
        assert_eq!(store.entry_count(), 2);

        tokio::time::advance(Duration::from_secs(4)).await;
        store.set_ex("c", "v", 60).await.unwrap();
        assert_eq!(store.entry_count(), 2);
        assert_eq!(store.get("b").await.unwrap().as_deref(), Some("v"));
    }
}
