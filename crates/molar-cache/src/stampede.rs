//! Per-key single flight for cache misses.
//!
//! The first caller to miss a key takes a [`FlightLease`]; everyone else who
//! misses the same key while that fetch is running joins its [`Flight`] and
//! receives the same outcome. Deduplication is process-local.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::sync::oneshot;

use crate::error::FetchError;

/// Type-erased result shared by every waiter of one fetch.
pub(crate) type FlightOutcome = Result<Arc<dyn Any + Send + Sync>, FetchError>;
pub(crate) type Flight = Shared<BoxFuture<'static, FlightOutcome>>;

#[derive(Clone)]
struct PendingFetch {
    id: u64,
    flight: Flight,
}

#[derive(Default)]
pub(crate) struct StampedeGuard {
    pending: Arc<DashMap<String, PendingFetch>>,
    next_id: AtomicU64,
}

pub(crate) enum Joined {
    /// No fetch was running; the caller must start one through the lease.
    Leader(FlightLease),
    /// A fetch is already running for this key.
    Follower(Flight),
}

impl StampedeGuard {
    /// Joins the running fetch for `key`, or reserves the key for a new one.
    ///
    /// Check and reservation happen under the map's shard lock, so two
    /// callers can never both become leader for the same key.
    pub(crate) fn join(&self, key: &str) -> Joined {
        match self.pending.entry(key.to_string()) {
            Entry::Occupied(entry) => Joined::Follower(entry.get().flight.clone()),
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel::<FlightOutcome>();
                let flight = async move {
                    rx.await.unwrap_or_else(|_| {
                        Err(FetchError::Aborted("fetch ended without a result".into()))
                    })
                }
                .boxed()
                .shared();
                entry.insert(PendingFetch {
                    id,
                    flight: flight.clone(),
                });
                Joined::Leader(FlightLease {
                    tx,
                    flight,
                    cleanup: PendingCleanup {
                        pending: Arc::clone(&self.pending),
                        key: key.to_string(),
                        id,
                    },
                })
            }
        }
    }

    /// Number of fetches currently in flight.
    pub(crate) fn in_flight(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }
}

/// Exclusive right to run the fetch for one key.
///
/// Dropping the lease without calling [`FlightLease::run`] releases the key
/// and resolves waiters with [`FetchError::Aborted`].
pub(crate) struct FlightLease {
    tx: oneshot::Sender<FlightOutcome>,
    flight: Flight,
    cleanup: PendingCleanup,
}

impl FlightLease {
    /// Runs `work` to completion on its own task and returns the shared flight.
    ///
    /// The task is detached: the fetch finishes even if every waiter is
    /// dropped. The pending entry is released before waiters are woken.
    pub(crate) fn run<Fut>(self, work: Fut) -> Flight
    where
        Fut: Future<Output = FlightOutcome> + Send + 'static,
    {
        let FlightLease {
            tx,
            flight,
            cleanup,
        } = self;
        tokio::spawn(async move {
            let outcome = work.await;
            drop(cleanup);
            // Nobody listening is fine: the value is already in the cache.
            let _ = tx.send(outcome);
        });
        flight
    }
}

/// Removes the pending entry on drop, including during a panic unwind.
struct PendingCleanup {
    pending: Arc<DashMap<String, PendingFetch>>,
    key: String,
    id: u64,
}

impl Drop for PendingCleanup {
    fn drop(&mut self) {
        let id = self.id;
        self.pending.remove_if(&self.key, |_, entry| entry.id == id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_second_caller_follows() {
        let guard = StampedeGuard::default();

        let lease = match guard.join("k") {
            Joined::Leader(lease) => lease,
            Joined::Follower(_) => panic!("first caller must lead"),
        };
        let follower = match guard.join("k") {
            Joined::Follower(flight) => flight,
            Joined::Leader(_) => panic!("second caller must follow"),
        };
        assert_eq!(guard.in_flight(), 1);

        let leader = lease.run(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(Arc::new(7u32) as Arc<dyn Any + Send + Sync>)
        });

        let a = leader.await.unwrap();
        let b = follower.await.unwrap();
        assert_eq!(*a.downcast::<u32>().unwrap(), 7);
        assert_eq!(*b.downcast::<u32>().unwrap(), 7);
        assert!(!guard.is_pending("k"));
    }

    #[tokio::test]
    async fn test_entry_removed_after_error() {
        let guard = StampedeGuard::default();
        let Joined::Leader(lease) = guard.join("k") else {
            panic!("first caller must lead");
        };
        let flight = lease.run(async { Err(FetchError::Aborted("boom".into())) });

        assert!(flight.await.is_err());
        assert_eq!(guard.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_dropped_lease_releases_key() {
        let guard = StampedeGuard::default();
        let Joined::Leader(lease) = guard.join("k") else {
            panic!("first caller must lead");
        };
        let Joined::Follower(follower) = guard.join("k") else {
            panic!("second caller must follow");
        };

        drop(lease);

        assert!(!guard.is_pending("k"));
        assert!(matches!(follower.await, Err(FetchError::Aborted(_))));
        assert!(matches!(guard.join("k"), Joined::Leader(_)));
    }

    #[tokio::test]
    async fn test_panicking_fetch_releases_key() {
        let guard = StampedeGuard::default();
        let Joined::Leader(lease) = guard.join("k") else {
            panic!("first caller must lead");
        };
        let flight = lease.run(async { panic!("fetcher exploded") });

        assert!(matches!(flight.await, Err(FetchError::Aborted(_))));
        assert!(!guard.is_pending("k"));
    }
}
