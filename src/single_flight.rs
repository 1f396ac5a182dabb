//! Request coalescing.
//!
//! At most one unit of work runs at a time. Callers arriving while it runs
//! get a handle on the same shared future instead of starting another one.
//! The work is spawned onto the runtime, so it completes even if every
//! waiter stops polling.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, warn};

use crate::error::FetchError;

/// Handle on an in-flight unit of work.
pub type Flight<T> = Shared<BoxFuture<'static, Result<T, FetchError>>>;

struct Slot<T: Clone> {
    id: u64,
    flight: Flight<T>,
}

pub struct SingleFlight<T: Clone> {
    slot: Arc<Mutex<Option<Slot<T>>>>,
    next_id: AtomicU64,
}

/// Clears the slot when the leader task ends, including by panic.
struct ClearOnDrop<T: Clone> {
    slot: Arc<Mutex<Option<Slot<T>>>>,
    id: u64,
}

impl<T: Clone> Drop for ClearOnDrop<T> {
    fn drop(&mut self) {
        let mut slot = lock_slot(&self.slot);
        if slot.as_ref().map(|s| s.id) == Some(self.id) {
            *slot = None;
        }
    }
}

fn lock_slot<T: Clone>(slot: &Mutex<Option<Slot<T>>>) -> MutexGuard<'_, Option<Slot<T>>> {
    slot.lock().unwrap_or_else(|poisoned| {
        warn!("Single-flight mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
        }
    }

    /// Joins the in-flight work, or starts `work` if nothing is running.
    ///
    /// `work` is only polled when this call becomes the leader. Returns the
    /// shared handle and whether this call started it.
    pub fn join_or_start<F>(&self, work: F) -> (Flight<T>, bool)
    where
        F: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let mut slot = lock_slot(&self.slot);
        if let Some(existing) = slot.as_ref() {
            debug!("Joining in-flight refresh #{}", existing.id);
            return (existing.flight.clone(), false);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = ClearOnDrop {
            slot: Arc::clone(&self.slot),
            id,
        };
        // The guard lives inside the task: the slot is cleared before the
        // join handle resolves, so late callers start a new flight.
        let task = tokio::spawn(async move {
            let _guard = guard;
            work.await
        });
        let flight = async move {
            match task.await {
                Ok(result) => result,
                Err(join_err) => Err(FetchError::from(join_err)),
            }
        }
        .boxed()
        .shared();

        *slot = Some(Slot {
            id,
            flight: flight.clone(),
        });
        debug!("Started refresh #{}", id);
        (flight, true)
    }

    pub fn is_in_flight(&self) -> bool {
        lock_slot(&self.slot).is_some()
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_execution() {
        let flights = Arc::new(SingleFlight::<u32>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let flights = Arc::clone(&flights);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                let (flight, _) = flights.join_or_start(async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(7)
                });
                flight.await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(7));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!flights.is_in_flight());
    }

    #[tokio::test]
    async fn test_error_is_delivered_to_every_waiter() {
        let flights = SingleFlight::<u32>::new();
        let (first, leader) = flights.join_or_start(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(FetchError::RateLimited("429".into()))
        });
        let (second, follower) = flights.join_or_start(async { Ok(1) });

        assert!(leader);
        assert!(!follower);
        let expected = Err(FetchError::RateLimited("429".into()));
        assert_eq!(first.await, expected);
        assert_eq!(second.await, expected);
    }

    #[tokio::test]
    async fn test_new_flight_after_completion() {
        let flights = SingleFlight::<u32>::new();
        let (first, _) = flights.join_or_start(async { Ok(1) });
        assert_eq!(first.await, Ok(1));

        let (second, leader) = flights.join_or_start(async { Ok(2) });
        assert!(leader);
        assert_eq!(second.await, Ok(2));
    }

    #[tokio::test]
    async fn test_work_completes_without_waiters() {
        let flights = SingleFlight::<u32>::new();
        let done = Arc::new(AtomicUsize::new(0));
        let marker = Arc::clone(&done);
        let (flight, _) = flights.join_or_start(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            marker.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        });
        drop(flight);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(!flights.is_in_flight());
    }

    #[tokio::test]
    async fn test_panicking_work_is_reported_and_cleared() {
        let flights = SingleFlight::<u32>::new();
        let work: BoxFuture<'static, Result<u32, FetchError>> = async { panic!("boom") }.boxed();
        let (flight, _) = flights.join_or_start(work);
        assert!(matches!(flight.await, Err(FetchError::Network(_))));
        assert!(!flights.is_in_flight());
    }
}
