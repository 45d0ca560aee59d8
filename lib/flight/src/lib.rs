//! Single-flight: concurrent calls for the same key collapse into one
//! computation whose result every caller shares.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

pub struct SingleFlight<K, T> {
    calls: Mutex<HashMap<K, Arc<Call<T>>>>,
}

struct Call<T> {
    notify: Notify,
    slot: Mutex<Option<T>>,
}

impl<T> Call<T> {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            slot: Mutex::new(None),
        }
    }
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Clone + Eq + Hash,
    T: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Clone + Eq + Hash,
    T: Clone,
{
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `make()` unless another caller is already computing `key`, in
    /// which case the result of that computation is awaited and returned.
    ///
    /// If the leading caller is cancelled mid-flight, its waiters re-race:
    /// one of them becomes the new leader and invokes its own `make`.
    pub async fn call<F, Fut>(&self, key: K, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut make = Some(make);

        loop {
            let (call, leader) = {
                let mut calls = self.calls.lock();
                match calls.entry(key.clone()) {
                    Entry::Occupied(occupied) => (Arc::clone(occupied.get()), false),
                    Entry::Vacant(vacant) => {
                        let call = Arc::new(Call::new());
                        vacant.insert(Arc::clone(&call));
                        (call, true)
                    }
                }
            };

            if leader {
                let make = make.take().expect("a caller leads at most once");
                let mut guard = Abandoned {
                    flight: self,
                    key: &key,
                    call: &call,
                    armed: true,
                };
                let value = make().await;
                guard.armed = false;

                *call.slot.lock() = Some(value.clone());
                self.calls.lock().remove(&key);
                call.notify.notify_waiters();

                return value;
            }

            let mut notified = pin!(call.notify.notified());
            notified.as_mut().enable();
            if let Some(value) = call.slot.lock().clone() {
                return value;
            }
            notified.await;
            if let Some(value) = call.slot.lock().clone() {
                return value;
            };
            // the leader was dropped without producing a value; race again
        }
    }
}

/// Wakes waiters when a leader is dropped before completion, so the call
/// does not strand them.
struct Abandoned<'a, K: Eq + Hash, T> {
    flight: &'a SingleFlight<K, T>,
    key: &'a K,
    call: &'a Call<T>,
    armed: bool,
}

impl<K: Eq + Hash, T> Drop for Abandoned<'_, K, T> {
    fn drop(&mut self) {
        if self.armed {
            self.flight.calls.lock().remove(self.key);
            self.call.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::task::JoinSet;

    #[tokio::test]
    async fn concurrent_calls_share_one_execution() {
        static HITS: AtomicUsize = AtomicUsize::new(0);

        let flight = Arc::new(SingleFlight::new());
        let mut tasks = JoinSet::new();

        for i in 0..10 {
            let flight = Arc::clone(&flight);
            tasks.spawn(async move {
                flight
                    .call("key", || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        HITS.fetch_add(1, Ordering::SeqCst);
                        i
                    })
                    .await
            });
        }

        while let Some(Ok(value)) = tasks.join_next().await {
            assert_eq!(value, 0);
        }
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sequential_calls_execute_separately() {
        let flight = SingleFlight::new();

        let a = flight.call("key", || async { 1 }).await;
        let b = flight.call("key", || async { 2 }).await;

        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[tokio::test]
    async fn failures_are_shared_too() {
        let flight: Arc<SingleFlight<&str, Result<u64, String>>> = Arc::new(SingleFlight::new());
        let mut tasks = JoinSet::new();

        for _ in 0..4 {
            let flight = Arc::clone(&flight);
            tasks.spawn(async move {
                flight
                    .call("key", || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err("backend down".to_string())
                    })
                    .await
            });
        }

        while let Some(Ok(result)) = tasks.join_next().await {
            assert_eq!(result.unwrap_err(), "backend down");
        }
    }

    #[tokio::test]
    async fn cancelled_leader_does_not_strand_waiters() {
        let flight: Arc<SingleFlight<&str, u64>> = Arc::new(SingleFlight::new());

        let leader = {
            let flight = Arc::clone(&flight);
            tokio::spawn(async move {
                flight
                    .call("key", || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        1
                    })
                    .await
            })
        };
        // let the leader win the race before spawning the waiter
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiter = {
            let flight = Arc::clone(&flight);
            tokio::spawn(async move { flight.call("key", || async { 2 }).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        leader.abort();
        let value = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must not hang")
            .unwrap();
        assert_eq!(value, 2);
    }
}
