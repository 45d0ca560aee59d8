//! In-memory cache with per-key TTLs and a bounded footprint.
//!
//! Expiry runs on a shared timing wheel (one timer per key), the TTL is
//! randomised by a few percent so a burst of inserts does not expire as a
//! burst, and concurrent fills for the same key collapse to one fetch.

#[macro_use]
extern crate tracing;

mod unstable;

pub use timewheel::Error;
pub use unstable::Unstable;

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use flight::SingleFlight;
use lru::LruCache;
use parking_lot::Mutex;
use timewheel::TimingWheel;

const DEFAULT_NAME: &str = "proc";
const WHEEL_INTERVAL: Duration = Duration::from_secs(1);
const WHEEL_SLOTS: usize = 300;
const STAT_INTERVAL: Duration = Duration::from_secs(60);
// expiry jitters within [0.95, 1.05] of the requested ttl
const EXPIRY_DEVIATION: f64 = 0.05;

/// Errors coming out of the fetch callback of [`Cache::take`], shared
/// verbatim with every caller that piggybacked on the same fetch.
pub type FetchError = Arc<dyn std::error::Error + Send + Sync>;

/// A local cache of string keys to clonable values.
pub struct Cache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for Cache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub struct Builder {
    expire: Duration,
    name: String,
    limit: Option<NonZeroUsize>,
}

impl Builder {
    /// A builder for a cache whose entries expire after roughly `expire`.
    pub fn new(expire: Duration) -> Self {
        Self {
            expire,
            name: DEFAULT_NAME.to_string(),
            limit: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Caps the number of entries; beyond it the least recently used key
    /// is evicted.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = NonZeroUsize::new(limit);
        self
    }

    /// Must be called inside a tokio runtime: the expiry wheel and the
    /// stats loop are spawned here.
    pub fn build<V>(self) -> Result<Cache<V>, Error>
    where
        V: Clone + Send + Sync + 'static,
    {
        let hook: Arc<OnceLock<Weak<Inner<V>>>> = Arc::new(OnceLock::new());
        let wheel_hook = Arc::clone(&hook);
        let wheel = TimingWheel::new(WHEEL_INTERVAL, WHEEL_SLOTS, move |key: String, ()| {
            if let Some(inner) = wheel_hook.get().and_then(Weak::upgrade) {
                inner.evict(&key);
            }
        })?;

        let inner = Arc::new(Inner {
            name: self.name,
            data: Mutex::new(Store {
                map: HashMap::new(),
                lru: self.limit.map(LruCache::new),
            }),
            expire: self.expire,
            wheel,
            barrier: SingleFlight::new(),
            unstable: Unstable::new(EXPIRY_DEVIATION),
            hit: AtomicU64::new(0),
            miss: AtomicU64::new(0),
        });
        let _ = hook.set(Arc::downgrade(&inner));

        tokio::spawn(stat_loop(Arc::downgrade(&inner)));

        Ok(Cache { inner })
    }
}

impl<V> Cache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// A cache whose entries expire after roughly `expire`.
    pub fn new(expire: Duration) -> Result<Self, Error> {
        Builder::new(expire).build()
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let value = self.inner.do_get(key);
        if value.is_some() {
            self.inner.hit.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.miss.fetch_add(1, Ordering::Relaxed);
        }

        value
    }

    pub async fn set(&self, key: &str, value: V) {
        self.set_with_expire(key, value, self.inner.expire).await;
    }

    pub async fn set_with_expire(&self, key: &str, value: V, expire: Duration) {
        let (existed, evicted) = {
            let mut data = self.inner.data.lock();
            let existed = data.map.insert(key.to_string(), value).is_some();
            let evicted = data.touch_lru(key);
            if let Some(victim) = &evicted {
                data.map.remove(victim);
            }
            (existed, evicted)
        };

        if let Some(victim) = evicted {
            let _ = self.inner.wheel.remove_timer(victim).await;
        }

        let expiry = self.inner.unstable.around_duration(expire);
        if existed {
            let _ = self.inner.wheel.move_timer(key.to_string(), expiry).await;
        } else {
            let _ = self.inner.wheel.set_timer(key.to_string(), (), expiry).await;
        }
    }

    pub async fn del(&self, key: &str) {
        {
            let mut data = self.inner.data.lock();
            data.map.remove(key);
            if let Some(lru) = data.lru.as_mut() {
                lru.pop(key);
            }
        }

        let _ = self.inner.wheel.remove_timer(key.to_string()).await;
    }

    /// Returns the cached value, or fetches, stores and returns it. At most
    /// one fetch runs per key across concurrent callers; the others share
    /// its outcome, including failure.
    pub async fn take<F, Fut>(&self, key: &str, fetch: F) -> Result<V, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, Box<dyn std::error::Error + Send + Sync>>>,
    {
        if let Some(value) = self.inner.do_get(key) {
            self.inner.hit.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        let fresh = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fresh_flag = Arc::clone(&fresh);
        let cache = self.clone();
        let owned_key = key.to_string();
        let result = self
            .inner
            .barrier
            .call(key.to_string(), move || async move {
                // the map lookup is cheap and the fetch is not: another
                // caller may have stored the value while we queued
                if let Some(value) = cache.inner.do_get(&owned_key) {
                    return Ok(value);
                }

                match fetch().await {
                    Ok(value) => {
                        fresh_flag.store(true, Ordering::Relaxed);
                        cache.set(&owned_key, value.clone()).await;
                        Ok(value)
                    }
                    Err(err) => Err(FetchError::from(err)),
                }
            })
            .await;

        match result {
            Ok(value) => {
                if fresh.load(Ordering::Relaxed) {
                    self.inner.miss.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.inner.hit.fetch_add(1, Ordering::Relaxed);
                }
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Inner<V> {
    name: String,
    data: Mutex<Store<V>>,
    expire: Duration,
    wheel: TimingWheel<String, ()>,
    barrier: SingleFlight<String, Result<V, FetchError>>,
    unstable: Unstable,
    hit: AtomicU64,
    miss: AtomicU64,
}

struct Store<V> {
    map: HashMap<String, V>,
    lru: Option<LruCache<String, ()>>,
}

impl<V> Store<V> {
    /// Promotes `key` in the LRU and returns the key evicted to make room,
    /// if any.
    fn touch_lru(&mut self, key: &str) -> Option<String> {
        let lru = self.lru.as_mut()?;
        let evicted = lru.push(key.to_string(), ());
        match evicted {
            Some((victim, ())) if victim != key => Some(victim),
            _ => None,
        }
    }
}

impl<V: Clone> Inner<V> {
    fn do_get(&self, key: &str) -> Option<V> {
        let mut data = self.data.lock();
        let value = data.map.get(key).cloned();
        if value.is_some() {
            if let Some(lru) = data.lru.as_mut() {
                lru.promote(key);
            }
        }

        value
    }

    /// Timer-driven removal; the timer has already fired, so only the map
    /// and the LRU need cleaning.
    fn evict(&self, key: &str) {
        let mut data = self.data.lock();
        data.map.remove(key);
        if let Some(lru) = data.lru.as_mut() {
            lru.pop(key);
        }
    }

    fn size(&self) -> usize {
        self.data.lock().map.len()
    }
}

async fn stat_loop<V: Clone>(inner: Weak<Inner<V>>) {
    let mut ticker = tokio::time::interval(STAT_INTERVAL);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };

        let hit = inner.hit.swap(0, Ordering::Relaxed);
        let miss = inner.miss.swap(0, Ordering::Relaxed);
        let total = hit + miss;
        if total == 0 {
            continue;
        }

        let ratio = 100.0 * hit as f64 / total as f64;
        info!(
            message = "cache stats",
            name = %inner.name,
            qpm = total,
            hit_ratio = %format_args!("{ratio:.1}%"),
            elements = inner.size(),
            hit,
            miss,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::task::JoinSet;
    use tokio::time::sleep;

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn set_get_del_roundtrip() {
        let cache: Cache<String> = Cache::new(Duration::from_secs(60)).unwrap();

        cache.set("first", "hello".to_string()).await;
        assert_eq!(cache.get("first"), Some("hello".to_string()));

        cache.del("first").await;
        assert_eq!(cache.get("first"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let cache: Cache<u64> = Cache::new(Duration::from_secs(2)).unwrap();

        cache.set("gone", 7).await;
        assert_eq!(cache.get("gone"), Some(7));

        sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(cache.get("gone"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn set_refreshes_the_ttl() {
        let cache: Cache<u64> = Cache::new(Duration::from_secs(4)).unwrap();

        cache.set("kept", 1).await;
        sleep(Duration::from_secs(2)).await;
        cache.set("kept", 2).await;
        sleep(Duration::from_secs(2)).await;
        settle().await;

        // 4s since the first set, but only 2s since the refresh
        assert_eq!(cache.get("kept"), Some(2));

        sleep(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(cache.get("kept"), None);
    }

    #[tokio::test]
    async fn lru_limit_evicts_the_oldest() {
        let cache: Cache<u64> = Builder::new(Duration::from_secs(60))
            .limit(2)
            .build()
            .unwrap();

        cache.set("a", 1).await;
        cache.set("b", 2).await;
        // touching a makes b the eviction candidate
        assert_eq!(cache.get("a"), Some(1));
        cache.set("c", 3).await;

        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn take_fetches_once_across_concurrent_callers() {
        static FETCHES: AtomicUsize = AtomicUsize::new(0);

        let cache: Cache<u64> = Cache::new(Duration::from_secs(60)).unwrap();
        let mut tasks = JoinSet::new();
        for _ in 0..16 {
            let cache = cache.clone();
            tasks.spawn(async move {
                cache
                    .take("answer", || async {
                        FETCHES.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            assert_eq!(joined.unwrap().unwrap(), 42);
        }
        assert_eq!(FETCHES.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get("answer"), Some(42));
    }

    #[tokio::test]
    async fn take_shares_failures_then_retries() {
        let cache: Cache<u64> = Cache::new(Duration::from_secs(60)).unwrap();

        let err = cache
            .take("flaky", || async { Err("backend down".into()) })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "backend down");
        assert_eq!(cache.get("flaky"), None);

        // a failed fetch caches nothing; the next take fetches again
        let value = cache.take("flaky", || async { Ok(9) }).await.unwrap();
        assert_eq!(value, 9);
    }

    #[tokio::test]
    async fn take_prefers_the_cached_value() {
        let cache: Cache<u64> = Cache::new(Duration::from_secs(60)).unwrap();
        cache.set("present", 5).await;

        let value = cache
            .take("present", || async { panic!("must not fetch") })
            .await
            .unwrap();
        assert_eq!(value, 5);
    }
}
