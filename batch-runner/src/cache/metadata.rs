//! Platform metadata cache.
//!
//! Keyed, TTL-bounded cache with an injected async fetch function. Concurrent
//! misses on the same key share a single fetch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use tokio::sync::{Notify, OnceCell};
use tracing::debug;

use crate::{Error, Result};

/// Default TTL for cached metadata (1 hour).
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Async function that fetches the value of a key.
pub type FetchFn<V> = Arc<dyn Fn(String) -> BoxFuture<'static, Result<V>> + Send + Sync>;

struct CacheEntry<V> {
    value: Arc<V>,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

type InFlightResult<V> = std::result::Result<Arc<V>, String>;

struct InFlightState<V> {
    result: OnceCell<InFlightResult<V>>,
    notify: Notify,
}

impl<V> InFlightState<V> {
    fn new() -> Self {
        Self {
            result: OnceCell::new(),
            notify: Notify::new(),
        }
    }

    fn set_result(&self, result: InFlightResult<V>) {
        let _ = self.result.set(result);
        self.notify.notify_waiters();
    }

    async fn wait(&self) -> InFlightResult<V> {
        loop {
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            let notified = self.notify.notified();
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            notified.await;
        }
    }
}

/// Caller-owned cache of platform-supplied metadata.
pub struct MetadataCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    in_flight: DashMap<String, Arc<InFlightState<V>>>,
    fetch: FetchFn<V>,
    ttl: Duration,
}

impl<V: Send + Sync + 'static> MetadataCache<V> {
    pub fn new<F>(ttl: Duration, fetch: F) -> Self
    where
        F: Fn(String) -> BoxFuture<'static, Result<V>> + Send + Sync + 'static,
    {
        Self {
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            fetch: Arc::new(fetch),
            ttl,
        }
    }

    /// Cached value of `key`, fetching it when missing or expired.
    pub async fn get(&self, key: &str) -> Result<Arc<V>> {
        if let Some(value) = self.get_cached(key) {
            return Ok(value);
        }

        let (request, is_new) = self.get_or_create_in_flight(key);
        if !is_new {
            return request.wait().await.map_err(Error::Other);
        }

        debug!(key = %key, "Fetching metadata");
        let mut guard = InFlightGuard {
            cache: self,
            key,
            request: &request,
            done: false,
        };
        let result = (self.fetch)(key.to_string()).await;
        guard.done = true;

        match result {
            Ok(value) => {
                let value = Arc::new(value);
                self.complete_in_flight(key, &request, Ok(value.clone()));
                Ok(value)
            }
            Err(e) => {
                self.complete_in_flight(key, &request, Err(e.to_string()));
                Err(e)
            }
        }
    }

    /// Cached value of `key` without fetching. Expired entries are evicted.
    pub fn get_cached(&self, key: &str) -> Option<Arc<V>> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.insert_arc(key.into(), Arc::new(value));
    }

    /// Drop the cached value of `key`. Waiters on an in-flight fetch get an error.
    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
        if let Some((_, request)) = self.in_flight.remove(key) {
            request.set_result(Err(format!("metadata for '{key}' invalidated")));
        }
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
        self.in_flight.retain(|_, request| {
            request.set_result(Err("metadata cache invalidated".to_string()));
            false
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert_arc(&self, key: String, value: Arc<V>) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    fn get_or_create_in_flight(&self, key: &str) -> (Arc<InFlightState<V>>, bool) {
        if let Some(existing) = self.in_flight.get(key) {
            return (existing.clone(), false);
        }

        match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let request = Arc::new(InFlightState::new());
                entry.insert(request.clone());
                (request, true)
            }
        }
    }

    /// Publish the fetch result to waiters, caching it on success.
    ///
    /// A request that was invalidated meanwhile is still answered but not cached.
    fn complete_in_flight(
        &self,
        key: &str,
        request: &Arc<InFlightState<V>>,
        result: InFlightResult<V>,
    ) {
        let current = self
            .in_flight
            .remove_if(key, |_, current| Arc::ptr_eq(current, request))
            .is_some();

        if current && let Ok(value) = &result {
            self.insert_arc(key.to_string(), value.clone());
        }
        request.set_result(result);
    }
}

/// Fails the in-flight request if the fetching caller is dropped mid-fetch.
struct InFlightGuard<'a, V: Send + Sync + 'static> {
    cache: &'a MetadataCache<V>,
    key: &'a str,
    request: &'a Arc<InFlightState<V>>,
    done: bool,
}

impl<V: Send + Sync + 'static> Drop for InFlightGuard<'_, V> {
    fn drop(&mut self) {
        if !self.done {
            self.cache.complete_in_flight(
                self.key,
                self.request,
                Err("metadata fetch abandoned".to_string()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_cache(ttl: Duration, delay_ms: u64) -> (MetadataCache<String>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cache = MetadataCache::new(ttl, move |key: String| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(format!("value-{key}"))
            }) as BoxFuture<'static, Result<String>>
        });
        (cache, calls)
    }

    #[tokio::test]
    async fn test_hit_after_fetch() {
        let (cache, calls) = counting_cache(DEFAULT_TTL, 0);
        assert_eq!(*cache.get("a").await.unwrap(), "value-a");
        assert_eq!(*cache.get("a").await.unwrap(), "value-a");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_fetch() {
        let (cache, calls) = counting_cache(DEFAULT_TTL, 50);
        let cache = Arc::new(cache);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move { cache.get("k").await }));
        }
        for task in tasks {
            assert_eq!(*task.await.unwrap().unwrap(), "value-k");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let (cache, calls) = counting_cache(DEFAULT_TTL, 0);
        cache.get("a").await.unwrap();
        cache.invalidate("a");
        assert!(cache.get_cached("a").is_none());
        cache.get("a").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        cache.invalidate_all();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_expired_entry_is_refetched() {
        let (cache, calls) = counting_cache(Duration::from_millis(10), 0);
        cache.get("a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get_cached("a").is_none());
        cache.get("a").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_error_is_not_cached() {
        let cache: MetadataCache<String> = MetadataCache::new(DEFAULT_TTL, |_key: String| {
            Box::pin(async { Err(Error::Other("platform unavailable".to_string())) })
                as BoxFuture<'static, Result<String>>
        });
        let err = cache.get("a").await.unwrap_err();
        assert_eq!(err.to_string(), "platform unavailable");
        assert!(cache.is_empty());
    }
}
