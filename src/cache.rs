use moka::future::Cache;
use moka::Expiry;
use std::time::{Duration, Instant};

#[derive(Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// Expires every entry at the deadline it was stored with.
struct EntryDeadline;

impl<V> Expiry<String, CacheEntry<V>> for EntryDeadline {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &CacheEntry<V>,
        created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.expires_at.saturating_duration_since(created_at))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &CacheEntry<V>,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.expires_at.saturating_duration_since(updated_at))
    }
}

/// Process-wide key/value store where each entry carries its own time to live.
///
/// Expired entries are never returned; there is no single-flight protection, so two
/// concurrent misses on the same key both go upstream.
#[derive(Clone)]
pub struct CacheStore<V> {
    cache: Cache<String, CacheEntry<V>>,
}

impl<V> CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(EntryDeadline)
            .build();

        Self { cache }
    }

    /// Stores `value` under `key` until `ttl` elapses, replacing any previous entry.
    pub async fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        tracing::debug!(key = %key, ttl_secs = ttl.as_secs_f64(), "Cache set");
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.cache.insert(key, entry).await;
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        match self.cache.get(key).await {
            Some(entry) if Instant::now() < entry.expires_at => {
                tracing::debug!(key = %key, "Cache hit");
                Some(entry.value)
            }
            Some(_) => {
                tracing::debug!(key = %key, "Cache entry expired");
                self.cache.invalidate(key).await;
                None
            }
            None => {
                tracing::debug!(key = %key, "Cache miss");
                None
            }
        }
    }

    pub fn clear(&self) {
        tracing::debug!("Clearing cache");
        self.cache.invalidate_all();
    }
}
