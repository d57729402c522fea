//! Key/value cache backing widget data and webhook idempotency
//!
//! Two backends sit behind [`CacheStore`]: a bounded in-process LRU with per-entry TTL,
//! and Redis (through a deadpool connection pool) when `HUB_CACHE_URL` points at one.
//! Only the Redis backend shares idempotency records across instances.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use redis::AsyncCommands;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::connectors::WidgetData;

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can occur during cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Cache configuration error: {0}")]
    Configuration(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Redis(err.to_string())
    }
}

impl From<deadpool_redis::PoolError> for CacheError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        CacheError::Redis(err.to_string())
    }
}

/// Minimal async cache contract over JSON values
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<Value>>;

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> CacheResult<()>;

    /// Returns whether a live entry was removed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    fn backend(&self) -> &'static str;
}

/// In-memory LRU cache with TTL support
pub struct MemoryCache {
    entries: Mutex<LruCache<String, (Value, Instant)>>,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        let mut entries = self.entries.lock().await;
        let expired = match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => {
                return Ok(Some(value.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> CacheResult<()> {
        let expires_at = Instant::now() + ttl;
        self.entries
            .lock()
            .await
            .put(key.to_string(), (value.clone(), expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let removed = self.entries.lock().await.pop(key);
        Ok(removed.is_some_and(|(_, expires_at)| expires_at > Instant::now()))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Redis-backed cache
pub struct RedisCache {
    pool: deadpool_redis::Pool,
    key_prefix: String,
}

impl RedisCache {
    pub fn new(url: &str, key_prefix: impl Into<String>) -> CacheResult<Self> {
        let pool = deadpool_redis::Config::from_url(url)
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| CacheError::Configuration(e.to_string()))?;
        Ok(Self {
            pool,
            key_prefix: key_prefix.into(),
        })
    }

    fn make_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        let mut conn = self.pool.get().await?;
        let data: Option<String> = conn.get(self.make_key(key)).await?;
        data.map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(CacheError::from)
    }

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> CacheResult<()> {
        let serialized = serde_json::to_string(value)?;
        let mut conn = self.pool.get().await?;
        let _: () = conn
            .set_ex(self.make_key(key), serialized, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.pool.get().await?;
        let deleted: i64 = conn.del(self.make_key(key)).await?;
        Ok(deleted > 0)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

/// Picks the backend from `HUB_CACHE_URL`: unset means in-memory.
pub fn build_cache(config: &AppConfig) -> CacheResult<Arc<dyn CacheStore>> {
    match config.cache_url.as_deref().filter(|url| !url.is_empty()) {
        Some(url) if url.starts_with("redis://") || url.starts_with("rediss://") => {
            info!("Using Redis cache backend");
            Ok(Arc::new(RedisCache::new(url, "hub:")?))
        }
        Some(_) => Err(CacheError::Configuration(
            "HUB_CACHE_URL must be a redis:// or rediss:// URL".to_string(),
        )),
        None => {
            info!(max_entries = config.cache_max_entries, "Using in-memory cache backend");
            Ok(Arc::new(MemoryCache::new(config.cache_max_entries)))
        }
    }
}

/// Replay protection for webhook deliveries, keyed by provider and event id.
#[derive(Clone)]
pub struct IdempotencyStore {
    cache: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl IdempotencyStore {
    pub fn new(cache: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    fn key(provider: &str, event_id: &str) -> String {
        format!("webhook:{provider}:{event_id}")
    }

    pub async fn is_processed(&self, provider: &str, event_id: &str) -> CacheResult<bool> {
        Ok(self.cache.get(&Self::key(provider, event_id)).await?.is_some())
    }

    pub async fn mark_processed(
        &self,
        provider: &str,
        event_id: &str,
        processed_at: DateTime<Utc>,
    ) -> CacheResult<()> {
        self.cache
            .set(
                &Self::key(provider, event_id),
                &Value::String(processed_at.to_rfc3339()),
                self.ttl,
            )
            .await
    }
}

/// Cached widget payloads per connection.
#[derive(Clone)]
pub struct WidgetCache {
    cache: Arc<dyn CacheStore>,
}

impl WidgetCache {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    fn key(connection_id: Uuid, widget_id: &str) -> String {
        format!("widget:{connection_id}:{widget_id}")
    }

    /// Cached data, if present. Unreadable entries count as misses.
    pub async fn get(&self, connection_id: Uuid, widget_id: &str) -> Option<WidgetData> {
        match self.cache.get(&Self::key(connection_id, widget_id)).await {
            Ok(Some(value)) => serde_json::from_value(value)
                .inspect_err(|e| warn!(%connection_id, widget_id, error = %e, "Discarding unreadable widget cache entry"))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(%connection_id, widget_id, error = %e, "Widget cache read failed");
                None
            }
        }
    }

    pub async fn put(&self, connection_id: Uuid, data: &WidgetData, ttl: Duration) {
        let key = Self::key(connection_id, &data.widget_id);
        let result = match serde_json::to_value(data) {
            Ok(value) => self.cache.set(&key, &value, ttl).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(%connection_id, widget_id = %data.widget_id, error = %e, "Widget cache write failed");
        }
    }

    /// Drops cached data for the given widgets; returns how many live entries went away.
    pub async fn invalidate_connection(&self, connection_id: Uuid, widget_ids: &[String]) -> usize {
        let mut removed = 0;
        for widget_id in widget_ids {
            match self.cache.delete(&Self::key(connection_id, widget_id)).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(%connection_id, %widget_id, error = %e, "Widget cache invalidation failed")
                }
            }
        }
        removed
    }
}
