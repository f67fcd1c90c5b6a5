//! Cached read-only blockchain client.
//!
//! `request` resolves through three tiers: an in-process memory cache, a
//! durable KV table, and finally the transport. The cache key is the
//! canonical `chain_id:method:params` string, so during historical mode a
//! replayed request always returns the recorded response. Per-key async
//! locks keep concurrent misses for the same key from stampeding the
//! transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row as _;
use tracing::{debug, warn};

use chainflow_core::error::EngineError;

/// The raw transport the embedder supplies (HTTP, WS, test double).
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn request(
        &self,
        chain_id: u64,
        method: &str,
        params: &Value,
    ) -> Result<Value, EngineError>;
}

/// Exponential backoff with a cap and deterministic jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the `attempt`-th retry (1-based); `None` once retries
    /// are exhausted.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.max_retries {
            return None;
        }
        let base = self.initial_backoff.as_millis() as f64
            * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_backoff.as_millis() as f64);
        // Half-step deterministic jitter keeps concurrent retries staggered
        // without a randomness source.
        let jittered = capped + capped * 0.05 * f64::from(attempt % 2);
        Some(Duration::from_millis(jittered as u64))
    }
}

/// Multi-tier cached client handed to user handlers.
pub struct CachedClient {
    transport: Arc<dyn RpcTransport>,
    pool: SqlitePool,
    memory: Mutex<HashMap<String, Value>>,
    locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl CachedClient {
    /// Open the durable KV tier at `path` (its own database, separate from
    /// the indexed tables).
    pub async fn open(
        transport: Arc<dyn RpcTransport>,
        path: &str,
        timeout_ms: u64,
    ) -> Result<Self, EngineError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Self::with_pool(transport, pool, timeout_ms).await
    }

    /// In-memory KV tier (tests, ephemeral runs).
    pub async fn in_memory(
        transport: Arc<dyn RpcTransport>,
        timeout_ms: u64,
    ) -> Result<Self, EngineError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Self::with_pool(transport, pool, timeout_ms).await
    }

    async fn with_pool(
        transport: Arc<dyn RpcTransport>,
        pool: SqlitePool,
        timeout_ms: u64,
    ) -> Result<Self, EngineError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS \"rpc_cache\" (\
             \"key\" TEXT PRIMARY KEY, \
             \"value\" TEXT NOT NULL)",
        )
        .execute(&pool)
        .await
        .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(Self {
            transport,
            pool,
            memory: Mutex::new(HashMap::new()),
            locks: tokio::sync::Mutex::new(HashMap::new()),
            timeout: Duration::from_millis(timeout_ms),
            retry: RetryPolicy::default(),
        })
    }

    pub fn set_retry(&mut self, retry: RetryPolicy) {
        self.retry = retry;
    }

    /// Resolve a request: memory → KV → transport (with timeout and
    /// bounded backoff).
    pub async fn request(
        &self,
        chain_id: u64,
        method: &str,
        params: &Value,
    ) -> Result<Value, EngineError> {
        let key = format!("{chain_id}:{method}:{params}");

        if let Some(hit) = self.memory.lock().expect("cache lock").get(&key) {
            return Ok(hit.clone());
        }

        // One in-flight fetch per key.
        let key_lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(key.clone()).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))).clone()
        };
        let _guard = key_lock.lock().await;

        // A racer may have filled the cache while we waited.
        if let Some(hit) = self.memory.lock().expect("cache lock").get(&key) {
            return Ok(hit.clone());
        }

        if let Some(value) = self.kv_get(&key).await? {
            self.memory.lock().expect("cache lock").insert(key, value.clone());
            return Ok(value);
        }

        let value = self.fetch(chain_id, method, params).await?;
        self.kv_put(&key, &value).await?;
        self.memory.lock().expect("cache lock").insert(key, value.clone());
        Ok(value)
    }

    async fn fetch(
        &self,
        chain_id: u64,
        method: &str,
        params: &Value,
    ) -> Result<Value, EngineError> {
        let mut attempt = 0u32;
        loop {
            let call = self.transport.request(chain_id, method, params);
            let outcome = match tokio::time::timeout(self.timeout, call).await {
                Err(_) => Err(EngineError::Rpc(format!(
                    "request '{method}' timed out after {}ms",
                    self.timeout.as_millis()
                ))),
                Ok(result) => result,
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() => {
                    attempt += 1;
                    match self.retry.next_delay(attempt) {
                        Some(delay) => {
                            warn!(%error, attempt, "rpc retry");
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(error),
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Value>, EngineError> {
        let row = sqlx::query("SELECT \"value\" FROM \"rpc_cache\" WHERE \"key\" = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        match row {
            Some(row) => {
                let raw: String = row.try_get("value").map_err(|e| EngineError::Storage(e.to_string()))?;
                let value = serde_json::from_str(&raw)
                    .map_err(|e| EngineError::Storage(format!("corrupt rpc cache entry: {e}")))?;
                debug!(key, "rpc cache hit (kv)");
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn kv_put(&self, key: &str, value: &Value) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO \"rpc_cache\" (\"key\", \"value\") VALUES (?1, ?2) \
             ON CONFLICT(\"key\") DO UPDATE SET \"value\" = excluded.\"value\"",
        )
        .bind(key)
        .bind(value.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingTransport {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl RpcTransport for CountingTransport {
        async fn request(
            &self,
            chain_id: u64,
            method: &str,
            params: &Value,
        ) -> Result<Value, EngineError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(EngineError::Rpc("transient".into()));
            }
            Ok(json!({ "chain": chain_id, "method": method, "params": params }))
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn repeated_requests_hit_the_cache() {
        let transport = Arc::new(CountingTransport { calls: AtomicU32::new(0), fail_first: 0 });
        let client = CachedClient::in_memory(transport.clone(), 1_000).await.unwrap();

        let params = json!(["0x1", true]);
        let first = client.request(1, "eth_getBlockByNumber", &params).await.unwrap();
        let second = client.request(1, "eth_getBlockByNumber", &params).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        // Different params miss.
        client.request(1, "eth_getBlockByNumber", &json!(["0x2", true])).await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn kv_tier_survives_memory_eviction() {
        let transport = Arc::new(CountingTransport { calls: AtomicU32::new(0), fail_first: 0 });
        let client = CachedClient::in_memory(transport.clone(), 1_000).await.unwrap();

        let params = json!(["0x1"]);
        client.request(1, "eth_call", &params).await.unwrap();
        client.memory.lock().unwrap().clear();

        client.request(1, "eth_call", &params).await.unwrap();
        // Second resolution came from the KV tier, not the transport.
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let transport = Arc::new(CountingTransport { calls: AtomicU32::new(0), fail_first: 2 });
        let mut client = CachedClient::in_memory(transport.clone(), 1_000).await.unwrap();
        client.set_retry(fast_retry());

        let value = client.request(1, "eth_chainId", &json!([])).await.unwrap();
        assert_eq!(value["method"], json!("eth_chainId"));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_exhaust_to_error() {
        let transport = Arc::new(CountingTransport { calls: AtomicU32::new(0), fail_first: 100 });
        let mut client = CachedClient::in_memory(transport, 1_000).await.unwrap();
        client.set_retry(fast_retry());

        let err = client.request(1, "eth_chainId", &json!([])).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(400),
            multiplier: 2.0,
        };
        let d1 = policy.next_delay(1).unwrap();
        let d2 = policy.next_delay(2).unwrap();
        let d5 = policy.next_delay(5).unwrap();
        assert!(d1 < d2);
        assert!(d5 <= Duration::from_millis(420));
        assert!(policy.next_delay(11).is_none());
    }
}
