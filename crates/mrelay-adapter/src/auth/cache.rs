use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::error::AdapterResult;

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: SystemTime,
}

/// TTL cache for derived upstream tokens (Baidu access tokens, Zhipu JWTs).
///
/// A keyed async mutex coalesces concurrent refreshes: when N requests on the
/// same credential miss at once, one performs the refresh and the rest reuse
/// its result.
#[derive(Default)]
pub struct TokenCache {
    tokens: Mutex<HashMap<String, CachedToken>>,
    refresh_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cached(&self, key: &str, now: SystemTime) -> Option<String> {
        let tokens = self.tokens.lock().expect("token cache poisoned");
        tokens
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.token.clone())
    }

    fn refresh_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.refresh_locks.lock().expect("token cache poisoned");
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub async fn get_or_refresh<F, Fut>(&self, key: &str, refresh: F) -> AdapterResult<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AdapterResult<(String, Duration)>>,
    {
        let now = SystemTime::now();
        if let Some(token) = self.cached(key, now) {
            return Ok(token);
        }

        let lock = self.refresh_lock(key);
        let _guard = lock.lock().await;

        // A racing refresh may have landed while we waited.
        if let Some(token) = self.cached(key, SystemTime::now()) {
            return Ok(token);
        }

        let (token, ttl) = refresh().await?;
        // Renew ahead of expiry so in-flight requests never carry a dead token.
        let ttl = ttl.saturating_sub(Duration::from_secs(60)).max(Duration::from_secs(10));
        let entry = CachedToken {
            token: token.clone(),
            expires_at: SystemTime::now() + ttl,
        };
        self.tokens
            .lock()
            .expect("token cache poisoned")
            .insert(key.to_string(), entry);
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn concurrent_misses_refresh_once() {
        let cache = Arc::new(TokenCache::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_refresh("cred-1", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(("tok".to_string(), Duration::from_secs(3600)))
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "tok");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_refresh_independently() {
        let cache = TokenCache::new();
        let a = cache
            .get_or_refresh("a", || async {
                Ok(("tok-a".to_string(), Duration::from_secs(600)))
            })
            .await
            .unwrap();
        let b = cache
            .get_or_refresh("b", || async {
                Ok(("tok-b".to_string(), Duration::from_secs(600)))
            })
            .await
            .unwrap();
        assert_ne!(a, b);
    }
}
