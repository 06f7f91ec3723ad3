use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{CacheBackend, CacheError};
use crate::accounts::Account;

#[derive(Debug)]
struct CachedAccount {
    account: Account,
    expires_at: Instant,
}

const DEFAULT_SWEEP_INTERVAL: usize = 256;

/// Process-local backend. Expired entries are dropped on read, and every
/// `sweep_interval` fills the whole map is pruned.
#[derive(Debug)]
pub struct MemoryCacheBackend {
    entries: DashMap<String, CachedAccount>,
    fills: AtomicUsize,
    sweep_interval: usize,
}

impl Default for MemoryCacheBackend {
    fn default() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sweep_interval(sweep_interval: usize) -> Self {
        Self {
            entries: DashMap::new(),
            fills: AtomicUsize::new(0),
            sweep_interval: sweep_interval.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every expired entry and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "expired cache entries purged");
        }
        removed
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<Account>, CacheError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Ok(Some(entry.account.clone()));
            }
        }
        self.entries.remove_if(key, |_, e| e.expires_at <= now);
        Ok(None)
    }

    async fn put(&self, key: &str, account: Account, ttl: Duration) -> Result<(), CacheError> {
        self.entries.insert(
            key.to_string(),
            CachedAccount {
                account,
                expires_at: Instant::now() + ttl,
            },
        );
        if (self.fills.fetch_add(1, Ordering::Relaxed) + 1) % self.sweep_interval == 0 {
            self.purge_expired();
        }
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountStatus;
    use crate::storage::now;
    use uuid::Uuid;

    fn account() -> Account {
        let now = now();
        Account {
            id: Uuid::new_v4(),
            email: "a@x.com".into(),
            credential_hash: "hash".into(),
            status: AccountStatus::Active,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            last_login_at: None,
        }
    }

    #[tokio::test]
    async fn fills_prune_expired_entries() {
        let backend = MemoryCacheBackend::with_sweep_interval(100);
        for i in 0..1000 {
            backend
                .put(&format!("account:id:{i}"), account(), Duration::from_millis(1))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        for i in 0..100 {
            backend
                .put(&format!("live:{i}"), account(), Duration::from_secs(60))
                .await
                .unwrap();
        }
        assert_eq!(backend.len(), 100);
        assert!(backend.get("live:0").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn purge_keeps_live_entries() {
        let backend = MemoryCacheBackend::new();
        assert!(backend.is_empty());
        backend.put("short", account(), Duration::from_millis(1)).await.unwrap();
        backend.put("long", account(), Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(backend.purge_expired(), 1);
        assert_eq!(backend.len(), 1);
        assert!(backend.get("long").await.unwrap().is_some());
    }
}
