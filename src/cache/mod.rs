//! Read-through cache for account snapshots keyed by id and by email.

pub mod memory;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::accounts::Account;

pub use memory::MemoryCacheBackend;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Key/value store with per-entry TTL.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Account>, CacheError>;
    async fn put(&self, key: &str, account: Account, ttl: Duration) -> Result<(), CacheError>;
    async fn invalidate(&self, key: &str) -> Result<(), CacheError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Id(Uuid),
    Email(String),
}

impl CacheKey {
    pub fn email(email: &str) -> Self {
        CacheKey::Email(email.trim().to_lowercase())
    }

    /// Both keys an account is reachable under.
    pub fn for_account(account: &Account) -> [CacheKey; 2] {
        [CacheKey::Id(account.id), CacheKey::email(&account.email)]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Id(id) => write!(f, "account:id:{id}"),
            CacheKey::Email(email) => write!(f, "account:email:{email}"),
        }
    }
}

/// Cache facade used by the account store. Reads and fills degrade to a miss
/// when the backend fails; invalidation failures are reported to the caller.
#[derive(Clone)]
pub struct AccountCache {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
    op_timeout: Duration,
}

impl AccountCache {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration, op_timeout: Duration) -> Self {
        Self {
            backend,
            ttl,
            op_timeout,
        }
    }

    /// In-process cache with the given TTL.
    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(
            Arc::new(MemoryCacheBackend::new()),
            ttl,
            Duration::from_millis(250),
        )
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        tokio::time::timeout(self.op_timeout, op)
            .await
            .map_err(|_| CacheError::Unavailable("operation timed out".into()))?
    }

    pub async fn get(&self, key: &CacheKey) -> Option<Account> {
        match self.bounded(self.backend.get(&key.to_string())).await {
            Ok(hit) => {
                debug!(key = %key, hit = hit.is_some(), "cache lookup");
                hit
            }
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed; treating as miss");
                None
            }
        }
    }

    pub async fn put(&self, key: &CacheKey, account: &Account) {
        let key_text = key.to_string();
        let fill = self.backend.put(&key_text, account.clone(), self.ttl);
        if let Err(e) = self.bounded(fill).await {
            warn!(key = %key, error = %e, "cache fill failed");
        }
    }

    /// Stores `account` under its id and email keys.
    pub async fn put_account(&self, account: &Account) {
        for key in CacheKey::for_account(account) {
            self.put(&key, account).await;
        }
    }

    pub async fn invalidate(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.bounded(self.backend.invalidate(&key.to_string())).await?;
        debug!(key = %key, "cache entry invalidated");
        Ok(())
    }
}

impl fmt::Debug for AccountCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountCache")
            .field("ttl", &self.ttl)
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FlakyBackend;
    use super::*;
    use crate::accounts::AccountStatus;
    use crate::storage::now;

    fn account(email: &str) -> Account {
        let now = now();
        Account {
            id: Uuid::new_v4(),
            email: email.into(),
            credential_hash: "hash".into(),
            status: AccountStatus::Active,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            last_login_at: None,
        }
    }

    struct StalledBackend;

    #[async_trait]
    impl CacheBackend for StalledBackend {
        async fn get(&self, _key: &str) -> Result<Option<Account>, CacheError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }
        async fn put(&self, _k: &str, _a: Account, _t: Duration) -> Result<(), CacheError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
        async fn invalidate(&self, _key: &str) -> Result<(), CacheError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn put_then_get_by_both_keys() {
        let cache = AccountCache::in_memory(Duration::from_secs(60));
        let a = account("a@x.com");
        cache.put_account(&a).await;
        assert_eq!(cache.get(&CacheKey::Id(a.id)).await, Some(a.clone()));
        assert_eq!(cache.get(&CacheKey::email("A@X.com")).await, Some(a));
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = AccountCache::in_memory(Duration::from_millis(20));
        let a = account("a@x.com");
        cache.put(&CacheKey::Id(a.id), &a).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get(&CacheKey::Id(a.id)).await, None);
    }

    #[tokio::test]
    async fn invalidate_removes_entry_and_put_overwrites() {
        let cache = AccountCache::in_memory(Duration::from_secs(60));
        let mut a = account("a@x.com");
        let key = CacheKey::Id(a.id);
        cache.put(&key, &a).await;
        a.email = "b@x.com".into();
        cache.put(&key, &a).await;
        assert_eq!(cache.get(&key).await.map(|c| c.email), Some("b@x.com".into()));
        cache.invalidate(&key).await.unwrap();
        assert_eq!(cache.get(&key).await, None);
    }

    #[tokio::test]
    async fn backend_failures_degrade_reads_but_surface_on_invalidate() {
        let backend = Arc::new(FlakyBackend::default());
        let cache = AccountCache::new(backend.clone(), Duration::from_secs(60), Duration::from_secs(1));
        let a = account("a@x.com");
        cache.put(&CacheKey::Id(a.id), &a).await;

        backend.set_down(true);
        assert_eq!(cache.get(&CacheKey::Id(a.id)).await, None);
        cache.put(&CacheKey::Id(a.id), &a).await;
        assert!(matches!(
            cache.invalidate(&CacheKey::Id(a.id)).await,
            Err(CacheError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let cache = AccountCache::new(
            Arc::new(StalledBackend),
            Duration::from_secs(60),
            Duration::from_millis(10),
        );
        let key = CacheKey::Id(Uuid::new_v4());
        assert_eq!(cache.get(&key).await, None);
        assert!(cache.invalidate(&key).await.is_err());
    }
}
