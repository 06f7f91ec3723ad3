use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::accounts::AccountStore;
use crate::auth::{Argon2Verifier, SessionService};
use crate::cache::{AccountCache, MemoryCacheBackend};
use crate::config::AppConfig;
use crate::storage::memory::MemoryAccountRepository;
use crate::storage::postgres::PgAccountRepository;
use crate::storage::AccountRepository;
use crate::tokens::StaticKeyProvider;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<AccountStore>,
    pub sessions: Arc<SessionService>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// Connects to Postgres, applies migrations and wires the components.
    pub async fn init() -> anyhow::Result<Self> {
        let config = AppConfig::from_env()?;
        let repo = PgAccountRepository::connect(
            &config.database_url,
            config.store.max_connections,
            Duration::from_secs(config.store.acquire_timeout_seconds),
        )
        .await?;

        sqlx::migrate!("./migrations")
            .run(repo.pool())
            .await
            .context("apply migrations")?;

        Self::from_parts(config, Arc::new(repo))
    }

    pub fn from_parts(config: AppConfig, repo: Arc<dyn AccountRepository>) -> anyhow::Result<Self> {
        let cache = AccountCache::new(
            Arc::new(MemoryCacheBackend::new()),
            config.cache.ttl(),
            config.cache.timeout(),
        );
        let store = Arc::new(
            AccountStore::new(repo, cache)
                .with_conflict_retries(config.store.conflict_retries)
                .with_export_page_size(config.store.export_page_size),
        );
        let keys = StaticKeyProvider::hmac(&config.jwt.secret, config.jwt.algorithm)
            .context("build signing keys")?;
        let sessions = Arc::new(SessionService::new(
            Arc::clone(&store),
            Arc::new(keys),
            Arc::new(Argon2Verifier),
            &config.jwt,
        ));
        Ok(Self {
            store,
            sessions,
            config: Arc::new(config),
        })
    }

    /// Fully in-memory state for tests.
    pub fn fake() -> Self {
        Self::from_parts(
            AppConfig::for_tests(),
            Arc::new(MemoryAccountRepository::new()),
        )
        .expect("test configuration is valid")
    }
}
