//! Persistence ports for accounts and their audit log.
//!
//! A [`UnitOfWork`] is one atomic transaction: nothing it writes is visible
//! until `commit`, and dropping it without committing discards every effect.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::accounts::{Account, ExportFilter};
use crate::audit::AuditEntry;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Transient contention; the whole unit of work may be retried.
    #[error("concurrent modification detected")]
    Conflict,

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("store error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait UnitOfWork: Send {
    fn id(&self) -> Uuid;

    /// Reads an account and holds it against concurrent writers until the
    /// unit of work ends.
    async fn lock_account(&mut self, id: Uuid) -> Result<Option<Account>, StoreError>;

    /// Id of a non-anonymized account other than `except` holding `email`.
    async fn live_email_holder(
        &mut self,
        email: &str,
        except: Option<Uuid>,
    ) -> Result<Option<Uuid>, StoreError>;

    async fn insert_account(&mut self, account: &Account) -> Result<(), StoreError>;

    /// Overwrites a row previously read with [`UnitOfWork::lock_account`].
    async fn update_account(&mut self, account: &Account) -> Result<(), StoreError>;

    async fn append_audit(&mut self, entry: &AuditEntry) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Store of record for accounts and the audit log.
#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Account>, StoreError>;

    /// Non-anonymized account holding `email` (already normalized).
    async fn find_by_email(&self, email: &str) -> Result<Option<Account>, StoreError>;

    /// Up to `limit` accounts ordered by id, strictly after `after`.
    async fn page(
        &self,
        filter: &ExportFilter,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<Account>, StoreError>;

    /// Audit entries for one record, in commit order.
    async fn audit_trail(&self, record_id: Uuid) -> Result<Vec<AuditEntry>, StoreError>;
}

/// Current UTC time at the precision the database keeps (microseconds).
pub fn now() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(now.nanosecond() / 1_000 * 1_000)
        .unwrap_or(now)
}
