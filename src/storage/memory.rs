use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use super::{AccountRepository, StoreError, UnitOfWork};
use crate::accounts::{Account, AccountStatus, ExportFilter};
use crate::audit::AuditEntry;

struct StoredRow {
    account: Account,
    version: u64,
}

#[derive(Default)]
struct MemoryState {
    rows: HashMap<Uuid, StoredRow>,
    audit: Vec<AuditEntry>,
}

fn lock(state: &Mutex<MemoryState>) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
    state
        .lock()
        .map_err(|_| StoreError::Backend("memory store poisoned".into()))
}

fn is_live_holder(account: &Account, email: &str) -> bool {
    account.status != AccountStatus::Anonymized && account.email.eq_ignore_ascii_case(email)
}

/// In-process store of record. Units of work buffer their writes and are
/// checked optimistically at commit: a row read by the unit must still be at
/// the version it saw, otherwise the commit fails with [`StoreError::Conflict`].
#[derive(Clone, Default)]
pub struct MemoryAccountRepository {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryAccountRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountRepository for MemoryAccountRepository {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        Ok(Box::new(MemoryUnitOfWork {
            id: Uuid::new_v4(),
            state: Arc::clone(&self.state),
            observed: HashMap::new(),
            staged: HashMap::new(),
            inserted: HashSet::new(),
            audit: Vec::new(),
        }))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
        Ok(lock(&self.state)?.rows.get(&id).map(|r| r.account.clone()))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Account>, StoreError> {
        Ok(lock(&self.state)?
            .rows
            .values()
            .find(|r| is_live_holder(&r.account, email))
            .map(|r| r.account.clone()))
    }

    async fn page(
        &self,
        filter: &ExportFilter,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<Account>, StoreError> {
        let state = lock(&self.state)?;
        let mut matching: Vec<Account> = state
            .rows
            .values()
            .map(|r| &r.account)
            .filter(|a| after.map_or(true, |cursor| a.id > cursor))
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        matching.sort_by_key(|a| a.id);
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn audit_trail(&self, record_id: Uuid) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(lock(&self.state)?
            .audit
            .iter()
            .filter(|e| e.record_id == record_id)
            .cloned()
            .collect())
    }
}

struct MemoryUnitOfWork {
    id: Uuid,
    state: Arc<Mutex<MemoryState>>,
    /// Version of every row this unit read; 0 means "did not exist".
    observed: HashMap<Uuid, u64>,
    staged: HashMap<Uuid, Account>,
    inserted: HashSet<Uuid>,
    audit: Vec<AuditEntry>,
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn lock_account(&mut self, id: Uuid) -> Result<Option<Account>, StoreError> {
        if let Some(staged) = self.staged.get(&id) {
            return Ok(Some(staged.clone()));
        }
        let state = lock(&self.state)?;
        let row = state.rows.get(&id);
        self.observed.insert(id, row.map_or(0, |r| r.version));
        Ok(row.map(|r| r.account.clone()))
    }

    async fn live_email_holder(
        &mut self,
        email: &str,
        except: Option<Uuid>,
    ) -> Result<Option<Uuid>, StoreError> {
        let other = |a: &Account| Some(a.id) != except && is_live_holder(a, email);
        if let Some(a) = self.staged.values().find(|a| other(a)) {
            return Ok(Some(a.id));
        }
        let state = lock(&self.state)?;
        Ok(state
            .rows
            .values()
            .filter(|r| !self.staged.contains_key(&r.account.id))
            .find(|r| other(&r.account))
            .map(|r| r.account.id))
    }

    async fn insert_account(&mut self, account: &Account) -> Result<(), StoreError> {
        if self.staged.contains_key(&account.id) {
            return Err(StoreError::UniqueViolation("accounts_pkey".into()));
        }
        self.inserted.insert(account.id);
        self.staged.insert(account.id, account.clone());
        Ok(())
    }

    async fn update_account(&mut self, account: &Account) -> Result<(), StoreError> {
        if !self.observed.contains_key(&account.id) && !self.staged.contains_key(&account.id) {
            return Err(StoreError::Backend(format!(
                "account {} updated without being locked",
                account.id
            )));
        }
        self.staged.insert(account.id, account.clone());
        Ok(())
    }

    async fn append_audit(&mut self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.audit.push(entry.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let shared = Arc::clone(&self.state);
        let mut state = lock(&shared)?;

        for (id, seen) in &self.observed {
            let current = state.rows.get(id).map_or(0, |r| r.version);
            if current != *seen {
                return Err(StoreError::Conflict);
            }
        }
        for id in &self.inserted {
            if state.rows.contains_key(id) {
                return Err(StoreError::UniqueViolation("accounts_pkey".into()));
            }
        }
        for account in self.staged.values() {
            if account.status == AccountStatus::Anonymized {
                continue;
            }
            let clash_committed = state.rows.values().any(|r| {
                r.account.id != account.id
                    && !self.staged.contains_key(&r.account.id)
                    && is_live_holder(&r.account, &account.email)
            });
            let clash_staged = self
                .staged
                .values()
                .any(|other| other.id != account.id && is_live_holder(other, &account.email));
            if clash_committed || clash_staged {
                return Err(StoreError::UniqueViolation(account.email.clone()));
            }
        }

        let MemoryUnitOfWork { staged, audit, .. } = *self;
        for (id, account) in staged {
            let version = state.rows.get(&id).map_or(0, |r| r.version) + 1;
            state.rows.insert(id, StoredRow { account, version });
        }
        state.audit.extend(audit);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[tokio::test]
    async fn uncommitted_writes_are_invisible() {
        let repo = MemoryAccountRepository::new();
        let a = account("a@x.com");
        let mut uow = repo.begin().await.unwrap();
        uow.insert_account(&a).await.unwrap();
        assert!(repo.find_by_id(a.id).await.unwrap().is_none());
        drop(uow);
        assert!(repo.find_by_id(a.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_read_fails_commit_with_conflict() {
        let repo = MemoryAccountRepository::new();
        let a = account("a@x.com");
        let mut uow = repo.begin().await.unwrap();
        uow.insert_account(&a).await.unwrap();
        uow.commit().await.unwrap();

        let mut first = repo.begin().await.unwrap();
        let mut second = repo.begin().await.unwrap();
        let mut one = first.lock_account(a.id).await.unwrap().unwrap();
        let mut two = second.lock_account(a.id).await.unwrap().unwrap();
        one.email = "one@x.com".into();
        two.email = "two@x.com".into();
        first.update_account(&one).await.unwrap();
        second.update_account(&two).await.unwrap();

        first.commit().await.unwrap();
        assert!(matches!(second.commit().await, Err(StoreError::Conflict)));
        assert_eq!(repo.find_by_id(a.id).await.unwrap().unwrap().email, "one@x.com");
    }

    #[tokio::test]
    async fn live_email_uniqueness_is_checked_at_commit() {
        let repo = MemoryAccountRepository::new();
        let mut first = repo.begin().await.unwrap();
        let mut second = repo.begin().await.unwrap();
        first.insert_account(&account("a@x.com")).await.unwrap();
        second.insert_account(&account("A@x.com")).await.unwrap();
        first.commit().await.unwrap();
        assert!(matches!(
            second.commit().await,
            Err(StoreError::UniqueViolation(_))
        ));
    }

    #[tokio::test]
    async fn anonymized_rows_release_their_email() {
        let repo = MemoryAccountRepository::new();
        let mut gone = account("a@x.com");
        gone.status = AccountStatus::Anonymized;
        let mut uow = repo.begin().await.unwrap();
        uow.insert_account(&gone).await.unwrap();
        uow.commit().await.unwrap();

        assert!(repo.find_by_email("a@x.com").await.unwrap().is_none());
        let mut uow = repo.begin().await.unwrap();
        assert!(uow.live_email_holder("a@x.com", None).await.unwrap().is_none());
        uow.insert_account(&account("a@x.com")).await.unwrap();
        uow.commit().await.unwrap();
    }
}
