use std::sync::Arc;

use serde_json::{json, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::bulk::{self, AccountExport, BulkResult};
use super::repo_types::{anonymized_credential, anonymized_email};
use super::validation::{check_credential, normalize_email};
use super::{
    Account, AccountError, AccountLookup, AccountStatus, AccountUpdate, ExportFilter,
    ImportRecord,
};
use crate::audit::{AuditEntry, AuditOperation, AuditRecorder, Change};
use crate::cache::{AccountCache, CacheKey};
use crate::storage::{self, AccountRepository, UnitOfWork};

pub const ACCOUNTS_TABLE: &str = "accounts";

/// One state-changing request, replayable if its unit of work conflicts.
enum Mutation<'a> {
    Create {
        email: String,
        credential_hash: &'a str,
    },
    Update {
        id: Uuid,
        email: Option<String>,
        credential_hash: Option<&'a str>,
    },
    SoftDelete(Uuid),
    Restore(Uuid),
    Anonymize(Uuid),
    RecordLogin(Uuid),
    Import(&'a [ImportRecord]),
}

impl Mutation<'_> {
    fn name(&self) -> &'static str {
        match self {
            Mutation::Create { .. } => "create",
            Mutation::Update { .. } => "update",
            Mutation::SoftDelete(_) => "soft_delete",
            Mutation::Restore(_) => "restore",
            Mutation::Anonymize(_) => "anonymize",
            Mutation::RecordLogin(_) => "record_login",
            Mutation::Import(_) => "bulk_import",
        }
    }
}

/// Result of applying a mutation inside a unit of work.
struct Applied {
    accounts: Vec<Account>,
    /// Cache keys that must be gone before the unit of work commits.
    stale: Vec<CacheKey>,
    /// Whether the committed accounts should be written to the cache.
    fill_cache: bool,
}

impl Applied {
    fn created(accounts: Vec<Account>) -> Self {
        let stale = accounts.iter().flat_map(CacheKey::for_account).collect();
        Self {
            accounts,
            stale,
            fill_cache: true,
        }
    }

    fn changed(before: &Account, after: Account) -> Self {
        let mut stale: Vec<CacheKey> = CacheKey::for_account(before).into();
        if after.email != before.email {
            stale.push(CacheKey::email(&after.email));
        }
        Self {
            accounts: vec![after],
            stale,
            fill_cache: false,
        }
    }
}

fn rfc3339(at: Option<OffsetDateTime>) -> Value {
    at.and_then(|t| t.format(&Rfc3339).ok())
        .map_or(Value::Null, Value::String)
}

/// Authoritative lifecycle state machine for accounts.
///
/// Every mutation runs as one unit of work covering the account row, its
/// audit entry and its cache keys. Cache keys are invalidated before the
/// commit; a failure anywhere rolls the whole unit back.
pub struct AccountStore {
    repo: Arc<dyn AccountRepository>,
    cache: AccountCache,
    audit: AuditRecorder,
    conflict_retries: u32,
    export_page_size: i64,
}

impl AccountStore {
    pub fn new(repo: Arc<dyn AccountRepository>, cache: AccountCache) -> Self {
        Self {
            repo,
            cache,
            audit: AuditRecorder::new(),
            conflict_retries: 3,
            export_page_size: 500,
        }
    }

    /// How many times a unit of work is replayed after a transient conflict.
    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    pub fn with_export_page_size(mut self, page_size: i64) -> Self {
        self.export_page_size = page_size.max(1);
        self
    }

    #[instrument(skip(self, credential_hash))]
    pub async fn create(
        &self,
        email: &str,
        credential_hash: &str,
        actor: &str,
    ) -> Result<Account, AccountError> {
        let email = normalize_email(email)?;
        check_credential(credential_hash)?;
        let account = self
            .run_single(
                Mutation::Create {
                    email,
                    credential_hash,
                },
                actor,
            )
            .await?;
        info!(account_id = %account.id, "account created");
        Ok(account)
    }

    #[instrument(skip(self, fields))]
    pub async fn update(
        &self,
        id: Uuid,
        fields: &AccountUpdate,
        actor: &str,
    ) -> Result<Account, AccountError> {
        let email = fields.email.as_deref().map(normalize_email).transpose()?;
        if let Some(hash) = fields.credential_hash.as_deref() {
            check_credential(hash)?;
        }
        let account = self
            .run_single(
                Mutation::Update {
                    id,
                    email,
                    credential_hash: fields.credential_hash.as_deref(),
                },
                actor,
            )
            .await?;
        info!(account_id = %id, "account updated");
        Ok(account)
    }

    #[instrument(skip(self))]
    pub async fn soft_delete(&self, id: Uuid, actor: &str) -> Result<Account, AccountError> {
        let account = self.run_single(Mutation::SoftDelete(id), actor).await?;
        info!(account_id = %id, "account soft-deleted");
        Ok(account)
    }

    #[instrument(skip(self))]
    pub async fn restore(&self, id: Uuid, actor: &str) -> Result<Account, AccountError> {
        let account = self.run_single(Mutation::Restore(id), actor).await?;
        info!(account_id = %id, "account restored");
        Ok(account)
    }

    /// Irreversibly replaces the email and credential with placeholders
    /// derived from the id. Anonymized accounts never change again.
    #[instrument(skip(self))]
    pub async fn anonymize(&self, id: Uuid, actor: &str) -> Result<Account, AccountError> {
        let account = self.run_single(Mutation::Anonymize(id), actor).await?;
        info!(account_id = %id, "account anonymized");
        Ok(account)
    }

    /// Stamps `last_login_at`. The audit entry carries only that field.
    #[instrument(skip(self))]
    pub async fn record_login(&self, id: Uuid, actor: &str) -> Result<Account, AccountError> {
        self.run_single(Mutation::RecordLogin(id), actor).await
    }

    /// Creates every record or none. All failing rows are reported together
    /// in [`AccountError::PartialValidation`].
    #[instrument(skip(self, records), fields(records = records.len()))]
    pub async fn bulk_import(
        &self,
        records: &[ImportRecord],
        actor: &str,
    ) -> Result<BulkResult, AccountError> {
        let created = self.run(&Mutation::Import(records), actor).await?;
        info!(created = created.len(), "bulk import committed");
        Ok(BulkResult { created })
    }

    /// Lazy, restartable export in id order. See [`AccountExport`].
    pub fn bulk_export(&self, filter: ExportFilter) -> AccountExport {
        AccountExport::new(Arc::clone(&self.repo), filter, self.export_page_size)
    }

    /// Cache-first lookup by id or email; a miss is loaded from the store of
    /// record and written back to the cache.
    #[instrument(skip(self, lookup))]
    pub async fn get(
        &self,
        lookup: impl Into<AccountLookup>,
    ) -> Result<Option<Account>, AccountError> {
        let lookup = lookup.into();
        let key = match &lookup {
            AccountLookup::Id(id) => CacheKey::Id(*id),
            AccountLookup::Email(email) => CacheKey::email(email),
        };

        if let Some(hit) = self.cache.get(&key).await {
            let consistent = match &lookup {
                AccountLookup::Id(id) => hit.id == *id,
                AccountLookup::Email(email) => {
                    hit.status != AccountStatus::Anonymized
                        && hit.email.eq_ignore_ascii_case(email.trim())
                }
            };
            if consistent {
                return Ok(Some(hit));
            }
            warn!(key = %key, "discarding inconsistent cache entry");
            if let Err(e) = self.cache.invalidate(&key).await {
                warn!(key = %key, error = %e, "could not drop inconsistent cache entry");
            }
        }

        let loaded = match &lookup {
            AccountLookup::Id(id) => self.repo.find_by_id(*id).await?,
            AccountLookup::Email(email) => {
                self.repo
                    .find_by_email(&email.trim().to_lowercase())
                    .await?
            }
        };
        if let Some(account) = &loaded {
            self.cache.put_account(account).await;
        }
        Ok(loaded)
    }

    /// Audit entries for one account, oldest first.
    pub async fn audit_trail(&self, id: Uuid) -> Result<Vec<AuditEntry>, AccountError> {
        Ok(self.repo.audit_trail(id).await?)
    }

    async fn run_single(
        &self,
        mutation: Mutation<'_>,
        actor: &str,
    ) -> Result<Account, AccountError> {
        self.run(&mutation, actor)
            .await?
            .pop()
            .ok_or_else(|| AccountError::Store("mutation produced no account".into()))
    }

    /// Runs `mutation` in a fresh unit of work, replaying it only when the
    /// backend reports a transient conflict.
    async fn run(&self, mutation: &Mutation<'_>, actor: &str) -> Result<Vec<Account>, AccountError> {
        let mut attempt = 0u32;
        loop {
            match self.run_once(mutation, actor).await {
                Err(AccountError::Conflict) if attempt < self.conflict_retries => {
                    attempt += 1;
                    debug!(attempt, op = mutation.name(), "unit of work conflicted; replaying");
                }
                result => return result,
            }
        }
    }

    async fn run_once(
        &self,
        mutation: &Mutation<'_>,
        actor: &str,
    ) -> Result<Vec<Account>, AccountError> {
        let mut uow = self.repo.begin().await?;
        let applied = match self.apply(uow.as_mut(), mutation, actor).await {
            Ok(applied) => applied,
            Err(e) => {
                abandon(uow, mutation.name()).await;
                return Err(e);
            }
        };

        for key in &applied.stale {
            if let Err(e) = self.cache.invalidate(key).await {
                abandon(uow, mutation.name()).await;
                return Err(e.into());
            }
        }

        uow.commit().await?;

        // A reader that missed between invalidation and commit may have
        // refilled a key from the pre-commit row.
        for key in &applied.stale {
            if let Err(e) = self.cache.invalidate(key).await {
                warn!(key = %key, error = %e, "post-commit cache sweep failed");
            }
        }
        if applied.fill_cache {
            for account in &applied.accounts {
                self.cache.put_account(account).await;
            }
        }
        Ok(applied.accounts)
    }

    async fn apply(
        &self,
        uow: &mut dyn UnitOfWork,
        mutation: &Mutation<'_>,
        actor: &str,
    ) -> Result<Applied, AccountError> {
        let now = storage::now();
        match mutation {
            Mutation::Create {
                email,
                credential_hash,
            } => {
                let account = self
                    .insert_new(uow, email, credential_hash, actor, now)
                    .await?;
                Ok(Applied::created(vec![account]))
            }
            Mutation::Update {
                id,
                email,
                credential_hash,
            } => {
                let before = self.mutable(uow, *id).await?;
                let mut after = before.clone();
                if let Some(email) = email {
                    if uow.live_email_holder(email, Some(*id)).await?.is_some() {
                        return Err(AccountError::DuplicateEmail(email.clone()));
                    }
                    after.email = email.clone();
                }
                if let Some(hash) = credential_hash {
                    after.credential_hash = hash.to_string();
                }
                after.updated_at = now;
                self.write_update(uow, &before, &after, actor, now).await?;
                Ok(Applied::changed(&before, after))
            }
            Mutation::SoftDelete(id) => {
                let before = self.locked(uow, *id).await?;
                if before.status != AccountStatus::Active {
                    return Err(AccountError::AlreadyDeleted);
                }
                let mut after = before.clone();
                after.status = AccountStatus::SoftDeleted;
                after.deleted_at = Some(now);
                after.updated_at = now;
                self.write_update(uow, &before, &after, actor, now).await?;
                Ok(Applied::changed(&before, after))
            }
            Mutation::Restore(id) => {
                let before = self.locked(uow, *id).await?;
                if before.status != AccountStatus::SoftDeleted {
                    return Err(AccountError::NotRestorable);
                }
                if uow
                    .live_email_holder(&before.email, Some(*id))
                    .await?
                    .is_some()
                {
                    return Err(AccountError::DuplicateEmail(before.email.clone()));
                }
                let mut after = before.clone();
                after.status = AccountStatus::Active;
                after.deleted_at = None;
                after.updated_at = now;
                self.write_update(uow, &before, &after, actor, now).await?;
                Ok(Applied::changed(&before, after))
            }
            Mutation::Anonymize(id) => {
                let before = self.mutable(uow, *id).await?;
                let after = Account {
                    email: anonymized_email(*id),
                    credential_hash: anonymized_credential(*id),
                    status: AccountStatus::Anonymized,
                    deleted_at: before.deleted_at.or(Some(now)),
                    updated_at: now,
                    ..before.clone()
                };
                uow.update_account(&after).await?;
                self.audit
                    .record(
                        uow,
                        Change {
                            table_name: ACCOUNTS_TABLE,
                            record_id: *id,
                            operation: AuditOperation::Update,
                            old_data: Some(before.scrubbed_snapshot()),
                            new_data: Some(after.snapshot()),
                            actor,
                            changed_at: now,
                        },
                    )
                    .await?;
                Ok(Applied::changed(&before, after))
            }
            Mutation::RecordLogin(id) => {
                let before = self.mutable(uow, *id).await?;
                let after = Account {
                    last_login_at: Some(now),
                    ..before.clone()
                };
                uow.update_account(&after).await?;
                self.audit
                    .record(
                        uow,
                        Change {
                            table_name: ACCOUNTS_TABLE,
                            record_id: *id,
                            operation: AuditOperation::Update,
                            old_data: Some(json!({ "last_login_at": rfc3339(before.last_login_at) })),
                            new_data: Some(json!({ "last_login_at": rfc3339(after.last_login_at) })),
                            actor,
                            changed_at: now,
                        },
                    )
                    .await?;
                Ok(Applied::changed(&before, after))
            }
            Mutation::Import(records) => {
                let (normalized, mut failures) = bulk::validate_batch(records);
                for (index, email) in normalized.iter().enumerate() {
                    let Some(email) = email else { continue };
                    if uow.live_email_holder(email, None).await?.is_some() {
                        failures.push(bulk::already_registered(index, email));
                    }
                }
                if !failures.is_empty() {
                    failures.sort_by_key(|f| f.index);
                    warn!(failures = failures.len(), "bulk import rejected");
                    return Err(AccountError::PartialValidation(failures));
                }

                let mut created = Vec::with_capacity(records.len());
                for (record, email) in records.iter().zip(normalized) {
                    let email = email.ok_or_else(|| {
                        AccountError::Store("validated import row lost its email".into())
                    })?;
                    created.push(
                        self.insert_new(uow, &email, &record.credential_hash, actor, now)
                            .await?,
                    );
                }
                Ok(Applied::created(created))
            }
        }
    }

    async fn locked(&self, uow: &mut dyn UnitOfWork, id: Uuid) -> Result<Account, AccountError> {
        uow.lock_account(id).await?.ok_or(AccountError::NotFound)
    }

    /// Locks the account and refuses anonymized ones.
    async fn mutable(&self, uow: &mut dyn UnitOfWork, id: Uuid) -> Result<Account, AccountError> {
        let account = self.locked(uow, id).await?;
        if account.status == AccountStatus::Anonymized {
            return Err(AccountError::Immutable);
        }
        Ok(account)
    }

    async fn insert_new(
        &self,
        uow: &mut dyn UnitOfWork,
        email: &str,
        credential_hash: &str,
        actor: &str,
        now: OffsetDateTime,
    ) -> Result<Account, AccountError> {
        if uow.live_email_holder(email, None).await?.is_some() {
            return Err(AccountError::DuplicateEmail(email.to_string()));
        }
        let account = Account {
            id: Uuid::new_v4(),
            email: email.to_string(),
            credential_hash: credential_hash.to_string(),
            status: AccountStatus::Active,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            last_login_at: None,
        };
        uow.insert_account(&account).await?;
        self.audit
            .record(
                uow,
                Change {
                    table_name: ACCOUNTS_TABLE,
                    record_id: account.id,
                    operation: AuditOperation::Insert,
                    old_data: None,
                    new_data: Some(account.snapshot()),
                    actor,
                    changed_at: now,
                },
            )
            .await?;
        Ok(account)
    }

    async fn write_update(
        &self,
        uow: &mut dyn UnitOfWork,
        before: &Account,
        after: &Account,
        actor: &str,
        now: OffsetDateTime,
    ) -> Result<(), AccountError> {
        uow.update_account(after).await?;
        self.audit
            .record(
                uow,
                Change {
                    table_name: ACCOUNTS_TABLE,
                    record_id: after.id,
                    operation: AuditOperation::Update,
                    old_data: Some(before.snapshot()),
                    new_data: Some(after.snapshot()),
                    actor,
                    changed_at: now,
                },
            )
            .await?;
        Ok(())
    }
}

async fn abandon(uow: Box<dyn UnitOfWork>, op: &str) {
    if let Err(e) = uow.rollback().await {
        warn!(op, error = %e, "rollback failed; dropping unit of work");
    }
}
