use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Lifecycle state of an account. `Anonymized` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "account_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    SoftDeleted,
    Anonymized,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::SoftDeleted => "soft_deleted",
            AccountStatus::Anonymized => "anonymized",
        }
    }
}

/// Account record in the database.
#[derive(Clone, PartialEq, Eq, FromRow)]
pub struct Account {
    pub id: Uuid,
    pub email: String,            // lowercased
    pub credential_hash: String,  // opaque, never logged or exported
    pub status: AccountStatus,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub deleted_at: Option<OffsetDateTime>,
    pub last_login_at: Option<OffsetDateTime>,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("credential_hash", &"<redacted>")
            .field("status", &self.status)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .field("deleted_at", &self.deleted_at)
            .field("last_login_at", &self.last_login_at)
            .finish()
    }
}

#[derive(Serialize)]
struct Snapshot<'a> {
    id: Uuid,
    email: Option<&'a str>,
    credential_fingerprint: String,
    status: AccountStatus,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    deleted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    last_login_at: Option<OffsetDateTime>,
}

impl Account {
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    /// Audit snapshot of every field. The credential hash is reduced to a
    /// short fingerprint so changes stay visible without exposing it.
    pub fn snapshot(&self) -> Value {
        self.snapshot_with_email(Some(&self.email))
    }

    /// Snapshot with the email removed, for entries that must not carry PII.
    pub fn scrubbed_snapshot(&self) -> Value {
        self.snapshot_with_email(None)
    }

    fn snapshot_with_email(&self, email: Option<&str>) -> Value {
        let snapshot = Snapshot {
            id: self.id,
            email,
            credential_fingerprint: fingerprint(&self.credential_hash),
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
            last_login_at: self.last_login_at,
        };
        serde_json::to_value(snapshot).unwrap_or(Value::Null)
    }
}

fn fingerprint(credential_hash: &str) -> String {
    Sha256::digest(credential_hash.as_bytes())
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Placeholder email for an anonymized account. Derived from the id only, so
/// it is collision-free and identical across retries.
pub fn anonymized_email(id: Uuid) -> String {
    format!("anonymized-{}@anonymized.invalid", id.simple())
}

/// Placeholder credential; never parses as a real password hash.
pub fn anonymized_credential(id: Uuid) -> String {
    format!("!anonymized:{}", id.simple())
}

/// Public projection used by exports. Carries no credential material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedAccount {
    pub id: Uuid,
    pub email: String,
    pub status: AccountStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_login_at: Option<OffsetDateTime>,
}

impl From<Account> for ExportedAccount {
    fn from(a: Account) -> Self {
        Self {
            id: a.id,
            email: a.email,
            status: a.status,
            created_at: a.created_at,
            updated_at: a.updated_at,
            deleted_at: a.deleted_at,
            last_login_at: a.last_login_at,
        }
    }
}

/// Selection for [`crate::accounts::AccountStore::bulk_export`].
#[derive(Debug, Clone, Default)]
pub struct ExportFilter {
    /// Only these statuses; `None` means all.
    pub statuses: Option<Vec<AccountStatus>>,
    /// Only accounts created strictly after this instant.
    pub created_after: Option<OffsetDateTime>,
}

impl ExportFilter {
    pub fn matches(&self, account: &Account) -> bool {
        let status_ok = self
            .statuses
            .as_ref()
            .map_or(true, |s| s.contains(&account.status));
        let created_ok = self
            .created_after
            .map_or(true, |after| account.created_at > after);
        status_ok && created_ok
    }
}

/// Fields a caller may change through `update`.
#[derive(Debug, Clone, Default)]
pub struct AccountUpdate {
    pub email: Option<String>,
    pub credential_hash: Option<String>,
}

/// One row of a bulk import.
#[derive(Debug, Clone, Deserialize)]
pub struct ImportRecord {
    pub email: String,
    pub credential_hash: String,
}

/// Key for [`crate::accounts::AccountStore::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountLookup {
    Id(Uuid),
    Email(String),
}

impl From<Uuid> for AccountLookup {
    fn from(id: Uuid) -> Self {
        AccountLookup::Id(id)
    }
}

impl From<&str> for AccountLookup {
    /// A UUID string looks up by id; anything else by (normalized) email.
    fn from(s: &str) -> Self {
        match Uuid::parse_str(s.trim()) {
            Ok(id) => AccountLookup::Id(id),
            Err(_) => AccountLookup::Email(s.trim().to_lowercase()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        let now = OffsetDateTime::now_utc();
        Account {
            id: Uuid::new_v4(),
            email: "a@x.com".into(),
            credential_hash: "$argon2id$v=19$secret".into(),
            status: AccountStatus::Active,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            last_login_at: None,
        }
    }

    #[test]
    fn snapshot_never_contains_credential_hash() {
        let a = account();
        let text = a.snapshot().to_string();
        assert!(text.contains("a@x.com"));
        assert!(!text.contains("argon2"));
        assert!(!format!("{a:?}").contains("argon2"));
        assert!(!a.scrubbed_snapshot().to_string().contains("a@x.com"));
    }

    #[test]
    fn placeholders_are_deterministic_per_id() {
        let id = Uuid::new_v4();
        assert_eq!(anonymized_email(id), anonymized_email(id));
        assert_ne!(anonymized_email(id), anonymized_email(Uuid::new_v4()));
        assert!(anonymized_credential(id).starts_with('!'));
    }

    #[test]
    fn lookup_parses_ids_and_emails() {
        let id = Uuid::new_v4();
        assert_eq!(AccountLookup::from(id.to_string().as_str()), AccountLookup::Id(id));
        assert_eq!(
            AccountLookup::from(" A@X.com "),
            AccountLookup::Email("a@x.com".into())
        );
    }
}
