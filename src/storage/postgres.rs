use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{AccountRepository, StoreError, UnitOfWork};
use crate::accounts::{Account, ExportFilter};
use crate::audit::{AuditEntry, AuditError};

const ACCOUNT_COLUMNS: &str =
    "id, email, credential_hash, status, created_at, updated_at, deleted_at, last_login_at";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some("23505") => StoreError::UniqueViolation(
                    db.constraint().unwrap_or("unique constraint").to_string(),
                ),
                // serialization_failure, deadlock_detected
                Some("40001") | Some("40P01") => StoreError::Conflict,
                _ => StoreError::Backend(err.to_string()),
            },
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

#[derive(FromRow)]
struct AuditRow {
    unit_of_work_id: Uuid,
    table_name: String,
    record_id: Uuid,
    operation: String,
    old_data: Option<Value>,
    new_data: Option<Value>,
    actor: String,
    changed_at: OffsetDateTime,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = AuditError;

    fn try_from(r: AuditRow) -> Result<Self, Self::Error> {
        Ok(Self {
            unit_of_work_id: r.unit_of_work_id,
            table_name: r.table_name,
            record_id: r.record_id,
            operation: r.operation.parse()?,
            old_data: r.old_data,
            new_data: r.new_data,
            actor: r.actor,
            changed_at: r.changed_at,
        })
    }
}

/// Postgres store of record. Units of work are database transactions and
/// mutated rows are held with `SELECT ... FOR UPDATE`.
#[derive(Clone)]
pub struct PgAccountRepository {
    db: PgPool,
}

impl PgAccountRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let db = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .context("connect to database")?;
        Ok(Self { db })
    }

    pub fn pool(&self) -> &PgPool {
        &self.db
    }
}

#[async_trait]
impl AccountRepository for PgAccountRepository {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let tx = self.db.begin().await?;
        Ok(Box::new(PgUnitOfWork {
            id: Uuid::new_v4(),
            tx,
        }))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(account)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Account>, StoreError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            r#"
            SELECT {ACCOUNT_COLUMNS}
              FROM accounts
             WHERE lower(email) = lower($1)
               AND status <> 'anonymized'
            "#
        ))
        .bind(email)
        .fetch_optional(&self.db)
        .await?;
        Ok(account)
    }

    async fn page(
        &self,
        filter: &ExportFilter,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<Account>, StoreError> {
        let statuses: Option<Vec<String>> = filter
            .statuses
            .as_ref()
            .map(|s| s.iter().map(|st| st.as_str().to_string()).collect());
        let rows = sqlx::query_as::<_, Account>(&format!(
            r#"
            SELECT {ACCOUNT_COLUMNS}
              FROM accounts
             WHERE ($1::uuid IS NULL OR id > $1)
               AND ($2::text[] IS NULL OR status::text = ANY($2))
               AND ($3::timestamptz IS NULL OR created_at > $3)
             ORDER BY id
             LIMIT $4
            "#
        ))
        .bind(after)
        .bind(statuses)
        .bind(filter.created_after)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn audit_trail(&self, record_id: Uuid) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT unit_of_work_id, table_name, record_id, operation,
                   old_data, new_data, actor, changed_at
              FROM audit_log
             WHERE record_id = $1
             ORDER BY id ASC
            "#,
        )
        .bind(record_id)
        .fetch_all(&self.db)
        .await?;
        rows.into_iter()
            .map(|r| AuditEntry::try_from(r).map_err(|e| StoreError::Backend(e.to_string())))
            .collect()
    }
}

struct PgUnitOfWork {
    id: Uuid,
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn lock_account(&mut self, id: Uuid) -> Result<Option<Account>, StoreError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(account)
    }

    async fn live_email_holder(
        &mut self,
        email: &str,
        except: Option<Uuid>,
    ) -> Result<Option<Uuid>, StoreError> {
        let holder = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id
              FROM accounts
             WHERE lower(email) = lower($1)
               AND status <> 'anonymized'
               AND ($2::uuid IS NULL OR id <> $2)
             LIMIT 1
               FOR UPDATE
            "#,
        )
        .bind(email)
        .bind(except)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(holder)
    }

    async fn insert_account(&mut self, account: &Account) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO accounts
                (id, email, credential_hash, status, created_at, updated_at, deleted_at, last_login_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(account.id)
        .bind(&account.email)
        .bind(&account.credential_hash)
        .bind(account.status)
        .bind(account.created_at)
        .bind(account.updated_at)
        .bind(account.deleted_at)
        .bind(account.last_login_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_account(&mut self, account: &Account) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
               SET email = $2,
                   credential_hash = $3,
                   status = $4,
                   updated_at = $5,
                   deleted_at = $6,
                   last_login_at = $7
             WHERE id = $1
            "#,
        )
        .bind(account.id)
        .bind(&account.email)
        .bind(&account.credential_hash)
        .bind(account.status)
        .bind(account.updated_at)
        .bind(account.deleted_at)
        .bind(account.last_login_at)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() != 1 {
            return Err(StoreError::Backend(format!(
                "account {} vanished inside its unit of work",
                account.id
            )));
        }
        Ok(())
    }

    async fn append_audit(&mut self, entry: &AuditEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO audit_log
                (unit_of_work_id, table_name, record_id, operation, old_data, new_data, actor, changed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.unit_of_work_id)
        .bind(&entry.table_name)
        .bind(entry.record_id)
        .bind(entry.operation.as_str())
        .bind(&entry.old_data)
        .bind(&entry.new_data)
        .bind(&entry.actor)
        .bind(entry.changed_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
