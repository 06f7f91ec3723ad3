use serde::Serialize;

use crate::audit::AuditError;
use crate::cache::CacheError;
use crate::storage::StoreError;

/// Why a bulk-import row was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RecordProblem {
    InvalidEmail,
    EmptyCredential,
    DuplicateInBatch { first_index: usize },
    AlreadyRegistered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub index: usize,
    pub email: String,
    #[serde(flatten)]
    pub problem: RecordProblem,
}

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("invalid email: {0}")]
    InvalidEmail(String),

    #[error("credential hash must not be empty")]
    EmptyCredential,

    #[error("email already registered: {0}")]
    DuplicateEmail(String),

    #[error("{} import record(s) failed validation", .0.len())]
    PartialValidation(Vec<RecordFailure>),

    #[error("invalid audit record: {0}")]
    InvalidAuditRecord(String),

    #[error("account not found")]
    NotFound,

    #[error("account is anonymized and immutable")]
    Immutable,

    #[error("account is already deleted")]
    AlreadyDeleted,

    #[error("account is not soft-deleted")]
    NotRestorable,

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    /// Contention persisted past the retry budget.
    #[error("concurrent modification, retry later")]
    Conflict,

    #[error("store error: {0}")]
    Store(String),
}

impl AccountError {
    /// Infrastructure failures a caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AccountError::StoreUnavailable(_)
                | AccountError::CacheUnavailable(_)
                | AccountError::Conflict
        )
    }
}

impl From<StoreError> for AccountError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => AccountError::StoreUnavailable(msg),
            StoreError::Conflict => AccountError::Conflict,
            StoreError::UniqueViolation(detail) => AccountError::DuplicateEmail(detail),
            StoreError::Backend(msg) => AccountError::Store(msg),
        }
    }
}

impl From<AuditError> for AccountError {
    fn from(err: AuditError) -> Self {
        match err {
            AuditError::InvalidRecord(msg) => AccountError::InvalidAuditRecord(msg),
            AuditError::Store(e) => e.into(),
        }
    }
}

impl From<CacheError> for AccountError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Unavailable(msg) => AccountError::CacheUnavailable(msg),
        }
    }
}
