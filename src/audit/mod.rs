//! Append-only change log for account mutations.

mod recorder;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::storage::StoreError;

pub use recorder::{AuditRecorder, Change};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOperation {
    Insert,
    Update,
    Delete,
}

impl AuditOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditOperation::Insert => "insert",
            AuditOperation::Update => "update",
            AuditOperation::Delete => "delete",
        }
    }
}

impl fmt::Display for AuditOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditOperation {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(AuditOperation::Insert),
            "update" => Ok(AuditOperation::Update),
            "delete" => Ok(AuditOperation::Delete),
            other => Err(AuditError::InvalidRecord(format!(
                "unknown operation `{other}`"
            ))),
        }
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    /// Deduplication key shared by every entry written in one unit of work.
    pub unit_of_work_id: Uuid,
    pub table_name: String,
    pub record_id: Uuid,
    pub operation: AuditOperation,
    pub old_data: Option<Value>,
    pub new_data: Option<Value>,
    pub actor: String,
    #[serde(with = "time::serde::rfc3339")]
    pub changed_at: OffsetDateTime,
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("invalid audit record: {0}")]
    InvalidRecord(String),

    #[error("audit write failed: {0}")]
    Store(#[from] StoreError),
}
