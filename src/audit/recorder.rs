use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::{AuditEntry, AuditError, AuditOperation};
use crate::storage::UnitOfWork;

/// Description of a single mutation, as handed to [`AuditRecorder::record`].
#[derive(Debug, Clone)]
pub struct Change<'a> {
    pub table_name: &'a str,
    pub record_id: Uuid,
    pub operation: AuditOperation,
    pub old_data: Option<Value>,
    pub new_data: Option<Value>,
    pub actor: &'a str,
    pub changed_at: OffsetDateTime,
}

/// Writes audit entries inside the caller's unit of work, so an entry commits
/// or rolls back together with the mutation it describes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditRecorder;

impl AuditRecorder {
    pub fn new() -> Self {
        Self
    }

    /// Validates `change` and appends it to the log through `uow`.
    pub async fn record(
        &self,
        uow: &mut dyn UnitOfWork,
        change: Change<'_>,
    ) -> Result<AuditEntry, AuditError> {
        let entry = Self::build(uow.id(), change)?;
        uow.append_audit(&entry).await?;
        debug!(
            table = %entry.table_name,
            record_id = %entry.record_id,
            operation = %entry.operation,
            actor = %entry.actor,
            "audit entry appended"
        );
        Ok(entry)
    }

    fn build(unit_of_work_id: Uuid, change: Change<'_>) -> Result<AuditEntry, AuditError> {
        if change.table_name.trim().is_empty() {
            return Err(AuditError::InvalidRecord("table_name is empty".into()));
        }
        if change.actor.trim().is_empty() {
            return Err(AuditError::InvalidRecord("actor is empty".into()));
        }

        let (old_required, new_required) = match change.operation {
            AuditOperation::Insert => (false, true),
            AuditOperation::Update => (true, true),
            AuditOperation::Delete => (true, false),
        };
        if change.old_data.is_some() != old_required {
            return Err(AuditError::InvalidRecord(format!(
                "{} must {}carry old_data",
                change.operation,
                if old_required { "" } else { "not " }
            )));
        }
        if change.new_data.is_some() != new_required {
            return Err(AuditError::InvalidRecord(format!(
                "{} must {}carry new_data",
                change.operation,
                if new_required { "" } else { "not " }
            )));
        }

        Ok(AuditEntry {
            unit_of_work_id,
            table_name: change.table_name.to_string(),
            record_id: change.record_id,
            operation: change.operation,
            old_data: change.old_data,
            new_data: change.new_data,
            actor: change.actor.to_string(),
            changed_at: change.changed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryAccountRepository;
    use crate::storage::AccountRepository;
    use serde_json::json;

    fn change(operation: AuditOperation, old: Option<Value>, new: Option<Value>) -> Change<'static> {
        Change {
            table_name: "accounts",
            record_id: Uuid::new_v4(),
            operation,
            old_data: old,
            new_data: new,
            actor: "tester",
            changed_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn snapshot_presence_must_match_operation() {
        let snap = || Some(json!({"status": "active"}));
        let valid = [
            change(AuditOperation::Insert, None, snap()),
            change(AuditOperation::Update, snap(), snap()),
            change(AuditOperation::Delete, snap(), None),
        ];
        for c in valid {
            assert!(AuditRecorder::build(Uuid::new_v4(), c).is_ok());
        }

        let invalid = [
            change(AuditOperation::Insert, snap(), snap()),
            change(AuditOperation::Insert, None, None),
            change(AuditOperation::Update, None, snap()),
            change(AuditOperation::Update, snap(), None),
            change(AuditOperation::Delete, snap(), snap()),
            change(AuditOperation::Delete, None, None),
        ];
        for c in invalid {
            let err = AuditRecorder::build(Uuid::new_v4(), c).unwrap_err();
            assert!(matches!(err, AuditError::InvalidRecord(_)));
        }
    }

    #[test]
    fn operation_parsing_rejects_unknown_values() {
        assert_eq!("update".parse::<AuditOperation>().unwrap(), AuditOperation::Update);
        assert!(matches!(
            "upsert".parse::<AuditOperation>(),
            Err(AuditError::InvalidRecord(_))
        ));
    }

    #[test]
    fn blank_actor_is_rejected() {
        let mut c = change(AuditOperation::Insert, None, Some(json!({})));
        c.actor = " ";
        assert!(AuditRecorder::build(Uuid::new_v4(), c).is_err());
    }

    #[tokio::test]
    async fn entries_land_only_when_unit_of_work_commits() {
        let repo = MemoryAccountRepository::new();
        let c = change(AuditOperation::Insert, None, Some(json!({"email": "a@x.com"})));
        let record_id = c.record_id;

        let mut uow = repo.begin().await.expect("begin");
        let entry = AuditRecorder::new()
            .record(uow.as_mut(), c.clone())
            .await
            .expect("record");
        assert_eq!(entry.unit_of_work_id, uow.id());
        uow.rollback().await.expect("rollback");
        assert!(repo.audit_trail(record_id).await.unwrap().is_empty());

        let mut uow = repo.begin().await.expect("begin");
        AuditRecorder::new().record(uow.as_mut(), c).await.expect("record");
        uow.commit().await.expect("commit");
        let trail = repo.audit_trail(record_id).await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].operation, AuditOperation::Insert);
    }
}
