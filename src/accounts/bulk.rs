use std::collections::HashMap;
use std::sync::Arc;

use futures_util::stream::{self, Stream, TryStreamExt};
use tracing::debug;
use uuid::Uuid;

use super::error::{RecordFailure, RecordProblem};
use super::validation::is_valid_email;
use super::{Account, AccountError, ExportFilter, ExportedAccount, ImportRecord};
use crate::storage::AccountRepository;

/// Accounts created by a successful bulk import, in input order.
#[derive(Debug, Clone)]
pub struct BulkResult {
    pub created: Vec<Account>,
}

/// Checks every row on its own and against the rest of the batch. Returns
/// the normalized email per row (`None` for rows that failed) and the
/// failures found so far.
pub(crate) fn validate_batch(
    records: &[ImportRecord],
) -> (Vec<Option<String>>, Vec<RecordFailure>) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut failures = Vec::new();
    let mut normalized = Vec::with_capacity(records.len());

    for (index, record) in records.iter().enumerate() {
        let email = record.email.trim().to_lowercase();
        let problem = if !is_valid_email(&email) {
            Some(RecordProblem::InvalidEmail)
        } else if record.credential_hash.trim().is_empty() {
            Some(RecordProblem::EmptyCredential)
        } else if let Some(&first_index) = seen.get(&email) {
            Some(RecordProblem::DuplicateInBatch { first_index })
        } else {
            None
        };

        match problem {
            Some(problem) => {
                failures.push(RecordFailure {
                    index,
                    email,
                    problem,
                });
                normalized.push(None);
            }
            None => {
                seen.insert(email.clone(), index);
                normalized.push(Some(email));
            }
        }
    }
    (normalized, failures)
}

pub(crate) fn already_registered(index: usize, email: &str) -> RecordFailure {
    RecordFailure {
        index,
        email: email.to_string(),
        problem: RecordProblem::AlreadyRegistered,
    }
}

/// Keyset-paginated export in id order.
///
/// Only one page is held at a time. The position is a plain account id, so an
/// interrupted export resumes with [`AccountExport::resume_after`].
pub struct AccountExport {
    repo: Arc<dyn AccountRepository>,
    filter: ExportFilter,
    page_size: i64,
    cursor: Option<Uuid>,
    exhausted: bool,
}

impl AccountExport {
    pub(crate) fn new(repo: Arc<dyn AccountRepository>, filter: ExportFilter, page_size: i64) -> Self {
        Self {
            repo,
            filter,
            page_size,
            cursor: None,
            exhausted: false,
        }
    }

    /// Continue after the account with id `cursor`.
    pub fn resume_after(mut self, cursor: Uuid) -> Self {
        self.cursor = Some(cursor);
        self.exhausted = false;
        self
    }

    /// Id of the last account handed out.
    pub fn cursor(&self) -> Option<Uuid> {
        self.cursor
    }

    /// Next page, or `None` once the export is complete.
    pub async fn next_page(&mut self) -> Result<Option<Vec<ExportedAccount>>, AccountError> {
        if self.exhausted {
            return Ok(None);
        }
        let rows = self
            .repo
            .page(&self.filter, self.cursor, self.page_size)
            .await?;
        if (rows.len() as i64) < self.page_size {
            self.exhausted = true;
        }
        let Some(last) = rows.last() else {
            return Ok(None);
        };
        self.cursor = Some(last.id);
        debug!(rows = rows.len(), cursor = %last.id, "export page read");
        Ok(Some(rows.into_iter().map(ExportedAccount::from).collect()))
    }

    /// Flattens the pages into a lazy stream of accounts.
    pub fn into_stream(self) -> impl Stream<Item = Result<ExportedAccount, AccountError>> + Send {
        stream::try_unfold(self, |mut export| async move {
            let page = export.next_page().await?;
            Ok::<_, AccountError>(page.map(|page| (page, export)))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, AccountError>)))
        .try_flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(email: &str) -> ImportRecord {
        ImportRecord {
            email: email.into(),
            credential_hash: "hash".into(),
        }
    }

    #[test]
    fn batch_validation_reports_each_problem() {
        let records = vec![
            record("a@x.com"),
            record("not-an-email"),
            record("A@X.com"),
            ImportRecord {
                email: "b@x.com".into(),
                credential_hash: " ".into(),
            },
            record("c@x.com"),
        ];
        let (normalized, failures) = validate_batch(&records);
        assert_eq!(normalized[0].as_deref(), Some("a@x.com"));
        assert_eq!(normalized[4].as_deref(), Some("c@x.com"));
        assert_eq!(
            failures.iter().map(|f| (f.index, f.problem.clone())).collect::<Vec<_>>(),
            vec![
                (1, RecordProblem::InvalidEmail),
                (2, RecordProblem::DuplicateInBatch { first_index: 0 }),
                (3, RecordProblem::EmptyCredential),
            ]
        );
    }

    #[test]
    fn failure_serializes_with_reason_tag() {
        let json = serde_json::to_value(already_registered(3, "a@x.com")).unwrap();
        assert_eq!(json["index"], 3);
        assert_eq!(json["reason"], "already_registered");
    }
}
