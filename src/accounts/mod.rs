//! Account lifecycle: creation, soft deletion, restoration, anonymization and
//! bulk import/export, each audited and kept consistent with the cache.

mod bulk;
mod error;
mod repo_types;
mod store;
mod validation;

pub use bulk::{AccountExport, BulkResult};
pub use error::{AccountError, RecordFailure, RecordProblem};
pub use repo_types::{
    anonymized_credential, anonymized_email, Account, AccountLookup, AccountStatus,
    AccountUpdate, ExportFilter, ExportedAccount, ImportRecord,
};
pub use store::{AccountStore, ACCOUNTS_TABLE};
pub use validation::normalize_email;
