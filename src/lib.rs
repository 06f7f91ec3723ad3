//! Identity and account-lifecycle core: signed tokens, an append-only audit
//! log, a read-through account cache and the account store that ties them
//! together.

pub mod accounts;
pub mod app;
pub mod audit;
pub mod auth;
pub mod cache;
pub mod config;
pub mod state;
pub mod storage;
pub mod tokens;

pub use accounts::{Account, AccountError, AccountStatus, AccountStore};
pub use audit::{AuditEntry, AuditOperation, AuditRecorder};
pub use cache::AccountCache;
pub use tokens::{Claims, TokenEngine, TokenError};
