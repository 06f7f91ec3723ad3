use lazy_static::lazy_static;
use regex::Regex;

use super::AccountError;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Trims and lowercases `raw`, rejecting anything that is not an address.
pub fn normalize_email(raw: &str) -> Result<String, AccountError> {
    let email = raw.trim().to_lowercase();
    if !is_valid_email(&email) {
        return Err(AccountError::InvalidEmail(email));
    }
    Ok(email)
}

pub(crate) fn check_credential(credential_hash: &str) -> Result<(), AccountError> {
    if credential_hash.trim().is_empty() {
        return Err(AccountError::EmptyCredential);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_whitespace() {
        assert_eq!(normalize_email("  Alice@Example.COM ").unwrap(), "alice@example.com");
    }

    #[test]
    fn rejects_non_addresses() {
        for bad in ["", "alice", "alice@", "@example.com", "a b@x.com", "a@x"] {
            assert!(normalize_email(bad).is_err(), "{bad}");
        }
    }
}
