use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::password::CredentialVerifier;
use crate::accounts::{normalize_email, Account, AccountError, AccountLookup, AccountStore};
use crate::config::JwtConfig;
use crate::tokens::{Algorithm, Claims, KeyProvider, TokenEngine, TokenError, VerifyOptions};

const MIN_PASSWORD_LEN: usize = 8;
const REGISTRATION_ACTOR: &str = "self-registration";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("password must be at least 8 characters")]
    WeakPassword,

    #[error("token subject does not name an account")]
    UnknownAccount,

    #[error("account is not active")]
    Inactive,

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Account(#[from] AccountError),

    #[error("credential hashing failed: {0}")]
    Credential(String),
}

impl AuthError {
    /// Failures that must look identical to whoever presented the credential
    /// or token.
    pub fn is_rejection(&self) -> bool {
        match self {
            AuthError::InvalidCredentials | AuthError::UnknownAccount | AuthError::Inactive => {
                true
            }
            AuthError::Token(e) => e.is_security(),
            _ => false,
        }
    }

    pub fn public_message(&self) -> String {
        match self {
            AuthError::InvalidCredentials => "invalid credentials".into(),
            AuthError::UnknownAccount | AuthError::Inactive => {
                TokenError::Signature.public_message().into()
            }
            AuthError::Token(e) => e.public_message().into(),
            AuthError::WeakPassword => self.to_string(),
            AuthError::Account(e) => e.to_string(),
            AuthError::Credential(_) => "internal error".into(),
        }
    }
}

/// An issued access token and the account it was issued for.
#[derive(Debug, Clone)]
pub struct Session {
    pub access_token: String,
    pub account: Account,
}

/// Registration, login and bearer-token authentication on top of the
/// account store and the token engine.
pub struct SessionService {
    store: Arc<AccountStore>,
    engine: TokenEngine,
    keys: Arc<dyn KeyProvider>,
    credentials: Arc<dyn CredentialVerifier>,
    issuer: String,
    audience: String,
    allowed_algorithms: Vec<Algorithm>,
    leeway: u64,
}

impl SessionService {
    pub fn new(
        store: Arc<AccountStore>,
        keys: Arc<dyn KeyProvider>,
        credentials: Arc<dyn CredentialVerifier>,
        jwt: &JwtConfig,
    ) -> Self {
        Self {
            store,
            engine: TokenEngine::new(Duration::from_secs(jwt.ttl_minutes.max(1) as u64 * 60)),
            keys,
            credentials,
            issuer: jwt.issuer.clone(),
            audience: jwt.audience.clone(),
            allowed_algorithms: vec![jwt.algorithm],
            leeway: jwt.leeway_seconds,
        }
    }

    pub fn store(&self) -> &AccountStore {
        &self.store
    }

    #[instrument(skip(self, password))]
    pub async fn register(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        if password.chars().count() < MIN_PASSWORD_LEN {
            warn!("password too short");
            return Err(AuthError::WeakPassword);
        }
        let hash = self
            .credentials
            .hash(password)
            .map_err(|e| AuthError::Credential(e.to_string()))?;
        let account = self.store.create(email, &hash, REGISTRATION_ACTOR).await?;
        let access_token = self.issue_for(&account)?;
        info!(account_id = %account.id, "account registered");
        Ok(Session {
            access_token,
            account,
        })
    }

    /// Checks the credential, stamps the login and issues a token. Unknown
    /// emails, inactive accounts and wrong passwords are indistinguishable
    /// to the caller.
    #[instrument(skip(self, password))]
    pub async fn login(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let Ok(email) = normalize_email(email) else {
            warn!("login with malformed email");
            return Err(AuthError::InvalidCredentials);
        };
        let Some(account) = self.store.get(AccountLookup::Email(email)).await? else {
            warn!("login for unknown email");
            return Err(AuthError::InvalidCredentials);
        };
        if !account.is_active() {
            warn!(account_id = %account.id, status = account.status.as_str(), "login for inactive account");
            return Err(AuthError::InvalidCredentials);
        }
        let matches = self
            .credentials
            .verify(password, &account.credential_hash)
            .unwrap_or_else(|e| {
                warn!(account_id = %account.id, error = %e, "stored credential unreadable");
                false
            });
        if !matches {
            warn!(account_id = %account.id, "login invalid password");
            return Err(AuthError::InvalidCredentials);
        }

        let account = self
            .store
            .record_login(account.id, &account.id.to_string())
            .await?;
        let access_token = self.issue_for(&account)?;
        info!(account_id = %account.id, "account logged in");
        Ok(Session {
            access_token,
            account,
        })
    }

    /// Resolves a bearer token to its account. The account is re-read on
    /// every call so a token outlives neither deletion nor anonymization.
    pub async fn authenticate(&self, token: &str) -> Result<Account, AuthError> {
        let key = self.keys.verification_key()?;
        let options = VerifyOptions {
            audience: Some(&self.audience),
            issuer: Some(&self.issuer),
            leeway: self.leeway,
            ..VerifyOptions::default()
        };
        let claims = self
            .engine
            .verify(token, &key, &self.allowed_algorithms, &options)
            .map_err(|e| {
                warn!(error = %e, "token rejected");
                e
            })?;

        let id = claims
            .sub
            .as_deref()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or(TokenError::ClaimMismatch("sub"))?;
        let account = self
            .store
            .get(id)
            .await?
            .ok_or(AuthError::UnknownAccount)?;
        if !account.is_active() {
            warn!(account_id = %id, status = account.status.as_str(), "token for inactive account");
            return Err(AuthError::Inactive);
        }
        debug!(account_id = %id, "token authenticated");
        Ok(account)
    }

    fn issue_for(&self, account: &Account) -> Result<String, AuthError> {
        let signing = self.keys.signing_key()?;
        let claims = Claims::for_subject(account.id.to_string())
            .with_issuer(self.issuer.as_str())
            .with_audience(self.audience.as_str());
        Ok(self
            .engine
            .issue(&claims, &signing.key, signing.algorithm, None)?)
    }
}
