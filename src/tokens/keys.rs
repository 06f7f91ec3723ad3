use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};

use super::TokenError;

/// Key material for one signing operation.
pub struct SigningKey {
    pub key: EncodingKey,
    pub algorithm: Algorithm,
}

/// Source of signing/verification keys. Implementations own rotation; the
/// engine asks for keys on every call and never caches them.
pub trait KeyProvider: Send + Sync {
    fn signing_key(&self) -> Result<SigningKey, TokenError>;
    fn verification_key(&self) -> Result<DecodingKey, TokenError>;
}

/// Shared-secret provider for the HMAC family.
#[derive(Clone)]
pub struct StaticKeyProvider {
    secret: Vec<u8>,
    algorithm: Algorithm,
}

impl StaticKeyProvider {
    pub fn hmac(secret: impl AsRef<[u8]>, algorithm: Algorithm) -> Result<Self, TokenError> {
        if !matches!(
            algorithm,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        ) {
            return Err(TokenError::Encoding(format!(
                "{algorithm:?} is not an HMAC algorithm"
            )));
        }
        Ok(Self {
            secret: secret.as_ref().to_vec(),
            algorithm,
        })
    }
}

impl KeyProvider for StaticKeyProvider {
    fn signing_key(&self) -> Result<SigningKey, TokenError> {
        Ok(SigningKey {
            key: EncodingKey::from_secret(&self.secret),
            algorithm: self.algorithm,
        })
    }

    fn verification_key(&self) -> Result<DecodingKey, TokenError> {
        Ok(DecodingKey::from_secret(&self.secret))
    }
}

impl std::fmt::Debug for StaticKeyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeyProvider")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}
