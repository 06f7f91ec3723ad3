use jsonwebtoken::errors::{Error as JwtError, ErrorKind};

/// Failures produced while issuing or verifying a token.
///
/// Everything except [`TokenError::Encoding`] is a security failure; callers
/// must present those uniformly (see [`TokenError::public_message`]).
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token encoding failed: {0}")]
    Encoding(String),

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token algorithm `{0}` is not allowed")]
    AlgorithmNotAllowed(String),

    #[error("token signature is invalid")]
    Signature,

    #[error("token is expired or not yet valid")]
    Expired,

    #[error("token claim mismatch: {0}")]
    ClaimMismatch(&'static str),
}

impl TokenError {
    pub fn is_security(&self) -> bool {
        !matches!(self, TokenError::Encoding(_))
    }

    /// The only text a verification failure may show to the presenter of the token.
    pub fn public_message(&self) -> &'static str {
        if self.is_security() {
            "invalid or expired token"
        } else {
            "token could not be issued"
        }
    }

    pub(crate) fn from_decode(err: JwtError) -> Self {
        match err.kind() {
            ErrorKind::InvalidSignature => TokenError::Signature,
            ErrorKind::ExpiredSignature | ErrorKind::ImmatureSignature => TokenError::Expired,
            ErrorKind::InvalidAudience => TokenError::ClaimMismatch("aud"),
            ErrorKind::InvalidIssuer => TokenError::ClaimMismatch("iss"),
            ErrorKind::InvalidSubject => TokenError::ClaimMismatch("sub"),
            ErrorKind::MissingRequiredClaim(_) => TokenError::ClaimMismatch("required claim missing"),
            ErrorKind::InvalidAlgorithm | ErrorKind::MissingAlgorithm => {
                TokenError::AlgorithmNotAllowed("key/algorithm mismatch".into())
            }
            ErrorKind::InvalidEcdsaKey
            | ErrorKind::InvalidRsaKey(_)
            | ErrorKind::InvalidKeyFormat => TokenError::Signature,
            _ => TokenError::Malformed(err.to_string()),
        }
    }
}
