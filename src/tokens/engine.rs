use std::str::FromStr;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;

use super::{access_token_hash, Claims, TokenError};

/// Expected claim values for [`TokenEngine::verify`]. `None` skips the check.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyOptions<'a> {
    pub audience: Option<&'a str>,
    pub issuer: Option<&'a str>,
    pub subject: Option<&'a str>,
    /// Access token the verified token must be bound to via `at_hash`.
    pub access_token: Option<&'a str>,
    /// Clock-skew tolerance for `exp`/`nbf`, in seconds.
    pub leeway: u64,
}

/// Encodes and verifies compact JWS tokens. Holds no keys and no mutable state.
#[derive(Debug, Clone, Copy)]
pub struct TokenEngine {
    default_ttl: Duration,
}

impl Default for TokenEngine {
    fn default() -> Self {
        Self::new(Duration::from_secs(60 * 60))
    }
}

impl TokenEngine {
    pub fn new(default_ttl: Duration) -> Self {
        Self { default_ttl }
    }

    /// Signs `claims` with `key`. Missing `iat` defaults to now and missing
    /// `exp` to `iat + default_ttl`. The header's `alg` is always `algorithm`.
    pub fn issue(
        &self,
        claims: &Claims,
        key: &EncodingKey,
        algorithm: Algorithm,
        header: Option<Header>,
    ) -> Result<String, TokenError> {
        let mut claims = claims.clone();
        let iat = *claims
            .iat
            .get_or_insert_with(|| OffsetDateTime::now_utc().unix_timestamp());
        claims
            .exp
            .get_or_insert(iat + self.default_ttl.as_secs() as i64);

        let mut header = header.unwrap_or_default();
        header.alg = algorithm;
        if header.typ.is_none() {
            header.typ = Some("JWT".into());
        }

        let token =
            encode(&header, &claims, key).map_err(|e| TokenError::Encoding(e.to_string()))?;
        debug!(sub = ?claims.sub, alg = ?algorithm, exp = ?claims.exp, "token issued");
        Ok(token)
    }

    /// Verifies `token` and returns its claims.
    ///
    /// The header algorithm must appear in `allowed_algorithms`; an empty
    /// allow-list rejects every token.
    pub fn verify(
        &self,
        token: &str,
        key: &DecodingKey,
        allowed_algorithms: &[Algorithm],
        options: &VerifyOptions<'_>,
    ) -> Result<Claims, TokenError> {
        let algorithm = header_algorithm(token)?;
        if !allowed_algorithms.contains(&algorithm) {
            return Err(TokenError::AlgorithmNotAllowed(format!("{algorithm:?}")));
        }

        let mut validation = Validation::new(algorithm);
        validation.leeway = options.leeway;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp"]);
        match options.audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        if let Some(iss) = options.issuer {
            validation.set_issuer(&[iss]);
        }

        let claims = decode::<Claims>(token, key, &validation)
            .map_err(TokenError::from_decode)?
            .claims;

        // jsonwebtoken only compares aud/iss when the token carries them
        if let Some(audience) = options.audience {
            if claims.aud.as_deref() != Some(audience) {
                return Err(TokenError::ClaimMismatch("aud"));
            }
        }
        if let Some(issuer) = options.issuer {
            if claims.iss.as_deref() != Some(issuer) {
                return Err(TokenError::ClaimMismatch("iss"));
            }
        }
        if let Some(subject) = options.subject {
            if claims.sub.as_deref() != Some(subject) {
                return Err(TokenError::ClaimMismatch("sub"));
            }
        }
        if let Some(access_token) = options.access_token {
            let expected = access_token_hash(algorithm, access_token);
            if claims.at_hash.as_deref() != Some(expected.as_str()) {
                return Err(TokenError::ClaimMismatch("at_hash"));
            }
        }

        debug!(sub = ?claims.sub, alg = ?algorithm, "token verified");
        Ok(claims)
    }
}

/// Reads `alg` from the header without trusting anything else in the token.
fn header_algorithm(token: &str) -> Result<Algorithm, TokenError> {
    let mut segments = token.split('.');
    let (Some(header), Some(_), Some(_), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(TokenError::Malformed("expected three segments".into()));
    };

    let raw = URL_SAFE_NO_PAD
        .decode(header)
        .map_err(|e| TokenError::Malformed(format!("header encoding: {e}")))?;
    let header: Value = serde_json::from_slice(&raw)
        .map_err(|e| TokenError::Malformed(format!("header json: {e}")))?;
    let alg = header
        .get("alg")
        .and_then(Value::as_str)
        .ok_or_else(|| TokenError::Malformed("header has no alg".into()))?;

    Algorithm::from_str(alg).map_err(|_| TokenError::AlgorithmNotAllowed(alg.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"engine-test-secret";

    fn now() -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }

    fn sample_claims() -> Claims {
        let iat = now();
        Claims {
            iat: Some(iat),
            exp: Some(iat + 300),
            ..Claims::for_subject("acct-1")
                .with_issuer("identity")
                .with_audience("web")
                .with_custom("tenant", "acme")
        }
    }

    fn issue(claims: &Claims, alg: Algorithm) -> String {
        TokenEngine::default()
            .issue(claims, &EncodingKey::from_secret(SECRET), alg, None)
            .expect("issue")
    }

    fn verify(token: &str, allowed: &[Algorithm], opts: VerifyOptions<'_>) -> Result<Claims, TokenError> {
        TokenEngine::default().verify(token, &DecodingKey::from_secret(SECRET), allowed, &opts)
    }

    fn full_opts() -> VerifyOptions<'static> {
        VerifyOptions {
            audience: Some("web"),
            issuer: Some("identity"),
            subject: Some("acct-1"),
            ..VerifyOptions::default()
        }
    }

    #[test]
    fn issue_then_verify_returns_original_claims() {
        let claims = sample_claims();
        let token = issue(&claims, Algorithm::HS256);
        let verified = verify(&token, &[Algorithm::HS256], full_opts()).expect("verify");
        assert_eq!(verified, claims);
    }

    #[test]
    fn issue_defaults_iat_and_exp() {
        let engine = TokenEngine::new(Duration::from_secs(120));
        let token = engine
            .issue(
                &Claims::for_subject("acct-1"),
                &EncodingKey::from_secret(SECRET),
                Algorithm::HS256,
                None,
            )
            .expect("issue");
        let claims = verify(&token, &[Algorithm::HS256], VerifyOptions::default()).expect("verify");
        let iat = claims.iat.expect("iat defaulted");
        assert_eq!(claims.exp, Some(iat + 120));
    }

    #[test]
    fn issue_rejects_key_algorithm_mismatch() {
        let err = TokenEngine::default()
            .issue(
                &sample_claims(),
                &EncodingKey::from_secret(SECRET),
                Algorithm::RS256,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, TokenError::Encoding(_)));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let token = issue(&sample_claims(), Algorithm::HS256);
        let err = TokenEngine::default()
            .verify(
                &token,
                &DecodingKey::from_secret(b"another-secret"),
                &[Algorithm::HS256],
                &full_opts(),
            )
            .unwrap_err();
        assert!(matches!(err, TokenError::Signature));
    }

    #[test]
    fn verify_rejects_algorithm_outside_allow_list() {
        let token = issue(&sample_claims(), Algorithm::HS384);
        let err = verify(&token, &[Algorithm::HS256], full_opts()).unwrap_err();
        assert!(matches!(err, TokenError::AlgorithmNotAllowed(_)));

        let err = verify(&token, &[], full_opts()).unwrap_err();
        assert!(matches!(err, TokenError::AlgorithmNotAllowed(_)));
    }

    #[test]
    fn verify_rejects_unsigned_none_token() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&sample_claims()).expect("claims json"),
        );
        let token = format!("{header}.{payload}.");
        let err = verify(&token, &[Algorithm::HS256], full_opts()).unwrap_err();
        assert!(matches!(err, TokenError::AlgorithmNotAllowed(ref alg) if alg == "none"));
    }

    #[test]
    fn verify_rejects_malformed_structure() {
        for token in ["", "abc", "a.b", "a.b.c.d", "!!!.e30.sig"] {
            let err = verify(token, &[Algorithm::HS256], full_opts()).unwrap_err();
            assert!(matches!(err, TokenError::Malformed(_)), "{token}: {err:?}");
        }
    }

    #[test]
    fn verify_rejects_claim_mismatches() {
        let token = issue(&sample_claims(), Algorithm::HS256);
        let cases = [
            (VerifyOptions { audience: Some("mobile"), ..full_opts() }, "aud"),
            (VerifyOptions { issuer: Some("evil"), ..full_opts() }, "iss"),
            (VerifyOptions { subject: Some("acct-2"), ..full_opts() }, "sub"),
        ];
        for (opts, claim) in cases {
            let err = verify(&token, &[Algorithm::HS256], opts).unwrap_err();
            assert!(
                matches!(err, TokenError::ClaimMismatch(c) if c == claim),
                "{claim}: {err:?}"
            );
        }
    }

    #[test]
    fn expiry_boundary_respects_leeway() {
        let mut claims = sample_claims();
        claims.exp = Some(now() - 1);
        let token = issue(&claims, Algorithm::HS256);

        let err = verify(&token, &[Algorithm::HS256], full_opts()).unwrap_err();
        assert!(matches!(err, TokenError::Expired));

        let opts = VerifyOptions { leeway: 1, ..full_opts() };
        assert!(verify(&token, &[Algorithm::HS256], opts).is_ok());
        let opts = VerifyOptions { leeway: 5, ..full_opts() };
        assert!(verify(&token, &[Algorithm::HS256], opts).is_ok());
    }

    #[test]
    fn missing_aud_or_iss_fails_when_expected() {
        let mut claims = Claims::for_subject("acct-1");
        claims.exp = Some(now() + 300);
        let token = issue(&claims, Algorithm::HS256);

        let expect_aud = VerifyOptions { audience: Some("web"), ..VerifyOptions::default() };
        let err = verify(&token, &[Algorithm::HS256], expect_aud).unwrap_err();
        assert!(matches!(err, TokenError::ClaimMismatch("aud")), "{err:?}");

        let expect_iss = VerifyOptions { issuer: Some("identity"), ..VerifyOptions::default() };
        let err = verify(&token, &[Algorithm::HS256], expect_iss).unwrap_err();
        assert!(matches!(err, TokenError::ClaimMismatch("iss")), "{err:?}");

        assert!(verify(&token, &[Algorithm::HS256], VerifyOptions::default()).is_ok());
    }

    #[test]
    fn verify_rejects_token_not_yet_valid() {
        let mut claims = sample_claims();
        claims.nbf = Some(now() + 120);
        let token = issue(&claims, Algorithm::HS256);
        let err = verify(&token, &[Algorithm::HS256], full_opts()).unwrap_err();
        assert!(matches!(err, TokenError::Expired));
    }

    #[test]
    fn access_token_binding_is_enforced() {
        let claims = sample_claims().bind_access_token(Algorithm::HS256, "access-abc");
        let token = issue(&claims, Algorithm::HS256);

        let bound = VerifyOptions { access_token: Some("access-abc"), ..full_opts() };
        assert!(verify(&token, &[Algorithm::HS256], bound).is_ok());

        let swapped = VerifyOptions { access_token: Some("access-xyz"), ..full_opts() };
        let err = verify(&token, &[Algorithm::HS256], swapped).unwrap_err();
        assert!(matches!(err, TokenError::ClaimMismatch("at_hash")));

        let unbound = issue(&sample_claims(), Algorithm::HS256);
        let err = verify(&unbound, &[Algorithm::HS256], bound).unwrap_err();
        assert!(matches!(err, TokenError::ClaimMismatch("at_hash")));
    }

    #[test]
    fn security_failures_share_one_public_message() {
        let messages: Vec<_> = [
            TokenError::Signature,
            TokenError::Expired,
            TokenError::ClaimMismatch("aud"),
            TokenError::Malformed("x".into()),
        ]
        .iter()
        .map(TokenError::public_message)
        .collect();
        assert!(messages.iter().all(|m| *m == "invalid or expired token"));
    }
}
