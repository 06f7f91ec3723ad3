//! Stateless bearer-token engine: JWS compact tokens signed and verified with
//! keys supplied per call.

mod claims;
mod engine;
mod error;
mod keys;

pub use claims::{access_token_hash, Claims};
pub use engine::{TokenEngine, VerifyOptions};
pub use error::TokenError;
pub use keys::{KeyProvider, SigningKey, StaticKeyProvider};

pub use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header};
