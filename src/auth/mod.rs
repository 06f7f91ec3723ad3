use crate::state::AppState;
use axum::Router;

mod dto;
pub mod extractors;
pub mod handlers;
pub mod password;
pub mod services;

pub use extractors::AuthAccount;
pub use password::{Argon2Verifier, CredentialVerifier};
pub use services::{AuthError, Session, SessionService};

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(handlers::auth_routes())
        .merge(handlers::me_routes())
}
