use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::accounts::{Account, AccountStatus};

/// Request body for registration.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
}

/// Request body for login.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Response returned after register or login.
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub account: PublicAccount,
}

/// Public part of the account returned to the client.
#[derive(Debug, Clone, Serialize)]
pub struct PublicAccount {
    pub id: Uuid,
    pub email: String,
    pub status: AccountStatus,
}

impl From<&Account> for PublicAccount {
    fn from(a: &Account) -> Self {
        Self {
            id: a.id,
            email: a.email.clone(),
            status: a.status,
        }
    }
}
