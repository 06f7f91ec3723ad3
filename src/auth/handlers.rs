use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tracing::{error, instrument};

use super::dto::{LoginRequest, PublicAccount, RegisterRequest, SessionResponse};
use super::extractors::AuthAccount;
use super::services::{AuthError, Session};
use crate::accounts::AccountError;
use crate::state::AppState;

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/me", get(get_me))
}

fn error_body(status: StatusCode, message: String) -> Response {
    let body = Json(json!({
        "error": {
            "message": message,
            "status": status.as_u16(),
        }
    }));
    (status, body).into_response()
}

fn account_status(err: &AccountError) -> StatusCode {
    match err {
        AccountError::InvalidEmail(_)
        | AccountError::EmptyCredential
        | AccountError::InvalidAuditRecord(_) => StatusCode::BAD_REQUEST,
        AccountError::PartialValidation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        AccountError::DuplicateEmail(_)
        | AccountError::Immutable
        | AccountError::AlreadyDeleted
        | AccountError::NotRestorable
        | AccountError::Conflict => StatusCode::CONFLICT,
        AccountError::NotFound => StatusCode::NOT_FOUND,
        AccountError::StoreUnavailable(_) | AccountError::CacheUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        AccountError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AccountError {
    fn into_response(self) -> Response {
        let status = account_status(&self);
        if status.is_server_error() {
            error!(error = %self, "account operation failed");
            let message = if self.is_retryable() {
                "service temporarily unavailable"
            } else {
                "internal error"
            };
            return error_body(status, message.into());
        }
        if let AccountError::PartialValidation(failures) = &self {
            let body = Json(json!({
                "error": {
                    "message": self.to_string(),
                    "status": status.as_u16(),
                    "records": failures,
                }
            }));
            return (status, body).into_response();
        }
        error_body(status, self.to_string())
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        if self.is_rejection() {
            return error_body(StatusCode::UNAUTHORIZED, self.public_message());
        }
        let message = self.public_message();
        match self {
            AuthError::Account(e) => e.into_response(),
            AuthError::WeakPassword => error_body(StatusCode::BAD_REQUEST, message),
            other => {
                error!(error = %other, "authentication flow failed");
                error_body(StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        }
    }
}

fn session_response(session: Session) -> Json<SessionResponse> {
    Json(SessionResponse {
        access_token: session.access_token,
        token_type: "Bearer",
        account: PublicAccount::from(&session.account),
    })
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), AuthError> {
    let session = state
        .sessions
        .register(&payload.email, &payload.password)
        .await?;
    Ok((StatusCode::CREATED, session_response(session)))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<SessionResponse>, AuthError> {
    let session = state
        .sessions
        .login(&payload.email, &payload.password)
        .await?;
    Ok(session_response(session))
}

#[instrument(skip_all)]
pub async fn get_me(AuthAccount(account): AuthAccount) -> Json<PublicAccount> {
    Json(PublicAccount::from(&account))
}
