//! HTTP rendering of [`AuthError`].

use crate::auth::AuthError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<DateTime<Utc>>,
}

/// Error returned by handlers; wraps the core taxonomy or a plain request error.
#[derive(Debug)]
pub enum ApiError {
    Auth(AuthError),
    BadRequest(String),
    Unauthorized,
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self::Auth(err)
    }
}

fn status_of(err: &AuthError) -> StatusCode {
    match err {
        AuthError::InvalidCredentials
        | AuthError::InvalidToken
        | AuthError::InvalidRefreshToken
        | AuthError::TwoFactorRequired
        | AuthError::InvalidTwoFactorCode => StatusCode::UNAUTHORIZED,
        AuthError::AccountDisabled | AuthError::PermissionDenied => StatusCode::FORBIDDEN,
        AuthError::AccountLocked { .. } => StatusCode::LOCKED,
        AuthError::WeakPassword(_) => StatusCode::BAD_REQUEST,
        AuthError::DuplicateIdentity => StatusCode::CONFLICT,
        AuthError::UnknownRole(_) | AuthError::UnknownUser(_) => StatusCode::NOT_FOUND,
        AuthError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: message,
                    locked_until: None,
                },
            ),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    error: "missing or invalid bearer token".to_string(),
                    locked_until: None,
                },
            ),
            Self::Auth(err) => {
                if let AuthError::Unavailable(source) = &err {
                    error!("auth backend unavailable: {source:#}");
                }
                let locked_until = match &err {
                    AuthError::AccountLocked { until } => Some(*until),
                    _ => None,
                };
                (
                    status_of(&err),
                    ErrorBody {
                        error: err.to_string(),
                        locked_until,
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}
