//! Login, registration, token refresh and session endpoints.
//!
//! Flow Overview:
//! 1) `login` verifies credentials and returns an access/refresh token pair.
//! 2) `refresh` trades a refresh token for a new access token.
//! 3) Bearer-protected routes (`logout`, `me`, `permission`) run behind
//!    [`require_auth`](crate::api::middleware::require_auth), which places the
//!    caller's [`Claims`] in request extensions.

use crate::{
    api::error::ApiError,
    auth::{AuthService, Claims, LoginResponse, Origin, PermissionKey, Profile, Role, User, utils},
};
use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;
use utoipa::ToSchema;

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginRequest {
    /// Username or email.
    pub identifier: String,
    pub password: String,
    #[serde(default)]
    pub two_factor_code: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(flatten)]
    pub profile: Profile,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MeResponse {
    pub claims: Claims,
    pub roles: Vec<Role>,
    pub permissions: Vec<PermissionKey>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PermissionCheck {
    pub resource: String,
    pub action: String,
    pub allowed: bool,
}

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Credentials accepted.", body = LoginResponse),
        (status = 401, description = "Invalid credentials or two-factor code.", body = crate::api::error::ErrorBody),
        (status = 403, description = "Account disabled.", body = crate::api::error::ErrorBody),
        (status = 423, description = "Account locked.", body = crate::api::error::ErrorBody),
    ),
    tag = "auth"
)]
#[instrument(skip(service, origin, payload))]
pub async fn login(
    service: Extension<Arc<AuthService>>,
    Extension(origin): Extension<Origin>,
    payload: Option<Json<LoginRequest>>,
) -> Result<Json<LoginResponse>, ApiError> {
    let Some(Json(request)) = payload else {
        return Err(ApiError::BadRequest("Missing payload".to_string()));
    };
    if request.identifier.trim().is_empty() || request.password.is_empty() {
        return Err(ApiError::BadRequest(
            "identifier and password are required".to_string(),
        ));
    }

    let response = service
        .authenticate(
            &request.identifier,
            &request.password,
            request.two_factor_code.as_deref(),
            &origin,
        )
        .await?;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/v1/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "User created.", body = User),
        (status = 400, description = "Invalid email or weak password.", body = crate::api::error::ErrorBody),
        (status = 409, description = "Username or email already exists.", body = crate::api::error::ErrorBody),
    ),
    tag = "auth"
)]
#[instrument(skip(service, payload))]
pub async fn register(
    service: Extension<Arc<AuthService>>,
    payload: Option<Json<RegisterRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(Json(request)) = payload else {
        return Err(ApiError::BadRequest("Missing payload".to_string()));
    };
    if request.username.trim().is_empty() {
        return Err(ApiError::BadRequest("Invalid username".to_string()));
    }
    if !utils::valid_email(&utils::normalize_email(&request.email)) {
        return Err(ApiError::BadRequest("Invalid email".to_string()));
    }

    let user = service
        .register(
            &request.username,
            &request.email,
            &request.password,
            request.profile,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[utoipa::path(
    post,
    path = "/v1/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "New access token issued.", body = LoginResponse),
        (status = 401, description = "Refresh token unknown, expired or revoked.", body = crate::api::error::ErrorBody),
    ),
    tag = "auth"
)]
#[instrument(skip(service, payload))]
pub async fn refresh(
    service: Extension<Arc<AuthService>>,
    payload: Option<Json<RefreshRequest>>,
) -> Result<Json<LoginResponse>, ApiError> {
    let Some(Json(request)) = payload else {
        return Err(ApiError::BadRequest("Missing payload".to_string()));
    };
    Ok(Json(service.refresh(request.refresh_token.trim()).await?))
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    responses(
        (status = 204, description = "Session revoked."),
        (status = 401, description = "Missing or invalid bearer token.", body = crate::api::error::ErrorBody),
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn logout(
    service: Extension<Arc<AuthService>>,
    Extension(claims): Extension<Claims>,
) -> Result<StatusCode, ApiError> {
    service.logout(claims.session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/v1/auth/me",
    responses(
        (status = 200, description = "Caller identity, roles and explicit permissions.", body = MeResponse),
        (status = 401, description = "Missing or invalid bearer token.", body = crate::api::error::ErrorBody),
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn me(
    service: Extension<Arc<AuthService>>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<MeResponse>, ApiError> {
    let roles = service.roles_of(claims.user_id).await?;
    let permissions = service
        .permissions_of(claims.user_id)
        .await?
        .into_iter()
        .collect();
    Ok(Json(MeResponse {
        claims,
        roles,
        permissions,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/auth/permissions/{resource}/{action}",
    params(
        ("resource" = String, Path, description = "Resource name, e.g. `domain`"),
        ("action" = String, Path, description = "Action name, e.g. `create`"),
    ),
    responses(
        (status = 200, description = "Whether the caller holds the permission.", body = PermissionCheck),
        (status = 401, description = "Missing or invalid bearer token.", body = crate::api::error::ErrorBody),
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn permission(
    service: Extension<Arc<AuthService>>,
    Extension(claims): Extension<Claims>,
    Path((resource, action)): Path<(String, String)>,
) -> Result<Json<PermissionCheck>, ApiError> {
    let allowed = service
        .has_permission(claims.user_id, &resource, &action)
        .await?;
    Ok(Json(PermissionCheck {
        resource,
        action,
        allowed,
    }))
}
