//! Role administration. Callers need `role.assign` (or the admin role).

use crate::{
    api::{error::ApiError, middleware::require_permission},
    auth::{AuthService, Claims},
};
use axum::{
    extract::{Extension, Path},
    http::StatusCode,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const RESOURCE: &str = "role";
const ACTION: &str = "assign";

#[utoipa::path(
    put,
    path = "/v1/auth/users/{user_id}/roles/{role}",
    params(
        ("user_id" = Uuid, Path, description = "Target user"),
        ("role" = String, Path, description = "Role name"),
    ),
    responses(
        (status = 204, description = "Role assigned (idempotent)."),
        (status = 401, description = "Missing or invalid bearer token.", body = crate::api::error::ErrorBody),
        (status = 403, description = "Caller lacks role.assign.", body = crate::api::error::ErrorBody),
        (status = 404, description = "Unknown user or role.", body = crate::api::error::ErrorBody),
    ),
    security(("bearer" = [])),
    tag = "roles"
)]
pub async fn assign(
    service: Extension<Arc<AuthService>>,
    Extension(claims): Extension<Claims>,
    Path((user_id, role)): Path<(Uuid, String)>,
) -> Result<StatusCode, ApiError> {
    require_permission(&service, &claims, RESOURCE, ACTION).await?;
    service.assign_role(user_id, &role).await?;
    info!(actor = %claims.user_id, %user_id, role = %role, "role assigned via api");
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    delete,
    path = "/v1/auth/users/{user_id}/roles/{role}",
    params(
        ("user_id" = Uuid, Path, description = "Target user"),
        ("role" = String, Path, description = "Role name"),
    ),
    responses(
        (status = 204, description = "Role removed."),
        (status = 401, description = "Missing or invalid bearer token.", body = crate::api::error::ErrorBody),
        (status = 403, description = "Caller lacks role.assign.", body = crate::api::error::ErrorBody),
        (status = 404, description = "Unknown user or role, or role not held.", body = crate::api::error::ErrorBody),
    ),
    security(("bearer" = [])),
    tag = "roles"
)]
pub async fn revoke(
    service: Extension<Arc<AuthService>>,
    Extension(claims): Extension<Claims>,
    Path((user_id, role)): Path<(Uuid, String)>,
) -> Result<StatusCode, ApiError> {
    require_permission(&service, &claims, RESOURCE, ACTION).await?;
    if service.revoke_role(user_id, &role).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}
