//! Bearer-token authentication and permission guards.

use super::error::ApiError;
use crate::auth::{AuthError, AuthService, Claims, Origin};
use axum::{
    extract::{ConnectInfo, Extension, Request, State},
    http::{
        HeaderMap,
        header::{AUTHORIZATION, USER_AGENT},
    },
    middleware::Next,
    response::Response,
};
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

/// Whether `x-forwarded-for` and `x-real-ip` may name the client address.
/// Enable only behind a proxy that overwrites both headers; otherwise any
/// client can choose the address recorded on its logins and security events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProxyHeaders {
    pub trusted: bool,
}

/// Extract a bearer token from the `Authorization` header.
pub(crate) fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Client address and agent. Proxy headers are consulted only when trusted;
/// the socket peer is the fallback.
pub(crate) fn origin_from(headers: &HeaderMap, peer: Option<IpAddr>, proxy: ProxyHeaders) -> Origin {
    let forwarded = if proxy.trusted {
        forwarded_address(headers)
    } else {
        None
    };
    let ip_address = forwarded.or_else(|| peer.map(|ip| ip.to_string()));
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    Origin::new(ip_address, user_agent)
}

fn forwarded_address(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|value| value.to_str().ok())
        })
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Resolve the caller's [`Origin`] once per request and store it in request
/// extensions.
pub async fn client_origin(
    State(proxy): State<ProxyHeaders>,
    mut request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let origin = origin_from(request.headers(), peer, proxy);
    request.extensions_mut().insert(origin);
    next.run(request).await
}

/// Reject requests without a valid access token; otherwise expose the
/// [`Claims`] to downstream handlers through request extensions.
pub async fn require_auth(
    Extension(service): Extension<Arc<AuthService>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer_token(request.headers()).ok_or(ApiError::Unauthorized)?;
    let claims = service.validate_token(&token)?;
    request.extensions_mut().insert(claims);
    Ok(next.run(request).await)
}

/// Fail with [`AuthError::PermissionDenied`] unless the caller may perform
/// `action` on `resource`.
///
/// # Errors
/// Returns [`ApiError::Auth`] with `PermissionDenied` or `Unavailable`.
pub async fn require_permission(
    service: &AuthService,
    claims: &Claims,
    resource: &str,
    action: &str,
) -> Result<(), ApiError> {
    if service
        .has_permission(claims.user_id, resource, action)
        .await?
    {
        Ok(())
    } else {
        Err(AuthError::PermissionDenied.into())
    }
}
