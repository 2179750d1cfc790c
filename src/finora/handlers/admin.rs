//! Administrative endpoints. Callers must present an ADMIN access token.

use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use super::bearer_token;
use crate::auth::{
    AccessClaims, AuthService,
    types::{ErrorResponse, OkResponse},
};
use crate::store::Role;

fn reject(status: StatusCode, error: &str, message: &str) -> Response {
    let body = ErrorResponse {
        error: error.to_string(),
        message: message.to_string(),
    };
    (status, Json(body)).into_response()
}

fn require_admin(service: &AuthService, headers: &HeaderMap) -> Result<AccessClaims, Response> {
    let claims = bearer_token(headers)
        .and_then(|token| service.authenticate(token))
        .ok_or_else(|| reject(StatusCode::UNAUTHORIZED, "UNAUTHENTICATED", "Missing or invalid access token"))?;
    if claims.role != Role::Admin {
        warn!(sub = %claims.sub, "non-admin attempted admin action");
        return Err(reject(StatusCode::FORBIDDEN, "FORBIDDEN", "Admin role required"));
    }
    Ok(claims)
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/users/{id}/unlock",
    params(("id" = Uuid, Path, description = "User id")),
    responses(
        (status = 200, description = "Lock and failure counter cleared", body = OkResponse),
        (status = 401, description = "Missing or invalid access token", body = ErrorResponse),
        (status = 403, description = "Caller is not an admin", body = ErrorResponse),
        (status = 404, description = "User not found", body = ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn unlock_user(
    Extension(service): Extension<Arc<AuthService>>,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
) -> Response {
    let claims = match require_admin(&service, &headers) {
        Ok(claims) => claims,
        Err(response) => return response,
    };
    let Some(actor_id) = claims.subject_id() else {
        return reject(StatusCode::UNAUTHORIZED, "UNAUTHENTICATED", "Invalid token subject");
    };

    match service.unlock_user(actor_id, user_id).await {
        Ok(ok) => Json(ok).into_response(),
        Err(err) => err.into_response(),
    }
}
