//! Auth endpoints under `/api/v1/auth`.
//!
//! Handlers only parse transport input and map results; every rule lives in
//! `AuthService`.

use axum::{
    extract::{Extension, Query},
    http::{StatusCode, header::LOCATION},
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::{
    AuthError, AuthService,
    types::{
        EmailRequest, ErrorResponse, LoginRequest, LoginResponse, LogoutRequest, OkResponse,
        PublicUser, RefreshRequest, RefreshResponse, RegisterRequest, ResetPasswordRequest,
        VerifyQuery,
    },
};

fn missing_payload() -> AuthError {
    AuthError::Validation("Missing or invalid payload")
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "User created, verification email sent", body = PublicUser),
        (status = 400, description = "Invalid input", body = ErrorResponse),
        (status = 409, description = "Email already registered", body = ErrorResponse),
    ),
    tag = "auth"
)]
pub async fn register(
    Extension(service): Extension<Arc<AuthService>>,
    payload: Option<Json<RegisterRequest>>,
) -> Result<(StatusCode, Json<PublicUser>), AuthError> {
    let Json(request) = payload.ok_or_else(missing_payload)?;
    let user = service
        .register(&request.email, &request.password, request.name.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Access token and refresh session", body = LoginResponse),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 423, description = "Account temporarily locked", body = ErrorResponse),
    ),
    tag = "auth"
)]
pub async fn login(
    Extension(service): Extension<Arc<AuthService>>,
    payload: Option<Json<LoginRequest>>,
) -> Result<Json<LoginResponse>, AuthError> {
    let Json(request) = payload.ok_or_else(missing_payload)?;
    Ok(Json(service.login(&request.email, &request.password).await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Rotated refresh session", body = RefreshResponse),
        (status = 401, description = "Invalid, expired or reused session", body = ErrorResponse),
        (status = 423, description = "Account temporarily locked", body = ErrorResponse),
    ),
    tag = "auth"
)]
pub async fn refresh(
    Extension(service): Extension<Arc<AuthService>>,
    payload: Option<Json<RefreshRequest>>,
) -> Result<Json<RefreshResponse>, AuthError> {
    let Json(request) = payload.ok_or_else(missing_payload)?;
    let session_id = Uuid::parse_str(&request.session_id).map_err(|_| AuthError::InvalidSession)?;
    Ok(Json(
        service.refresh(session_id, &request.refresh_token).await?,
    ))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/logout",
    request_body = LogoutRequest,
    responses(
        (status = 200, description = "Session removed (idempotent)", body = OkResponse),
    ),
    tag = "auth"
)]
pub async fn logout(
    Extension(service): Extension<Arc<AuthService>>,
    payload: Option<Json<LogoutRequest>>,
) -> Result<Json<OkResponse>, AuthError> {
    let Json(request) = payload.ok_or_else(missing_payload)?;
    // An id that cannot exist has nothing to delete.
    let Ok(session_id) = Uuid::parse_str(&request.session_id) else {
        return Ok(Json(OkResponse::OK));
    };
    Ok(Json(service.logout(session_id).await?))
}

#[utoipa::path(
    get,
    path = "/api/v1/auth/verify",
    params(VerifyQuery),
    responses(
        (status = 302, description = "Email verified, redirect to the frontend"),
        (status = 400, description = "Invalid or expired token", body = ErrorResponse),
    ),
    tag = "auth"
)]
pub async fn verify(
    Extension(service): Extension<Arc<AuthService>>,
    Query(query): Query<VerifyQuery>,
) -> Result<Response, AuthError> {
    let token = query.token.unwrap_or_default();
    service.verify_email(&token).await?;

    let base = service.config().frontend_base_url().trim_end_matches('/');
    let location = format!("{base}/verified");
    Ok((StatusCode::FOUND, [(LOCATION, location)]).into_response())
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/forgot",
    request_body = EmailRequest,
    responses(
        (status = 200, description = "Reset email sent if the account exists", body = OkResponse),
        (status = 429, description = "Too many reset requests", body = OkResponse),
    ),
    tag = "auth"
)]
pub async fn forgot(
    Extension(service): Extension<Arc<AuthService>>,
    payload: Option<Json<EmailRequest>>,
) -> Result<Response, AuthError> {
    let Json(request) = payload.ok_or_else(missing_payload)?;
    match service.forgot(&request.email).await {
        Ok(ok) => Ok(Json(ok).into_response()),
        Err(AuthError::RateLimited) => {
            Ok((StatusCode::TOO_MANY_REQUESTS, Json(OkResponse { ok: false })).into_response())
        }
        Err(err) => Err(err),
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/reset",
    request_body = ResetPasswordRequest,
    responses(
        (status = 200, description = "Password changed, all sessions revoked", body = OkResponse),
        (status = 400, description = "Invalid or expired token", body = ErrorResponse),
    ),
    tag = "auth"
)]
pub async fn reset(
    Extension(service): Extension<Arc<AuthService>>,
    payload: Option<Json<ResetPasswordRequest>>,
) -> Result<Json<OkResponse>, AuthError> {
    let Json(request) = payload.ok_or_else(missing_payload)?;
    Ok(Json(
        service
            .reset_password(&request.token, &request.password)
            .await?,
    ))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/resend",
    request_body = EmailRequest,
    responses(
        (status = 200, description = "Verification email re-sent when applicable", body = OkResponse),
    ),
    tag = "auth"
)]
pub async fn resend(
    Extension(service): Extension<Arc<AuthService>>,
    payload: Option<Json<EmailRequest>>,
) -> Result<Json<OkResponse>, AuthError> {
    let Json(request) = payload.ok_or_else(missing_payload)?;
    Ok(Json(service.resend_verification(&request.email).await?))
}
