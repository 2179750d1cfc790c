pub mod admin;
pub mod auth;
pub mod health;

pub use self::health::health;

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode, header::AUTHORIZATION, header::RETRY_AFTER},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use tracing::error;

use crate::auth::{AuthError, types::ErrorResponse};

impl AuthError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::EmailExists => StatusCode::CONFLICT,
            Self::Validation(_) | Self::InvalidOrExpiredToken => StatusCode::BAD_REQUEST,
            Self::InvalidCredentials
            | Self::InvalidSession
            | Self::SessionExpired
            | Self::InvalidRefreshToken => StatusCode::UNAUTHORIZED,
            Self::AccountLocked { .. } => StatusCode::LOCKED,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::UserNotFound => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Internal(err) => {
                error!("Internal auth error: {err:#}");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let mut headers = HeaderMap::new();
        if let Self::AccountLocked { until } = &self {
            let seconds = (*until - Utc::now()).num_seconds().max(0);
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                headers.insert(RETRY_AFTER, value);
            }
        }

        let body = ErrorResponse {
            error: self.kind().to_string(),
            message,
        };
        (status, headers, Json(body)).into_response()
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(AuthError::EmailExists.status(), StatusCode::CONFLICT);
        assert_eq!(AuthError::InvalidCredentials.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AuthError::AccountLocked { until: Utc::now() }.status(),
            StatusCode::LOCKED
        );
        assert_eq!(AuthError::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(AuthError::InvalidOrExpiredToken.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AuthError::Internal(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn locked_response_has_retry_after() {
        let until = Utc::now() + chrono::Duration::minutes(10);
        let response = AuthError::AccountLocked { until }.into_response();
        assert_eq!(response.status(), StatusCode::LOCKED);
        assert!(response.headers().contains_key(RETRY_AFTER));
    }

    #[test]
    fn bearer_token_parses_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));
    }
}
