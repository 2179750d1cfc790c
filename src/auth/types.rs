//! Request/response types for auth endpoints.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::store::{Role, User};

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub session_id: String,
    pub refresh_token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LogoutRequest {
    pub session_id: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub password: String,
}

#[derive(Deserialize, Debug, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct VerifyQuery {
    pub token: Option<String>,
}

/// User fields safe to return to clients; never includes the hash.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub email_verified: bool,
    pub role: Role,
}

impl From<&User> for PublicUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            name: user.name.clone(),
            email_verified: user.email_verified,
            role: user.role,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: String,
    pub expires_in: u64,
    pub refresh_token: String,
    pub session_id: Uuid,
    pub user: PublicUser,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub session_id: Uuid,
    pub expires_in: u64,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct OkResponse {
    pub ok: bool,
}

impl OkResponse {
    pub const OK: Self = Self { ok: true };
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};

    #[test]
    fn refresh_request_uses_camel_case() -> Result<()> {
        let request: RefreshRequest = serde_json::from_value(serde_json::json!({
            "sessionId": "abc",
            "refreshToken": "def",
        }))?;
        assert_eq!(request.session_id, "abc");
        assert_eq!(request.refresh_token, "def");
        Ok(())
    }

    #[test]
    fn register_name_is_optional() -> Result<()> {
        let request: RegisterRequest = serde_json::from_value(serde_json::json!({
            "email": "a@example.com",
            "password": "Secret123",
        }))?;
        assert!(request.name.is_none());
        Ok(())
    }

    #[test]
    fn login_response_serializes_camel_case() -> Result<()> {
        let response = LoginResponse {
            access_token: "jwt".to_string(),
            expires_in: 900,
            refresh_token: "r".to_string(),
            session_id: Uuid::nil(),
            user: PublicUser {
                id: Uuid::nil(),
                email: "a@example.com".to_string(),
                name: None,
                email_verified: false,
                role: Role::User,
            },
        };
        let value = serde_json::to_value(&response)?;
        assert_eq!(value.get("expiresIn").and_then(serde_json::Value::as_u64), Some(900));
        let user = value.get("user").context("missing user")?;
        assert_eq!(user.get("emailVerified"), Some(&serde_json::Value::Bool(false)));
        assert_eq!(user.get("role").and_then(serde_json::Value::as_str), Some("USER"));
        assert!(user.get("passwordHash").is_none());
        Ok(())
    }
}
