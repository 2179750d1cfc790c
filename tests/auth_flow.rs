use anyhow::{Context, Result};
use argon2::Params;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header},
};
use finora::auth::{
    AuthConfig, AuthService, Collaborators, CredentialHasher, SecretStore, secrets::DEFAULT_GRACE,
};
use finora::finora::router;
use finora::store::{MemoryCounters, MemoryStore, RecordingMailer, Role, mailer::extract_token};
use secrecy::SecretString;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

const PASSWORD: &str = "Secret123";

struct App {
    router: Router,
    store: Arc<MemoryStore>,
    mailer: Arc<RecordingMailer>,
}

fn app() -> Result<App> {
    let store = Arc::new(MemoryStore::new());
    let mailer = Arc::new(RecordingMailer::new());
    let secrets = Arc::new(SecretStore::new(DEFAULT_GRACE));
    secrets.rotate_secret("0123456789abcdef0123456789abcdef")?;

    let config = AuthConfig::new(
        "https://api.finora.test".to_string(),
        "https://app.finora.test".to_string(),
        SecretString::from("refresh-pepper"),
    );
    let collaborators = Collaborators {
        users: store.clone(),
        sessions: store.clone(),
        tokens: store.clone(),
        counters: Arc::new(MemoryCounters::new()),
        mailer: mailer.clone(),
    };
    let hasher = CredentialHasher::with_params(
        Params::new(8, 1, 1, None).map_err(|err| anyhow::anyhow!("{err}"))?,
    );
    let service = Arc::new(AuthService::new(config, secrets, collaborators, hasher));

    Ok(App {
        router: router(service, None),
        store,
        mailer,
    })
}

async fn send(
    app: &App,
    method: Method,
    uri: &str,
    body: Option<Value>,
    bearer: Option<&str>,
) -> Result<(StatusCode, axum::http::HeaderMap, Value)> {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body)?))?,
        None => request.body(Body::empty())?,
    };

    let response = app.router.clone().oneshot(request).await?;
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, headers, json))
}

async fn post(app: &App, uri: &str, body: Value) -> Result<(StatusCode, Value)> {
    let (status, _, json) = send(app, Method::POST, uri, Some(body), None).await?;
    Ok((status, json))
}

async fn register(app: &App, email: &str) -> Result<Value> {
    let (status, body) = post(
        app,
        "/api/v1/auth/register",
        json!({ "email": email, "password": PASSWORD, "name": "Alice" }),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    Ok(body)
}

async fn login(app: &App, email: &str) -> Result<Value> {
    let (status, body) = post(
        app,
        "/api/v1/auth/login",
        json!({ "email": email, "password": PASSWORD }),
    )
    .await?;
    assert_eq!(status, StatusCode::OK, "{body}");
    Ok(body)
}

fn field<'a>(value: &'a Value, name: &str) -> Result<&'a str> {
    value
        .get(name)
        .and_then(Value::as_str)
        .with_context(|| format!("missing {name}"))
}

#[tokio::test]
async fn register_returns_public_user() -> Result<()> {
    let app = app()?;
    let body = register(&app, "Alice@Example.com").await?;

    assert_eq!(field(&body, "email")?, "alice@example.com");
    assert_eq!(body.get("emailVerified"), Some(&Value::Bool(false)));
    assert_eq!(field(&body, "role")?, "USER");
    assert!(body.get("passwordHash").is_none());

    let (status, body) = post(
        &app,
        "/api/v1/auth/register",
        json!({ "email": "alice@example.com", "password": PASSWORD }),
    )
    .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(field(&body, "error")?, "EMAIL_EXISTS");
    Ok(())
}

#[tokio::test]
async fn missing_payload_is_bad_request() -> Result<()> {
    let app = app()?;
    let (status, _, body) = send(&app, Method::POST, "/api/v1/auth/login", None, None).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(field(&body, "error")?, "VALIDATION");
    Ok(())
}

#[tokio::test]
async fn refresh_rotates_and_replay_is_rejected() -> Result<()> {
    let app = app()?;
    register(&app, "alice@example.com").await?;
    let session = login(&app, "alice@example.com").await?;
    assert!(session.get("expiresIn").and_then(Value::as_u64).is_some());

    let request = json!({
        "sessionId": field(&session, "sessionId")?,
        "refreshToken": field(&session, "refreshToken")?,
    });
    let (status, rotated) = post(&app, "/api/v1/auth/refresh", request.clone()).await?;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(field(&rotated, "sessionId")?, field(&session, "sessionId")?);

    let (status, body) = post(&app, "/api/v1/auth/refresh", request).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(field(&body, "error")?, "INVALID_REFRESH_TOKEN");

    // Reuse revoked the family, so the rotated child is gone too.
    let (status, _) = post(
        &app,
        "/api/v1/auth/refresh",
        json!({
            "sessionId": field(&rotated, "sessionId")?,
            "refreshToken": field(&rotated, "refreshToken")?,
        }),
    )
    .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn refresh_with_malformed_session_id_is_invalid_session() -> Result<()> {
    let app = app()?;
    let (status, body) = post(
        &app,
        "/api/v1/auth/refresh",
        json!({ "sessionId": "not-a-uuid", "refreshToken": "x" }),
    )
    .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(field(&body, "error")?, "INVALID_SESSION");
    Ok(())
}

#[tokio::test]
async fn logout_is_idempotent() -> Result<()> {
    let app = app()?;
    register(&app, "alice@example.com").await?;
    let session = login(&app, "alice@example.com").await?;
    let request = json!({ "sessionId": field(&session, "sessionId")? });

    for _ in 0..2 {
        let (status, body) = post(&app, "/api/v1/auth/logout", request.clone()).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true }));
    }

    let (status, body) = post(
        &app,
        "/api/v1/auth/logout",
        json!({ "sessionId": "garbage" }),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "ok": true }));
    Ok(())
}

#[tokio::test]
async fn wrong_password_and_unknown_email_look_the_same() -> Result<()> {
    let app = app()?;
    register(&app, "alice@example.com").await?;

    let (wrong_status, wrong) = post(
        &app,
        "/api/v1/auth/login",
        json!({ "email": "alice@example.com", "password": "Nope12345" }),
    )
    .await?;
    let (unknown_status, unknown) = post(
        &app,
        "/api/v1/auth/login",
        json!({ "email": "nobody@example.com", "password": "Nope12345" }),
    )
    .await?;

    assert_eq!(wrong_status, StatusCode::UNAUTHORIZED);
    assert_eq!(wrong_status, unknown_status);
    assert_eq!(wrong, unknown);
    Ok(())
}

#[tokio::test]
async fn lockout_returns_423_with_retry_after() -> Result<()> {
    let app = app()?;
    register(&app, "alice@example.com").await?;

    for _ in 0..5 {
        let (status, _) = post(
            &app,
            "/api/v1/auth/login",
            json!({ "email": "alice@example.com", "password": "Nope12345" }),
        )
        .await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    let (status, headers, body) = send(
        &app,
        Method::POST,
        "/api/v1/auth/login",
        Some(json!({ "email": "alice@example.com", "password": PASSWORD })),
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::LOCKED);
    assert_eq!(field(&body, "error")?, "ACCOUNT_LOCKED");
    assert!(headers.contains_key(header::RETRY_AFTER));
    Ok(())
}

#[tokio::test]
async fn verify_redirects_to_frontend() -> Result<()> {
    let app = app()?;
    register(&app, "alice@example.com").await?;
    let email = app
        .mailer
        .last_to("alice@example.com")
        .await
        .context("no verification email")?;
    let token = extract_token(&email.html).context("no token")?;

    let (status, headers, _) = send(
        &app,
        Method::GET,
        &format!("/api/v1/auth/verify?token={token}"),
        None,
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::FOUND);
    assert_eq!(
        headers.get(header::LOCATION).and_then(|v| v.to_str().ok()),
        Some("https://app.finora.test/verified")
    );

    let (status, _, body) = send(
        &app,
        Method::GET,
        &format!("/api/v1/auth/verify?token={token}"),
        None,
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(field(&body, "error")?, "INVALID_OR_EXPIRED_TOKEN");

    let session = login(&app, "alice@example.com").await?;
    let user = session.get("user").context("missing user")?;
    assert_eq!(user.get("emailVerified"), Some(&Value::Bool(true)));
    Ok(())
}

#[tokio::test]
async fn forgot_is_rate_limited() -> Result<()> {
    let app = app()?;
    register(&app, "alice@example.com").await?;
    let request = json!({ "email": "alice@example.com" });

    for _ in 0..5 {
        let (status, body) = post(&app, "/api/v1/auth/forgot", request.clone()).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true }));
    }

    let (status, body) = post(&app, "/api/v1/auth/forgot", request).await?;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body, json!({ "ok": false }));
    Ok(())
}

#[tokio::test]
async fn reset_revokes_sessions() -> Result<()> {
    let app = app()?;
    register(&app, "alice@example.com").await?;
    let session = login(&app, "alice@example.com").await?;

    post(
        &app,
        "/api/v1/auth/forgot",
        json!({ "email": "alice@example.com" }),
    )
    .await?;
    let email = app
        .mailer
        .sent()
        .await
        .into_iter()
        .rev()
        .find(|email| email.html.contains("/reset?token="))
        .context("no reset email")?;
    let token = extract_token(&email.html).context("no token")?;

    let (status, body) = post(
        &app,
        "/api/v1/auth/reset",
        json!({ "token": token, "password": "NewSecret456" }),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "ok": true }));

    let (status, _) = post(
        &app,
        "/api/v1/auth/refresh",
        json!({
            "sessionId": field(&session, "sessionId")?,
            "refreshToken": field(&session, "refreshToken")?,
        }),
    )
    .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = post(
        &app,
        "/api/v1/auth/login",
        json!({ "email": "alice@example.com", "password": "NewSecret456" }),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn admin_unlock_requires_admin_role() -> Result<()> {
    let app = app()?;
    let target = register(&app, "alice@example.com").await?;
    let target_id = field(&target, "id")?.to_string();
    let admin = register(&app, "admin@example.com").await?;
    let admin_id: Uuid = field(&admin, "id")?.parse()?;
    let uri = format!("/api/v1/admin/users/{target_id}/unlock");

    let (status, _, body) = send(&app, Method::POST, &uri, None, None).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(field(&body, "error")?, "UNAUTHENTICATED");

    let user_session = login(&app, "alice@example.com").await?;
    let (status, _, body) = send(
        &app,
        Method::POST,
        &uri,
        None,
        Some(field(&user_session, "accessToken")?),
    )
    .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(field(&body, "error")?, "FORBIDDEN");

    assert!(app.store.set_role(admin_id, Role::Admin).await);
    let admin_session = login(&app, "admin@example.com").await?;
    let admin_token = field(&admin_session, "accessToken")?;

    let (status, _, body) = send(&app, Method::POST, &uri, None, Some(admin_token)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "ok": true }));
    assert_eq!(app.store.audit_entries().await.len(), 1);

    let missing = format!("/api/v1/admin/users/{}/unlock", Uuid::new_v4());
    let (status, _, body) = send(&app, Method::POST, &missing, None, Some(admin_token)).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(field(&body, "error")?, "USER_NOT_FOUND");
    Ok(())
}

#[tokio::test]
async fn health_and_openapi_are_served() -> Result<()> {
    let app = app()?;

    let (status, headers, body) = send(&app, Method::GET, "/health", None, None).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.contains_key("x-app"));
    assert!(headers.contains_key("x-request-id"));
    assert_eq!(field(&body, "database")?, "memory");

    let (status, _, doc) = send(&app, Method::GET, "/openapi.json", None, None).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(doc.pointer("/paths/~1api~1v1~1auth~1login").is_some());
    Ok(())
}
