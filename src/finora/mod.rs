//! HTTP surface: router, middleware stack and server startup.

use anyhow::{Context, Result, anyhow};
use axum::{
    Extension, Json, Router,
    body::Body,
    extract::MatchedPath,
    http::{
        HeaderName, HeaderValue, Method, Request,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    routing::{get, post},
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;
use url::Url;

use crate::auth::{AuthConfig, AuthService, Collaborators, CredentialHasher, SecretStore, spawn_sweeper};
use crate::store::{OutboxMailer, PgStore};

pub mod handlers;
mod openapi;

pub use openapi::openapi;

/// Routes plus the request-id and tracing layers, without CORS.
///
/// `pool` backs the database check in `/health`; `None` reports `memory`.
#[must_use]
pub fn router(service: Arc<AuthService>, pool: Option<PgPool>) -> Router {
    let api = Router::new()
        .route("/api/v1/auth/register", post(handlers::auth::register))
        .route("/api/v1/auth/login", post(handlers::auth::login))
        .route("/api/v1/auth/refresh", post(handlers::auth::refresh))
        .route("/api/v1/auth/logout", post(handlers::auth::logout))
        .route("/api/v1/auth/verify", get(handlers::auth::verify))
        .route("/api/v1/auth/forgot", post(handlers::auth::forgot))
        .route("/api/v1/auth/reset", post(handlers::auth::reset))
        .route("/api/v1/auth/resend", post(handlers::auth::resend))
        .route(
            "/api/v1/admin/users/:id/unlock",
            post(handlers::admin::unlock_user),
        )
        .route("/health", get(handlers::health).options(handlers::health))
        .route("/openapi.json", get(|| async { Json(openapi()) }));

    let app = api.layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(Extension(service)),
    );

    match pool {
        Some(pool) => app.layer(Extension(pool)),
        None => app,
    }
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(
    port: u16,
    dsn: String,
    secrets: Arc<SecretStore>,
    auth_config: AuthConfig,
) -> Result<()> {
    // Connect to database
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    let store = Arc::new(PgStore::new(pool.clone()));
    let collaborators = Collaborators {
        users: store.clone(),
        sessions: store.clone(),
        tokens: store.clone(),
        counters: store.clone(),
        mailer: Arc::new(OutboxMailer::new(pool.clone())),
    };

    // Prunes expired sessions, rotated sessions past retention, tokens and counters.
    let sweeper = spawn_sweeper(store.clone(), store.clone(), store, &auth_config);

    let frontend_origin = frontend_origin(auth_config.frontend_base_url())?;
    let service = Arc::new(AuthService::new(
        auth_config,
        secrets,
        collaborators,
        CredentialHasher::new(),
    ));

    let cors = CorsLayer::new()
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(AllowOrigin::exact(frontend_origin));

    let app = router(service, Some(pool)).layer(cors);

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {err}");
            }
            info!("Gracefully shutdown");
        })
        .await?;

    sweeper.abort();

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

fn frontend_origin(frontend_base_url: &str) -> Result<HeaderValue> {
    let parsed = Url::parse(frontend_base_url)
        .with_context(|| format!("Invalid frontend base URL: {frontend_base_url}"))?;
    let host = parsed.host_str().ok_or_else(|| {
        anyhow!("Frontend base URL must include a valid host: {frontend_base_url}")
    })?;
    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    let origin = format!("{}://{}{}", parsed.scheme(), host, port);
    HeaderValue::from_str(&origin).context("Failed to build frontend origin header")
}
