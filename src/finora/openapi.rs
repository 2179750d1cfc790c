use utoipa::{
    Modify, OpenApi,
    openapi::{
        Contact, InfoBuilder, License,
        security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    },
};

use super::handlers::{admin, auth, health};
use crate::auth::types::{
    EmailRequest, ErrorResponse, LoginRequest, LoginResponse, LogoutRequest, OkResponse,
    PublicUser, RefreshRequest, RefreshResponse, RegisterRequest, ResetPasswordRequest,
};
use crate::store::Role;

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        auth::register,
        auth::login,
        auth::refresh,
        auth::logout,
        auth::verify,
        auth::forgot,
        auth::reset,
        auth::resend,
        admin::unlock_user,
    ),
    components(schemas(
        health::Health,
        RegisterRequest,
        LoginRequest,
        RefreshRequest,
        LogoutRequest,
        EmailRequest,
        ResetPasswordRequest,
        PublicUser,
        LoginResponse,
        RefreshResponse,
        OkResponse,
        ErrorResponse,
        Role,
    )),
    modifiers(&BearerAuth),
    tags(
        (name = "auth", description = "Registration, login, sessions and password recovery"),
        (name = "admin", description = "Administrative account actions"),
        (name = "health", description = "Liveness and build information"),
    )
)]
struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

/// The `OpenAPI` document served at `/openapi.json`, with Cargo metadata as info.
#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let mut doc = ApiDoc::openapi();

    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();
    info.contact = cargo_contact();
    info.license = cargo_license();
    doc.info = info;

    doc
}

fn cargo_contact() -> Option<Contact> {
    // Cargo authors are `:` separated and may include "Name <email>".
    let authors = env!("CARGO_PKG_AUTHORS");
    let primary = authors.split(':').next().map(str::trim)?;
    if primary.is_empty() {
        return None;
    }

    let (name, email) = parse_author(primary);
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    match author.split_once('<') {
        Some((name, rest)) => {
            let email = rest.trim_end_matches('>').trim();
            (optional_str(name.trim()), optional_str(email))
        }
        None => (optional_str(author), None),
    }
}

fn optional_str(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}
