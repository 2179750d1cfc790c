//! Maps parsed CLI arguments to the action the binary runs.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::auth;
use anyhow::{Context, Result};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;

    let auth_opts = auth::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        dsn,
        frontend_base_url: auth_opts.frontend_base_url,
        app_base_url: auth_opts.app_base_url,
        jwt_secret: auth_opts.jwt_secret,
        refresh_pepper: auth_opts.refresh_pepper,
        access_ttl_seconds: auth_opts.access_ttl_seconds,
        refresh_ttl_days: auth_opts.refresh_ttl_days,
        environment: auth_opts.environment,
        secrets_dir: auth_opts.secrets_dir,
        openrouter_api_key: auth_opts.openrouter_api_key,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_server_action() {
        temp_env::with_vars(
            [
                ("FINORA_DSN", Some("postgres://finora@db.internal:5432/finora")),
                ("FINORA_REFRESH_PEPPER", Some("pepper")),
                ("FINORA_PORT", Some("8443")),
                ("FINORA_JWT_SECRET", None),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["finora"]);
                let Ok(Action::Server(args)) = handler(&matches) else {
                    panic!("expected a server action");
                };
                assert_eq!(args.port, 8443);
                assert_eq!(args.dsn, "postgres://finora@db.internal:5432/finora");
                assert!(args.jwt_secret.is_none());
            },
        );
    }
}
