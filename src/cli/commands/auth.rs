use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_FRONTEND_URL: &str = "frontend-url";
pub const ARG_APP_URL: &str = "app-url";
pub const ARG_JWT_SECRET: &str = "jwt-secret";
pub const ARG_REFRESH_PEPPER: &str = "refresh-pepper";
pub const ARG_ACCESS_TTL: &str = "access-ttl";
pub const ARG_REFRESH_TTL_DAYS: &str = "refresh-ttl-days";
pub const ARG_ENVIRONMENT: &str = "environment";
pub const ARG_SECRETS_DIR: &str = "secrets-dir";
pub const ARG_OPENROUTER_API_KEY: &str = "openrouter-api-key";

#[derive(Debug)]
pub struct Options {
    pub frontend_base_url: String,
    pub app_base_url: String,
    /// Left optional here so startup validation can report it alongside
    /// every other problem.
    pub jwt_secret: Option<SecretString>,
    pub refresh_pepper: SecretString,
    pub access_ttl_seconds: u64,
    pub refresh_ttl_days: u64,
    pub environment: String,
    pub secrets_dir: Option<String>,
    pub openrouter_api_key: Option<SecretString>,
}

impl Options {
    /// # Errors
    /// Returns an error if a required argument is missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let string = |id: &str| matches.get_one::<String>(id).cloned();

        Ok(Self {
            frontend_base_url: string(ARG_FRONTEND_URL)
                .context("missing required argument: --frontend-url")?,
            app_base_url: string(ARG_APP_URL).context("missing required argument: --app-url")?,
            jwt_secret: string(ARG_JWT_SECRET).map(SecretString::from),
            refresh_pepper: string(ARG_REFRESH_PEPPER)
                .map(SecretString::from)
                .context("missing required argument: --refresh-pepper")?,
            access_ttl_seconds: matches
                .get_one::<u64>(ARG_ACCESS_TTL)
                .copied()
                .unwrap_or(900),
            refresh_ttl_days: matches
                .get_one::<u64>(ARG_REFRESH_TTL_DAYS)
                .copied()
                .unwrap_or(7),
            environment: string(ARG_ENVIRONMENT).unwrap_or_else(|| "development".to_string()),
            secrets_dir: string(ARG_SECRETS_DIR),
            openrouter_api_key: string(ARG_OPENROUTER_API_KEY).map(SecretString::from),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_url_args(command);
    let command = with_secret_args(command);
    with_ttl_args(command)
}

fn with_url_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_FRONTEND_URL)
                .long(ARG_FRONTEND_URL)
                .help("Frontend base URL used for reset links, redirects and CORS")
                .env("FINORA_FRONTEND_URL")
                .default_value("http://localhost:5173"),
        )
        .arg(
            Arg::new(ARG_APP_URL)
                .long(ARG_APP_URL)
                .help("Public API base URL used for verification links")
                .env("FINORA_APP_URL")
                .default_value("http://localhost:8080"),
        )
        .arg(
            Arg::new(ARG_ENVIRONMENT)
                .long(ARG_ENVIRONMENT)
                .help("Deployment environment name, e.g. development or production")
                .env("FINORA_ENV")
                .default_value("development"),
        )
}

fn with_secret_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_JWT_SECRET)
                .long(ARG_JWT_SECRET)
                .help("Access token signing secret (at least 32 characters)")
                .env("FINORA_JWT_SECRET")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_REFRESH_PEPPER)
                .long(ARG_REFRESH_PEPPER)
                .help("Server-side pepper mixed into refresh and one-time token hashes")
                .env("FINORA_REFRESH_PEPPER")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_SECRETS_DIR)
                .long(ARG_SECRETS_DIR)
                .help("Directory persisting signing secret versions across restarts")
                .env("FINORA_SECRETS_DIR"),
        )
        .arg(
            Arg::new(ARG_OPENROUTER_API_KEY)
                .long(ARG_OPENROUTER_API_KEY)
                .help("OpenRouter API key for downstream services")
                .env("FINORA_OPENROUTER_API_KEY")
                .hide_env_values(true),
        )
}

fn with_ttl_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ACCESS_TTL)
                .long(ARG_ACCESS_TTL)
                .help("Access token TTL in seconds")
                .env("FINORA_ACCESS_TTL")
                .default_value("900")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_REFRESH_TTL_DAYS)
                .long(ARG_REFRESH_TTL_DAYS)
                .help("Refresh session TTL in days")
                .env("FINORA_REFRESH_TTL_DAYS")
                .default_value("7")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}
