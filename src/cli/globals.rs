use secrecy::SecretString;

/// Secrets the server consumes after startup validation.
#[derive(Debug, Clone)]
pub struct GlobalArgs {
    pub jwt_secret: SecretString,
    pub refresh_pepper: SecretString,
}

impl GlobalArgs {
    #[must_use]
    pub fn new(jwt_secret: SecretString, refresh_pepper: SecretString) -> Self {
        Self {
            jwt_secret,
            refresh_pepper,
        }
    }
}
