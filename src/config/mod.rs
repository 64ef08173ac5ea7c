use dotenv::dotenv;
use serde::Deserialize;
use std::env;
use uuid::Uuid;

/// Process configuration, read once at startup.
///
/// Everything the auth core consumes from the environment lives here: the
/// master encryption key, the token signing secret, the application root URL
/// used to build redirect URIs, and the global OAuth2 client credentials.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Master field-encryption key as 64 hex chars (32 bytes). Absence or a
    /// malformed value is fatal at startup.
    pub encryption_key: String,

    pub jwt_secret: String,
    #[serde(default = "default_token_lifespan_hours")]
    pub token_lifespan_hours: i64,

    /// External root of the application, e.g. `https://grc.example.com`.
    /// All OAuth redirect URIs and SAML SP URLs are derived from it.
    pub app_root_url: String,

    #[serde(default = "default_totp_issuer")]
    pub totp_issuer: String,

    // Process-wide OAuth2 clients (the "global" IdP). Never persisted as
    // identity_providers rows.
    #[serde(default)]
    pub google_client_id: Option<String>,
    #[serde(default)]
    pub google_client_secret: Option<String>,
    #[serde(default)]
    pub github_client_id: Option<String>,
    #[serde(default)]
    pub github_client_secret: Option<String>,

    /// Whether a federated identity with no matching user may create one.
    #[serde(default)]
    pub sso_allow_user_creation: bool,
    /// Tenant that globally provisioned users land in; unattached when unset.
    #[serde(default)]
    pub sso_default_org_id: Option<Uuid>,
}

fn default_listen_port() -> u16 {
    8080
}

fn default_token_lifespan_hours() -> i64 {
    24
}

fn default_totp_issuer() -> String {
    "Phoenix GRC".to_string()
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        resolve_database_url_from_env();
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::Environment::with_prefix("PHOENIX"));

        builder.build()?.try_deserialize()
    }

    /// Seconds a session token stays valid.
    pub fn token_lifespan_secs(&self) -> i64 {
        self.token_lifespan_hours * 3600
    }

    /// Cookies are marked Secure only when the app is actually served over TLS.
    pub fn serves_tls(&self) -> bool {
        self.app_root_url.starts_with("https://")
    }
}

fn resolve_database_url_from_env() {
    if env::var("PHOENIX_DATABASE_URL").is_ok() {
        return;
    }
    if let Ok(database_url) = env::var("DATABASE_URL") {
        env::set_var("PHOENIX_DATABASE_URL", database_url);
    }
}

pub fn init() {
    dotenv().ok();
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        database_url: "postgres://localhost/phoenix".into(),
        listen_port: default_listen_port(),
        encryption_key: "00".repeat(32),
        jwt_secret: "test-signing-secret".into(),
        token_lifespan_hours: 24,
        app_root_url: "https://grc.example.com".into(),
        totp_issuer: default_totp_issuer(),
        google_client_id: None,
        google_client_secret: None,
        github_client_id: None,
        github_client_secret: None,
        sso_allow_user_creation: false,
        sso_default_org_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifespan_converts_to_seconds() {
        let cfg = test_config();
        assert_eq!(cfg.token_lifespan_secs(), 86_400);
    }

    #[test]
    fn tls_detection_follows_root_url() {
        let mut cfg = test_config();
        assert!(cfg.serves_tls());
        cfg.app_root_url = "http://localhost:8080".into();
        assert!(!cfg.serves_tls());
    }
}
