#![allow(dead_code)]

use phoenix_grc_backend::config::Config;
use phoenix_grc_backend::crypto::{self, CryptoVault};
use phoenix_grc_backend::features::auth::mfa::MfaService;
use phoenix_grc_backend::features::auth::service::AuthService;
use phoenix_grc_backend::features::sso::provisioning::ProvisioningEngine;
use phoenix_grc_backend::features::users::service::UserService;
use sqlx::PgPool;
use uuid::Uuid;

pub const TEST_KEY_HEX: &str =
    "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

pub fn test_config() -> Config {
    Config {
        database_url: String::new(),
        listen_port: 0,
        encryption_key: TEST_KEY_HEX.to_string(),
        jwt_secret: "integration-test-secret".to_string(),
        token_lifespan_hours: 24,
        app_root_url: "https://grc.example.com".to_string(),
        totp_issuer: "Phoenix GRC Test".to_string(),
        google_client_id: None,
        google_client_secret: None,
        github_client_id: None,
        github_client_secret: None,
        sso_allow_user_creation: false,
        sso_default_org_id: None,
    }
}

pub fn vault() -> CryptoVault {
    CryptoVault::from_hex_key(TEST_KEY_HEX).expect("test vault key")
}

#[allow(dead_code)]
pub struct TestServices {
    pub config: Config,
    pub vault: CryptoVault,
    pub users: UserService,
    pub auth: AuthService,
    pub mfa: MfaService,
}

pub fn setup_services(pool: PgPool) -> TestServices {
    setup_services_with(pool, test_config())
}

pub fn setup_services_with(pool: PgPool, config: Config) -> TestServices {
    let vault = vault();
    let users = UserService::new(pool.clone());
    let auth = AuthService::new(pool.clone(), config.clone(), vault.clone(), users.clone());
    let mfa = MfaService::new(pool, vault.clone(), config.totp_issuer.clone());
    TestServices {
        config,
        vault,
        users,
        auth,
        mfa,
    }
}

#[allow(dead_code)]
pub fn provisioning_engine(pool: &PgPool, config: &Config) -> ProvisioningEngine {
    ProvisioningEngine::new(UserService::new(pool.clone()), config)
}

pub async fn seed_org(pool: &PgPool, name: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO organizations (id, name) VALUES ($1, $2)")
        .bind(id)
        .bind(name)
        .execute(pool)
        .await
        .expect("seed organization");
    id
}

pub async fn seed_user(
    pool: &PgPool,
    org_id: Option<Uuid>,
    email: &str,
    password: &str,
    role: &str,
    is_active: bool,
) -> Uuid {
    let id = Uuid::new_v4();
    let hash = crypto::hash_password(password).expect("hash test password");
    sqlx::query(
        "INSERT INTO users (id, organization_id, email, name, password_hash, role, is_active) \
         VALUES ($1, $2, lower($3), $4, $5, $6, $7)",
    )
    .bind(id)
    .bind(org_id)
    .bind(email)
    .bind(email.split('@').next().unwrap_or("user"))
    .bind(&hash)
    .bind(role)
    .bind(is_active)
    .execute(pool)
    .await
    .expect("seed user");
    id
}
