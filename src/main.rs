use axum::{routing::get, Router};
use phoenix_grc_backend::crypto::CryptoVault;
use phoenix_grc_backend::features::auth::mfa::MfaService;
use phoenix_grc_backend::features::auth::routes::MfaState;
use phoenix_grc_backend::features::auth::service::AuthService;
use phoenix_grc_backend::features::sso::provisioning::ProvisioningEngine;
use phoenix_grc_backend::features::sso::routes::SsoState;
use phoenix_grc_backend::features::sso::saml::SamlBroker;
use phoenix_grc_backend::features::users::service::UserService;
use phoenix_grc_backend::{config, features, middleware};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    config::init();
    let config = config::Config::from_env().expect("failed to load configuration");

    // A missing or malformed master key is fatal: nothing downstream can
    // read or write stored secrets without it.
    let vault = CryptoVault::from_hex_key(&config.encryption_key)
        .expect("PHOENIX_ENCRYPTION_KEY must be 64 hex chars");

    let pool = PgPoolOptions::new()
        .max_connections(50)
        .min_connections(2)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .idle_timeout(std::time::Duration::from_secs(600))
        .max_lifetime(std::time::Duration::from_secs(1800))
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");

    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("failed to run migrations");

    let config_arc = Arc::new(config.clone());

    let users = UserService::new(pool.clone());
    let auth = AuthService::new(pool.clone(), config.clone(), vault.clone(), users.clone());
    let mfa = MfaService::new(pool.clone(), vault.clone(), config.totp_issuer.clone());
    let engine = ProvisioningEngine::new(users.clone(), &config);

    // Outbound calls to IdPs are bounded; a hung provider must not pin a
    // request handler past this.
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .build()
        .expect("failed to build HTTP client");

    let sso_state = SsoState {
        pool: pool.clone(),
        config: config_arc.clone(),
        vault: vault.clone(),
        users: users.clone(),
        engine,
        saml: SamlBroker::default(),
        http,
    };
    let mfa_state = MfaState {
        auth: auth.clone(),
        mfa,
    };

    let api_v1 = Router::new()
        .merge(features::auth::routes::me_routes().with_state(auth.clone()))
        .nest(
            "/users/me/2fa",
            features::auth::routes::mfa_routes().with_state(mfa_state),
        )
        .merge(
            features::users::routes::users_routes()
                .with_state(users.clone())
                .layer(axum::middleware::from_fn(middleware::auth::require_admin)),
        )
        .layer(axum::middleware::from_fn(middleware::auth::auth_middleware));

    // Credential endpoints share an attempt budget per client; the throttle
    // is layered on the auth router below rather than matching paths
    // globally.
    let throttle = Arc::new(middleware::rate_limit::LoginThrottle::new(
        5,
        std::time::Duration::from_secs(15 * 60),
    ));
    tokio::spawn(middleware::rate_limit::sweep_loop(
        throttle.clone(),
        std::time::Duration::from_secs(60),
    ));

    let cors_origins: Vec<axum::http::HeaderValue> = [
        config.app_root_url.trim_end_matches('/').to_string(),
        "http://localhost:3000".to_string(),
        "http://127.0.0.1:3000".to_string(),
    ]
    .iter()
    .filter_map(|origin| origin.parse().ok())
    .collect();

    let app = Router::new()
        .route("/health", get(health_check))
        .nest(
            "/auth",
            features::auth::routes::public_auth_routes()
                .with_state(auth.clone())
                .layer(axum::middleware::from_fn(
                    middleware::rate_limit::throttle_middleware,
                ))
                .layer(axum::Extension(throttle)),
        )
        .merge(features::sso::routes::sso_routes().with_state(sso_state))
        .nest("/api/v1", api_v1)
        .layer(tower_cookies::CookieManagerLayer::new())
        .layer(axum::Extension(config_arc))
        .layer(
            CorsLayer::new()
                .allow_origin(cors_origins)
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::PUT,
                    axum::http::Method::DELETE,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers([
                    axum::http::header::CONTENT_TYPE,
                    axum::http::header::AUTHORIZATION,
                    axum::http::header::ACCEPT,
                ])
                .allow_credentials(true),
        );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    tracing::info!(%addr, "server listening");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind listen address");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("server error");
}

async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "OK",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
