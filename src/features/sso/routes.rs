use crate::config::Config;
use crate::crypto::{self, CryptoVault};
use crate::features::auth::jwt;
use crate::features::auth::service::AuthError;
use crate::features::sso::models::{
    AttributeMap, ExternalIdentity, IdentityProvider, IdpType, OrgBinding, PublicIdpEntry,
    OauthIdpConfig, SamlIdpConfig,
};
use crate::features::sso::oauth::{self, ClientCredentials, OAuthProvider};
use crate::features::sso::provisioning::ProvisioningEngine;
use crate::features::sso::saml::{self, SamlBroker, SpExpectations};
use crate::features::users::service::UserService;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::Deserialize;
use sqlx::PgPool;
use std::str::FromStr;
use std::sync::Arc;
use tower_cookies::{Cookie, Cookies};
use uuid::Uuid;

const SAML_RELAY_COOKIE: &str = "saml_relay_state";
const STATE_COOKIE_MAX_AGE_SECS: i64 = 600;

/// The `{idp}` path segment selecting process-wide OAuth2 credentials.
const GLOBAL_IDP_SEGMENT: &str = "global";

#[derive(Clone)]
pub struct SsoState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub vault: CryptoVault,
    pub users: UserService,
    pub engine: ProvisioningEngine,
    pub saml: SamlBroker,
    pub http: reqwest::Client,
}

pub fn sso_routes() -> Router<SsoState> {
    Router::new()
        .route("/auth/saml/:idp_id/login", get(saml_login_handler))
        .route("/auth/saml/:idp_id/metadata", get(saml_metadata_handler))
        .route("/auth/saml/:idp_id/acs", post(saml_acs_handler))
        .route("/auth/oauth2/:provider/:idp/login", get(oauth_login_handler))
        .route("/auth/oauth2/:provider/:idp/callback", get(oauth_callback_handler))
        .route("/api/public/social-identity-providers", get(discovery_handler))
}

/// 302 with an explicit Location, the status every browser-facing hop in
/// these flows uses.
fn found(location: String) -> Result<Response, AuthError> {
    let value = HeaderValue::from_str(&location)
        .map_err(|_| AuthError::Internal("invalid redirect target".into()))?;
    let mut res = StatusCode::FOUND.into_response();
    res.headers_mut().insert(header::LOCATION, value);
    Ok(res)
}

/// Where the frontend picks the session up. The token travels in the query
/// for its sole consumer, which strips it from the URL on receipt.
fn frontend_callback(
    config: &Config,
    path: &str,
    token: &str,
    provider: &str,
) -> Result<String, AuthError> {
    let base = format!("{}{}", config.app_root_url.trim_end_matches('/'), path);
    let mut url = reqwest::Url::parse(&base)
        .map_err(|_| AuthError::Internal("invalid app root URL".into()))?;
    url.query_pairs_mut()
        .append_pair("token", token)
        .append_pair("sso_success", "true")
        .append_pair("provider", provider);
    Ok(url.into())
}

fn state_cookie(config: &Config, name: &'static str, value: String) -> Cookie<'static> {
    Cookie::build((name, value))
        .http_only(true)
        .path("/")
        .secure(config.serves_tls())
        .same_site(tower_cookies::cookie::SameSite::Lax)
        .max_age(tower_cookies::cookie::time::Duration::seconds(
            STATE_COOKIE_MAX_AGE_SECS,
        ))
        .build()
}

fn clear_cookie(cookies: &Cookies, name: &'static str) {
    let mut cookie = Cookie::new(name, "");
    cookie.set_path("/");
    cookie.set_max_age(tower_cookies::cookie::time::Duration::seconds(0));
    cookies.add(cookie);
}

async fn load_active_idp(
    pool: &PgPool,
    idp_id: Uuid,
    expected: IdpType,
) -> Result<IdentityProvider, AuthError> {
    let idp = sqlx::query_as::<_, IdentityProvider>(
        "SELECT * FROM identity_providers WHERE id = $1 AND idp_type = $2 AND is_active = TRUE",
    )
    .bind(idp_id)
    .bind(expected.as_str())
    .fetch_optional(pool)
    .await?
    .ok_or(AuthError::NotFound)?;
    Ok(idp)
}

fn decrypt_config<T: serde::de::DeserializeOwned>(
    vault: &CryptoVault,
    idp: &IdentityProvider,
) -> Result<T, AuthError> {
    let plaintext = vault.decrypt_str(&idp.config_enc)?;
    serde_json::from_str(&plaintext)
        .map_err(|_| AuthError::Internal("undecodable IdP configuration".into()))
}

// ---------------------------------------------------------------------------
// SAML
// ---------------------------------------------------------------------------

async fn saml_login_handler(
    State(state): State<SsoState>,
    Path(idp_id): Path<Uuid>,
    cookies: Cookies,
) -> Result<Response, AuthError> {
    let idp = load_active_idp(&state.pool, idp_id, IdpType::Saml).await?;
    let cfg: SamlIdpConfig = decrypt_config(&state.vault, &idp)?;

    let sp_entity = saml::sp_entity_id(&state.config.app_root_url, idp_id);
    let acs = saml::acs_url(&state.config.app_root_url, idp_id);

    let (request_id, xml) = saml::build_authn_request(&sp_entity, &acs, &cfg.idp_sso_url);
    state.saml.register_request(&request_id);

    let relay_state = saml::relay_state_nonce();
    cookies.add(state_cookie(&state.config, SAML_RELAY_COOKIE, relay_state.clone()));

    let payload = saml::encode_redirect_payload(&xml)?;
    let target = saml::redirect_url(&cfg.idp_sso_url, &payload, &relay_state)?;

    tracing::info!(idp = %idp_id, "saml login initiated");
    found(target)
}

async fn saml_metadata_handler(
    State(state): State<SsoState>,
    Path(idp_id): Path<Uuid>,
) -> Result<Response, AuthError> {
    // Metadata is served for any configured SAML IdP, active or not, so the
    // IdP side can be set up first.
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM identity_providers WHERE id = $1 AND idp_type = 'saml')",
    )
    .bind(idp_id)
    .fetch_one(&state.pool)
    .await?;
    if !exists {
        return Err(AuthError::NotFound);
    }

    let sp_entity = saml::sp_entity_id(&state.config.app_root_url, idp_id);
    let acs = saml::acs_url(&state.config.app_root_url, idp_id);
    let xml = saml::metadata_xml(&sp_entity, &acs);

    Ok((
        [(header::CONTENT_TYPE, "application/samlmetadata+xml")],
        xml,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct AcsForm {
    #[serde(rename = "SAMLResponse")]
    saml_response: String,
    #[serde(rename = "RelayState")]
    relay_state: Option<String>,
}

async fn saml_acs_handler(
    State(state): State<SsoState>,
    Path(idp_id): Path<Uuid>,
    cookies: Cookies,
    Form(form): Form<AcsForm>,
) -> Result<Response, AuthError> {
    let expected_relay = cookies.get(SAML_RELAY_COOKIE).map(|c| c.value().to_string());
    clear_cookie(&cookies, SAML_RELAY_COOKIE);
    match (expected_relay, form.relay_state.as_deref()) {
        (Some(expected), Some(got)) if expected == got => {}
        _ => {
            tracing::warn!(idp = %idp_id, "saml relay state mismatch");
            return Err(AuthError::BadCredentials);
        }
    }

    let idp = load_active_idp(&state.pool, idp_id, IdpType::Saml).await?;
    let cfg: SamlIdpConfig = decrypt_config(&state.vault, &idp)?;
    let attribute_map = AttributeMap::from_stored(idp.attribute_map.as_ref());

    let decoded = saml::decode_b64_loose(&form.saml_response)
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or(AuthError::BadCredentials)?;

    let sp_entity = saml::sp_entity_id(&state.config.app_root_url, idp_id);
    let acs = saml::acs_url(&state.config.app_root_url, idp_id);
    let verified = saml::validate_response(
        &decoded,
        &cfg,
        &attribute_map,
        &SpExpectations {
            acs_url: &acs,
            sp_entity_id: &sp_entity,
        },
        &state.saml,
    )?;

    let identity = ExternalIdentity {
        provider: "saml".to_string(),
        subject_id: verified.subject_id,
        email: verified.email,
        display_name: verified.display_name,
    };
    let user = state
        .engine
        .provision(&identity, OrgBinding::Org(idp.organization_id))
        .await?;

    let (token, _) = jwt::issue(&user, &state.config)?;
    tracing::info!(user_id = %user.id, idp = %idp_id, "saml login completed");
    found(frontend_callback(&state.config, "/saml/callback", &token, "saml")?)
}

// ---------------------------------------------------------------------------
// OAuth2
// ---------------------------------------------------------------------------

/// Resolve client credentials and the tenant binding for a `{provider}/{idp}`
/// path pair. `global` selects process configuration.
async fn resolve_oauth_client(
    state: &SsoState,
    provider: OAuthProvider,
    idp_ref: &str,
) -> Result<(ClientCredentials, OrgBinding), AuthError> {
    if idp_ref == GLOBAL_IDP_SEGMENT {
        let (id, secret) = match provider {
            OAuthProvider::Google => (
                state.config.google_client_id.clone(),
                state.config.google_client_secret.clone(),
            ),
            OAuthProvider::Github => (
                state.config.github_client_id.clone(),
                state.config.github_client_secret.clone(),
            ),
        };
        let client_id = id.filter(|v| !v.is_empty()).ok_or(AuthError::NotFound)?;
        let client_secret = secret.filter(|v| !v.is_empty()).ok_or(AuthError::NotFound)?;
        return Ok((
            ClientCredentials {
                client_id,
                client_secret,
            },
            OrgBinding::Global,
        ));
    }

    let idp_id = Uuid::parse_str(idp_ref).map_err(|_| AuthError::NotFound)?;
    let idp = load_active_idp(&state.pool, idp_id, provider.idp_type()).await?;
    let cfg: OauthIdpConfig = decrypt_config(&state.vault, &idp)?;
    Ok((
        ClientCredentials {
            client_id: cfg.client_id,
            client_secret: cfg.client_secret,
        },
        OrgBinding::Org(idp.organization_id),
    ))
}

fn oauth_redirect_uri(config: &Config, provider: OAuthProvider, idp_ref: &str) -> String {
    format!(
        "{}/auth/oauth2/{}/{}/callback",
        config.app_root_url.trim_end_matches('/'),
        provider.slug(),
        idp_ref
    )
}

async fn oauth_login_handler(
    State(state): State<SsoState>,
    Path((provider, idp_ref)): Path<(String, String)>,
    cookies: Cookies,
) -> Result<Response, AuthError> {
    let provider = OAuthProvider::from_str(&provider).map_err(|_| AuthError::NotFound)?;
    let (creds, _binding) = resolve_oauth_client(&state, provider, &idp_ref).await?;

    // 128-bit CSRF state, bound to the browser through the cookie.
    let oauth_state = crypto::random_token(16);
    cookies.add(state_cookie(
        &state.config,
        provider.state_cookie_name(),
        oauth_state.clone(),
    ));

    let redirect_uri = oauth_redirect_uri(&state.config, provider, &idp_ref);
    let target =
        oauth::authorize_redirect_url(provider, &creds.client_id, &redirect_uri, &oauth_state)?;

    tracing::info!(provider = provider.slug(), idp = %idp_ref, "oauth login initiated");
    found(target)
}

#[derive(Debug, Deserialize)]
struct OAuthCallbackQuery {
    code: Option<String>,
    state: Option<String>,
}

async fn oauth_callback_handler(
    State(state): State<SsoState>,
    Path((provider, idp_ref)): Path<(String, String)>,
    Query(query): Query<OAuthCallbackQuery>,
    cookies: Cookies,
) -> Result<Response, AuthError> {
    let provider = OAuthProvider::from_str(&provider).map_err(|_| AuthError::NotFound)?;

    // Read and immediately clear the state cookie; a missing or mismatched
    // value ends the flow.
    let cookie_state = cookies
        .get(provider.state_cookie_name())
        .map(|c| c.value().to_string());
    clear_cookie(&cookies, provider.state_cookie_name());

    match (cookie_state, query.state.as_deref()) {
        (Some(expected), Some(got)) if expected == got => {}
        _ => {
            tracing::warn!(provider = provider.slug(), "oauth state mismatch");
            return Err(AuthError::BadCredentials);
        }
    }

    let code = query.code.filter(|c| !c.is_empty()).ok_or_else(|| {
        tracing::warn!(provider = provider.slug(), "authorization denied by provider");
        AuthError::BadCredentials
    })?;

    let (creds, binding) = resolve_oauth_client(&state, provider, &idp_ref).await?;
    let redirect_uri = oauth_redirect_uri(&state.config, provider, &idp_ref);

    let access_token =
        oauth::exchange_code(&state.http, provider, &creds, &code, &redirect_uri).await?;
    let identity = oauth::fetch_identity(&state.http, provider, &access_token).await?;

    let user = state.engine.provision(&identity, binding).await?;
    let (token, _) = jwt::issue(&user, &state.config)?;

    tracing::info!(
        user_id = %user.id,
        provider = provider.slug(),
        "oauth login completed"
    );
    found(frontend_callback(
        &state.config,
        "/oauth2/callback",
        &token,
        provider.slug(),
    )?)
}

// ---------------------------------------------------------------------------
// Discovery feed
// ---------------------------------------------------------------------------

async fn discovery_handler(
    State(state): State<SsoState>,
) -> Result<Json<Vec<PublicIdpEntry>>, AuthError> {
    let rows = sqlx::query_as::<_, IdentityProvider>(
        "SELECT * FROM identity_providers WHERE is_active = TRUE AND is_public = TRUE \
         ORDER BY created_at",
    )
    .fetch_all(&state.pool)
    .await?;

    let mut entries: Vec<PublicIdpEntry> = rows
        .iter()
        .map(|idp| PublicIdpEntry {
            id: idp.id.to_string(),
            name: idp.name.clone(),
            idp_type: idp.idp_type.clone(),
            provider_slug: match IdpType::from_str(&idp.idp_type) {
                Ok(IdpType::Oauth2Google) => "google".to_string(),
                Ok(IdpType::Oauth2Github) => "github".to_string(),
                _ => "saml".to_string(),
            },
            icon_url: None,
        })
        .collect();

    if state.config.google_client_id.as_deref().is_some_and(|v| !v.is_empty()) {
        entries.push(PublicIdpEntry {
            id: GLOBAL_IDP_SEGMENT.to_string(),
            name: "Google".to_string(),
            idp_type: IdpType::Oauth2Google.as_str().to_string(),
            provider_slug: "google".to_string(),
            icon_url: None,
        });
    }
    if state.config.github_client_id.as_deref().is_some_and(|v| !v.is_empty()) {
        entries.push(PublicIdpEntry {
            id: GLOBAL_IDP_SEGMENT.to_string(),
            name: "GitHub".to_string(),
            idp_type: IdpType::Oauth2Github.as_str().to_string(),
            provider_slug: "github".to_string(),
            icon_url: None,
        });
    }

    Ok(Json(entries))
}
