use crate::features::auth::service::AuthError;
use crate::features::sso::models::{ExternalIdentity, IdpType};
use serde::Deserialize;
use std::str::FromStr;

/// OAuth2 providers the broker speaks. Both paths (org-scoped IdP rows and
/// the global client) share this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthProvider {
    Google,
    Github,
}

impl FromStr for OAuthProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "google" => Ok(OAuthProvider::Google),
            "github" => Ok(OAuthProvider::Github),
            _ => Err(()),
        }
    }
}

impl OAuthProvider {
    pub fn slug(&self) -> &'static str {
        match self {
            OAuthProvider::Google => "google",
            OAuthProvider::Github => "github",
        }
    }

    pub fn idp_type(&self) -> IdpType {
        match self {
            OAuthProvider::Google => IdpType::Oauth2Google,
            OAuthProvider::Github => IdpType::Oauth2Github,
        }
    }

    fn authorize_url(&self) -> &'static str {
        match self {
            OAuthProvider::Google => "https://accounts.google.com/o/oauth2/v2/auth",
            OAuthProvider::Github => "https://github.com/login/oauth/authorize",
        }
    }

    fn token_url(&self) -> &'static str {
        match self {
            OAuthProvider::Google => "https://oauth2.googleapis.com/token",
            OAuthProvider::Github => "https://github.com/login/oauth/access_token",
        }
    }

    fn userinfo_url(&self) -> &'static str {
        match self {
            OAuthProvider::Google => "https://openidconnect.googleapis.com/v1/userinfo",
            OAuthProvider::Github => "https://api.github.com/user",
        }
    }

    fn scopes(&self) -> &'static str {
        match self {
            OAuthProvider::Google => "openid email profile",
            OAuthProvider::Github => "read:user user:email",
        }
    }

    /// Cookie name for the CSRF state, distinct per provider so concurrent
    /// flows do not clobber each other.
    pub fn state_cookie_name(&self) -> &'static str {
        match self {
            OAuthProvider::Google => "oauth_state_google",
            OAuthProvider::Github => "oauth_state_github",
        }
    }
}

/// Resolved client credentials, whether from a decrypted IdP row or from
/// process configuration.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// The provider's authorize URL with our parameters attached.
pub fn authorize_redirect_url(
    provider: OAuthProvider,
    client_id: &str,
    redirect_uri: &str,
    state: &str,
) -> Result<String, AuthError> {
    let mut url = reqwest::Url::parse(provider.authorize_url())
        .map_err(|_| AuthError::Internal("invalid authorize URL".into()))?;
    url.query_pairs_mut()
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("response_type", "code")
        .append_pair("scope", provider.scopes())
        .append_pair("state", state);
    Ok(url.into())
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleUserInfo {
    sub: String,
    email: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GithubUser {
    id: i64,
    login: String,
    name: Option<String>,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GithubEmail {
    pub email: String,
    pub primary: bool,
    pub verified: bool,
}

/// Exchange the authorization code for an access token. Direct HTTPS POST
/// to the provider's token endpoint; failures surface as upstream errors.
pub async fn exchange_code(
    http: &reqwest::Client,
    provider: OAuthProvider,
    creds: &ClientCredentials,
    code: &str,
    redirect_uri: &str,
) -> Result<String, AuthError> {
    let params = [
        ("client_id", creds.client_id.as_str()),
        ("client_secret", creds.client_secret.as_str()),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("grant_type", "authorization_code"),
    ];

    let response = http
        .post(provider.token_url())
        .header(reqwest::header::ACCEPT, "application/json")
        .form(&params)
        .send()
        .await
        .map_err(|e| AuthError::Upstream(format!("token exchange: {e}")))?;

    if !response.status().is_success() {
        return Err(AuthError::Upstream(format!(
            "token exchange returned {}",
            response.status()
        )));
    }

    let token: TokenResponse = response
        .json()
        .await
        .map_err(|e| AuthError::Upstream(format!("token exchange body: {e}")))?;
    token
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AuthError::Upstream("token exchange returned no access token".into()))
}

/// Fetch the provider's view of the user and normalize it. GitHub accounts
/// without a public email get a second call to `/user/emails`.
pub async fn fetch_identity(
    http: &reqwest::Client,
    provider: OAuthProvider,
    access_token: &str,
) -> Result<ExternalIdentity, AuthError> {
    match provider {
        OAuthProvider::Google => {
            let info: GoogleUserInfo = get_json(http, provider.userinfo_url(), access_token).await?;
            let email = info.email.filter(|e| !e.is_empty()).ok_or_else(|| {
                AuthError::InvalidInput("identity provider did not supply an email".into())
            })?;
            Ok(ExternalIdentity {
                provider: provider.slug().to_string(),
                subject_id: info.sub,
                email,
                display_name: info.name,
            })
        }
        OAuthProvider::Github => {
            let user: GithubUser = get_json(http, provider.userinfo_url(), access_token).await?;
            let email = match user.email.filter(|e| !e.is_empty()) {
                Some(email) => email,
                None => {
                    let emails: Vec<GithubEmail> =
                        get_json(http, "https://api.github.com/user/emails", access_token).await?;
                    pick_github_email(&emails).ok_or_else(|| {
                        AuthError::InvalidInput(
                            "identity provider did not supply an email".into(),
                        )
                    })?
                }
            };
            Ok(ExternalIdentity {
                provider: provider.slug().to_string(),
                // GitHub's numeric id, rendered as a decimal string.
                subject_id: user.id.to_string(),
                email,
                display_name: user.name.or(Some(user.login)),
            })
        }
    }
}

/// First primary+verified address, else the first verified one.
pub(crate) fn pick_github_email(emails: &[GithubEmail]) -> Option<String> {
    emails
        .iter()
        .find(|e| e.primary && e.verified)
        .or_else(|| emails.iter().find(|e| e.verified))
        .map(|e| e.email.clone())
}

async fn get_json<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
    access_token: &str,
) -> Result<T, AuthError> {
    let response = http
        .get(url)
        .bearer_auth(access_token)
        .header(reqwest::header::ACCEPT, "application/json")
        .header(reqwest::header::USER_AGENT, "phoenix-grc")
        .send()
        .await
        .map_err(|e| AuthError::Upstream(format!("userinfo: {e}")))?;

    if !response.status().is_success() {
        return Err(AuthError::Upstream(format!(
            "userinfo returned {}",
            response.status()
        )));
    }
    response
        .json()
        .await
        .map_err(|e| AuthError::Upstream(format!("userinfo body: {e}")))
}
