use crate::config::Config;
use crate::features::auth::models::{Principal, Role, User};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Accepted clock skew on either side of a token's validity window.
const LEEWAY_SECS: u64 = 60;

/// Session claims. The payload shape is part of the external contract:
/// `{sub, org, role, iat, exp}`, HS256.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub org: Option<Uuid>,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,

    #[error("bad token signature")]
    BadSignature,

    #[error("token expired")]
    Expired,

    #[error("token not yet valid")]
    NotYetValid,
}

/// Mint a session token for an authenticated user.
pub fn issue(user: &User, config: &Config) -> Result<(String, DateTime<Utc>), TokenError> {
    let now = Utc::now();
    let expires_at = now + chrono::Duration::seconds(config.token_lifespan_secs());

    let claims = Claims {
        sub: user.id,
        org: user.organization_id,
        role: user.role.clone(),
        iat: now.timestamp(),
        exp: expires_at.timestamp(),
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
    .map_err(|_| TokenError::Malformed)?;

    Ok((token, expires_at))
}

/// Verify a bearer token and build the principal it asserts. Claims that
/// were not verified are never trusted.
pub fn verify(token: &str, config: &Config) -> Result<Principal, TokenError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = LEEWAY_SECS;

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &validation,
    )
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => TokenError::Expired,
        ErrorKind::InvalidSignature => TokenError::BadSignature,
        ErrorKind::ImmatureSignature => TokenError::NotYetValid,
        _ => TokenError::Malformed,
    })?;

    let claims = data.claims;
    if claims.iat > Utc::now().timestamp() + LEEWAY_SECS as i64 {
        return Err(TokenError::NotYetValid);
    }

    let role = Role::from_str(&claims.role).map_err(|_| TokenError::Malformed)?;

    Ok(Principal {
        user_id: claims.sub,
        organization_id: claims.org,
        role,
        email: None,
    })
}
