use crate::config::Config;
use crate::crypto::{self, CryptoVault, VaultError};
use crate::features::auth::jwt::{self, TokenError};
use crate::features::auth::mfa;
use crate::features::auth::models::{LoginResponse, SessionResponse, User};
use crate::features::users::service::UserService;
use crate::utils::email::{Mailer, OutboundMessage};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

/// How long a password-verified user may take to present the second factor.
const TWO_FACTOR_WINDOW_SECS: i64 = 300;

/// Reset tokens live for at most an hour.
const RESET_TOKEN_TTL_SECS: i64 = 3600;

/// Retries when a generated reset token collides on the unique index.
const RESET_TOKEN_INSERT_ATTEMPTS: usize = 3;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid credentials")]
    BadCredentials,

    #[error("account is inactive")]
    AccountInactive,

    #[error("forbidden")]
    Forbidden,

    #[error("organization in path does not match token")]
    TenantMismatch,

    #[error("not found")]
    NotFound,

    #[error("operation would leave the organization without an active admin")]
    LastAdmin,

    #[error("upstream identity provider error: {0}")]
    Upstream(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] VaultError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<TokenError> for AuthError {
    fn from(_: TokenError) -> Self {
        AuthError::BadCredentials
    }
}

impl AuthError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AuthError::BadCredentials | AuthError::AccountInactive => StatusCode::UNAUTHORIZED,
            AuthError::Forbidden | AuthError::TenantMismatch => StatusCode::FORBIDDEN,
            AuthError::NotFound => StatusCode::NOT_FOUND,
            AuthError::LastAdmin => StatusCode::CONFLICT,
            AuthError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AuthError::Database(_) | AuthError::Crypto(_) | AuthError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short stable message for the response body. Raw backend errors stay in
    /// the logs.
    fn public_message(&self) -> &'static str {
        match self {
            AuthError::InvalidInput(_) => "invalid input",
            AuthError::BadCredentials => "invalid credentials",
            AuthError::AccountInactive => "account is inactive",
            AuthError::Forbidden => "forbidden",
            AuthError::TenantMismatch => "organization mismatch",
            AuthError::NotFound => "not found",
            AuthError::LastAdmin => "organization must keep one active admin",
            AuthError::Upstream(_) => "identity provider unavailable",
            AuthError::Database(_) | AuthError::Crypto(_) | AuthError::Internal(_) => {
                "internal error"
            }
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::warn!(error = %self, "request rejected");
        }
        let body = Json(serde_json::json!({ "error": self.public_message() }));
        (status, body).into_response()
    }
}

/// In-process registry of users who passed the password step and owe a
/// second factor. Entries expire after five minutes; eviction happens on
/// each insert.
#[derive(Clone, Default)]
pub struct TwoFactorGate {
    pending: Arc<Mutex<HashMap<Uuid, DateTime<Utc>>>>,
}

impl TwoFactorGate {
    pub fn open(&self, user_id: Uuid) {
        let now = Utc::now();
        let mut pending = self.pending.lock().expect("2fa gate poisoned");
        pending.retain(|_, deadline| *deadline > now);
        pending.insert(user_id, now + Duration::seconds(TWO_FACTOR_WINDOW_SECS));
    }

    pub fn is_open(&self, user_id: Uuid) -> bool {
        let pending = self.pending.lock().expect("2fa gate poisoned");
        pending
            .get(&user_id)
            .map(|deadline| *deadline > Utc::now())
            .unwrap_or(false)
    }

    pub fn close(&self, user_id: Uuid) {
        self.pending.lock().expect("2fa gate poisoned").remove(&user_id);
    }
}

#[derive(Clone)]
pub struct AuthService {
    pool: PgPool,
    config: Config,
    vault: CryptoVault,
    users: UserService,
    gate: TwoFactorGate,
    mailer: Mailer,
}

impl AuthService {
    pub fn new(pool: PgPool, config: Config, vault: CryptoVault, users: UserService) -> Self {
        Self {
            pool,
            config,
            vault,
            users,
            gate: TwoFactorGate::default(),
            mailer: Mailer::new(),
        }
    }

    pub fn users(&self) -> &UserService {
        &self.users
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Issue a session for an already-authenticated user.
    pub fn session_for(&self, user: &User) -> Result<SessionResponse, AuthError> {
        let (token, _expires_at) = jwt::issue(user, &self.config)?;
        Ok(SessionResponse {
            token,
            user_id: user.id,
            email: user.email.clone(),
            name: user.name.clone(),
            role: user.role(),
            organization_id: user.organization_id,
        })
    }

    /// Password login. Unknown emails burn the same KDF work as a real
    /// verification so response timing does not enumerate accounts.
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, AuthError> {
        let user = match self.users.get_user_by_email(email).await? {
            Some(user) => user,
            None => {
                crypto::dummy_password_verification(password);
                return Err(AuthError::BadCredentials);
            }
        };

        if !crypto::verify_password(password, &user.password_hash) {
            return Err(AuthError::BadCredentials);
        }
        if !user.is_active {
            return Err(AuthError::AccountInactive);
        }

        if user.is_totp_enabled {
            self.gate.open(user.id);
            tracing::info!(user_id = %user.id, "password accepted, awaiting second factor");
            return Ok(LoginResponse::TwoFactorRequired {
                two_factor_required: true,
                user_id: user.id,
            });
        }

        tracing::info!(user_id = %user.id, "user logged in");
        Ok(LoginResponse::Session(self.session_for(&user)?))
    }

    /// Re-check the user behind an open 2FA window. The password step may be
    /// minutes old; the account must still exist and be active.
    async fn take_pending_user(&self, user_id: Uuid) -> Result<User, AuthError> {
        if !self.gate.is_open(user_id) {
            return Err(AuthError::BadCredentials);
        }
        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or(AuthError::BadCredentials)?;
        if !user.is_active {
            return Err(AuthError::AccountInactive);
        }
        Ok(user)
    }

    /// Second login step: RFC 6238 code.
    pub async fn verify_totp_login(
        &self,
        user_id: Uuid,
        code: &str,
    ) -> Result<SessionResponse, AuthError> {
        let user = self.take_pending_user(user_id).await?;
        if !user.is_totp_enabled {
            return Err(AuthError::BadCredentials);
        }

        let secret_enc = user.totp_secret_enc.as_deref().ok_or(AuthError::BadCredentials)?;
        let secret = self.vault.decrypt_str(secret_enc)?;
        if !mfa::totp_code_matches(&secret, code)
            .map_err(|e| AuthError::Internal(e.to_string()))?
        {
            return Err(AuthError::BadCredentials);
        }

        self.gate.close(user.id);
        tracing::info!(user_id = %user.id, "totp second factor accepted");
        self.session_for(&user)
    }

    /// Second login step: single-use backup code. The stored hash list is
    /// scanned in full before deciding, and the matched entry is removed in
    /// the same update.
    pub async fn verify_backup_code_login(
        &self,
        user_id: Uuid,
        code: &str,
    ) -> Result<SessionResponse, AuthError> {
        let user = self.take_pending_user(user_id).await?;
        if !user.is_totp_enabled {
            return Err(AuthError::BadCredentials);
        }

        let stored = user.backup_codes_enc.as_deref().ok_or(AuthError::BadCredentials)?;
        let hashes: Vec<String> = serde_json::from_str(&self.vault.decrypt_str(stored)?)
            .map_err(|e| AuthError::Internal(e.to_string()))?;

        let mut matched: Option<usize> = None;
        for (i, hash) in hashes.iter().enumerate() {
            if crypto::backup_code_verify(code, hash) && matched.is_none() {
                matched = Some(i);
            }
        }
        let matched = matched.ok_or(AuthError::BadCredentials)?;

        let mut remaining = hashes;
        remaining.remove(matched);
        let reencrypted = self
            .vault
            .encrypt_str(&serde_json::to_string(&remaining).expect("hash list serializes"))?;
        sqlx::query("UPDATE users SET backup_codes_enc = $1, updated_at = NOW() WHERE id = $2")
            .bind(&reencrypted)
            .bind(user.id)
            .execute(&self.pool)
            .await?;

        self.gate.close(user.id);
        tracing::info!(user_id = %user.id, remaining = remaining.len(), "backup code consumed");
        self.session_for(&user)
    }

    /// Issue a reset token. Always resolves without revealing whether the
    /// email exists; the miss path sleeps to match the hit path's work.
    /// The token is returned for tests; callers serving HTTP ignore it and
    /// let the email stub deliver.
    pub async fn request_password_reset(&self, email: &str) -> Result<Option<String>, AuthError> {
        let user = match self.users.get_user_by_email(email).await? {
            Some(user) => user,
            None => {
                tokio::time::sleep(std::time::Duration::from_millis(150)).await;
                return Ok(None);
            }
        };

        for attempt in 0..RESET_TOKEN_INSERT_ATTEMPTS {
            let token = crypto::random_token(32);
            let token_hash = crypto::token_hash(&token);
            let expires_at = Utc::now() + Duration::seconds(RESET_TOKEN_TTL_SECS);

            let result = sqlx::query(
                "INSERT INTO password_reset_tokens (id, user_id, token_hash, expires_at) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(Uuid::new_v4())
            .bind(user.id)
            .bind(&token_hash)
            .bind(expires_at)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => {
                    let _ = self
                        .mailer
                        .send(&user.email, OutboundMessage::PasswordReset { token: &token });
                    tracing::info!(user_id = %user.id, "password reset token issued");
                    return Ok(Some(token));
                }
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    tracing::warn!(attempt, "reset token collision, regenerating");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AuthError::Internal("could not allocate reset token".into()))
    }

    /// Complete a reset: rotate the password hash, consume the token,
    /// revoke outstanding backup codes.
    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<(), AuthError> {
        let token_hash = crypto::token_hash(token);

        let mut tx = self.pool.begin().await?;

        let row: Option<(Uuid, Uuid, DateTime<Utc>)> = sqlx::query_as(
            "SELECT id, user_id, expires_at FROM password_reset_tokens \
             WHERE token_hash = $1 FOR UPDATE",
        )
        .bind(&token_hash)
        .fetch_optional(&mut *tx)
        .await?;

        let (token_id, user_id, expires_at) =
            row.ok_or_else(|| AuthError::InvalidInput("invalid or expired reset token".into()))?;
        if expires_at <= Utc::now() {
            return Err(AuthError::InvalidInput("invalid or expired reset token".into()));
        }

        let new_hash = crypto::hash_password(new_password)?;
        sqlx::query(
            "UPDATE users SET password_hash = $1, backup_codes_enc = NULL, updated_at = NOW() \
             WHERE id = $2",
        )
        .bind(&new_hash)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM password_reset_tokens WHERE id = $1")
            .bind(token_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(user_id = %user_id, "password reset completed");
        if let Some(user) = self.users.find_by_id(user_id).await? {
            let _ = self.mailer.send(&user.email, OutboundMessage::PasswordChanged);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_factor_gate_opens_and_closes() {
        let gate = TwoFactorGate::default();
        let user = Uuid::new_v4();

        assert!(!gate.is_open(user));
        gate.open(user);
        assert!(gate.is_open(user));
        gate.close(user);
        assert!(!gate.is_open(user));
    }

    #[test]
    fn two_factor_gate_is_per_user() {
        let gate = TwoFactorGate::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        gate.open(a);
        assert!(gate.is_open(a));
        assert!(!gate.is_open(b));
    }

    #[test]
    fn token_errors_collapse_to_bad_credentials() {
        let err: AuthError = TokenError::Expired.into();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.public_message(), "invalid credentials");
    }

    #[test]
    fn last_admin_maps_to_conflict() {
        assert_eq!(AuthError::LastAdmin.status_code(), StatusCode::CONFLICT);
    }
}
