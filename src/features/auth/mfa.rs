use crate::crypto::{self, CryptoVault, VaultError};
use crate::features::auth::models::User;
use sqlx::PgPool;
use thiserror::Error;
use totp_rs::{Algorithm, Secret, TOTP};

/// Backup codes issued per generation. The previous set is overwritten.
const BACKUP_CODE_COUNT: usize = 10;

#[derive(Error, Debug)]
pub enum MfaError {
    #[error("two-factor authentication already enabled")]
    AlreadyEnabled,

    #[error("two-factor authentication is not enabled")]
    NotEnabled,

    #[error("invalid code")]
    InvalidCode,

    #[error("invalid credentials")]
    BadCredentials,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("crypto error: {0}")]
    Vault(#[from] VaultError),

    #[error("totp error: {0}")]
    Totp(String),
}

impl From<crate::features::auth::service::AuthError> for MfaError {
    fn from(e: crate::features::auth::service::AuthError) -> Self {
        use crate::features::auth::service::AuthError;
        match e {
            AuthError::Database(e) => MfaError::Database(e),
            AuthError::Crypto(e) => MfaError::Vault(e),
            _ => MfaError::BadCredentials,
        }
    }
}

impl MfaError {
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            MfaError::AlreadyEnabled => StatusCode::CONFLICT,
            MfaError::NotEnabled => StatusCode::BAD_REQUEST,
            MfaError::InvalidCode | MfaError::BadCredentials => StatusCode::UNAUTHORIZED,
            MfaError::Database(_) | MfaError::Vault(_) | MfaError::Totp(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl axum::response::IntoResponse for MfaError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "mfa operation failed");
        }
        let body = axum::Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TotpSetupResponse {
    pub secret: String,
    /// PNG data URI, QR-ready.
    pub qr_code: String,
    pub account: String,
    pub issuer: String,
}

#[derive(Debug, serde::Serialize)]
pub struct BackupCodesResponse {
    pub backup_codes: Vec<String>,
}

#[derive(Clone)]
pub struct MfaService {
    pool: PgPool,
    vault: CryptoVault,
    issuer: String,
}

impl MfaService {
    pub fn new(pool: PgPool, vault: CryptoVault, issuer: String) -> Self {
        Self { pool, vault, issuer }
    }

    /// Start TOTP enrollment: generate a 160-bit seed, store it encrypted
    /// right away, and hand back the provisioning material. The enabled flag
    /// stays false until the user proves possession once.
    pub async fn setup(&self, user: &User) -> Result<TotpSetupResponse, MfaError> {
        if user.is_totp_enabled {
            return Err(MfaError::AlreadyEnabled);
        }

        let secret = Secret::generate_secret();
        let secret_base32 = secret.to_encoded().to_string();

        let totp = build_totp(&secret_base32, &self.issuer, &user.email)?;
        let qr_png = totp.get_qr_base64().map_err(MfaError::Totp)?;

        let secret_enc = self.vault.encrypt_str(&secret_base32)?;
        sqlx::query(
            "UPDATE users SET totp_secret_enc = $1, is_totp_enabled = FALSE, updated_at = NOW() \
             WHERE id = $2",
        )
        .bind(&secret_enc)
        .bind(user.id)
        .execute(&self.pool)
        .await?;

        tracing::info!(user_id = %user.id, "totp enrollment started");
        Ok(TotpSetupResponse {
            secret: secret_base32,
            qr_code: format!("data:image/png;base64,{}", qr_png),
            account: user.email.clone(),
            issuer: self.issuer.clone(),
        })
    }

    /// Verify a code against the stored seed. The first success after
    /// enrollment flips `is_totp_enabled`; later successes are a no-op
    /// beyond the check itself.
    pub async fn verify(&self, user: &User, code: &str) -> Result<(), MfaError> {
        let secret_enc = user.totp_secret_enc.as_deref().ok_or(MfaError::NotEnabled)?;
        let secret = self.vault.decrypt_str(secret_enc)?;

        if !totp_code_matches(&secret, code)? {
            return Err(MfaError::InvalidCode);
        }

        if !user.is_totp_enabled {
            sqlx::query(
                "UPDATE users SET is_totp_enabled = TRUE, updated_at = NOW() WHERE id = $1",
            )
            .bind(user.id)
            .execute(&self.pool)
            .await?;
            tracing::info!(user_id = %user.id, "totp enabled");
        }
        Ok(())
    }

    /// Disable TOTP. Requires the current password; clears the seed, the
    /// flag and any backup codes.
    pub async fn disable(&self, user: &User, password: &str) -> Result<(), MfaError> {
        if !crypto::verify_password(password, &user.password_hash) {
            return Err(MfaError::BadCredentials);
        }
        if !user.is_totp_enabled {
            return Err(MfaError::NotEnabled);
        }

        sqlx::query(
            "UPDATE users SET totp_secret_enc = NULL, is_totp_enabled = FALSE, \
             backup_codes_enc = NULL, updated_at = NOW() WHERE id = $1",
        )
        .bind(user.id)
        .execute(&self.pool)
        .await?;

        tracing::info!(user_id = %user.id, "totp disabled");
        Ok(())
    }

    /// Generate a fresh set of backup codes. Plaintext is returned exactly
    /// once; only hashes are stored, encrypted, replacing any previous set.
    pub async fn generate_backup_codes(&self, user: &User) -> Result<Vec<String>, MfaError> {
        if !user.is_totp_enabled {
            return Err(MfaError::NotEnabled);
        }

        let codes: Vec<String> = (0..BACKUP_CODE_COUNT)
            .map(|_| crypto::backup_code_generate())
            .collect();
        let hashes: Vec<String> = codes.iter().map(|c| crypto::backup_code_hash(c)).collect();

        let stored = self
            .vault
            .encrypt_str(&serde_json::to_string(&hashes).expect("hash list serializes"))?;
        sqlx::query("UPDATE users SET backup_codes_enc = $1, updated_at = NOW() WHERE id = $2")
            .bind(&stored)
            .bind(user.id)
            .execute(&self.pool)
            .await?;

        tracing::info!(user_id = %user.id, count = codes.len(), "backup codes regenerated");
        Ok(codes)
    }

}

fn build_totp(secret_base32: &str, issuer: &str, account: &str) -> Result<TOTP, MfaError> {
    let secret = Secret::Encoded(secret_base32.to_string());
    TOTP::new(
        Algorithm::SHA1,
        6,
        1,
        30,
        secret.to_bytes().map_err(|e| MfaError::Totp(e.to_string()))?,
        Some(issuer.to_string()),
        account.to_string(),
    )
    .map_err(|e| MfaError::Totp(e.to_string()))
}

/// RFC 6238 check: SHA-1, 6 digits, 30-second step, ±1 step of skew.
pub fn totp_code_matches(secret_base32: &str, code: &str) -> Result<bool, MfaError> {
    let secret = Secret::Encoded(secret_base32.to_string());
    let totp = TOTP::new(
        Algorithm::SHA1,
        6,
        1,
        30,
        secret.to_bytes().map_err(|e| MfaError::Totp(e.to_string()))?,
        None,
        String::new(),
    )
    .map_err(|e| MfaError::Totp(e.to_string()))?;
    Ok(totp.check_current(code).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &str = "JBSWY3DPEHPK3PXP";

    #[test]
    fn current_code_verifies_and_garbage_does_not() {
        let secret = Secret::Encoded(SEED.to_string());
        let totp = TOTP::new(
            Algorithm::SHA1,
            6,
            1,
            30,
            secret.to_bytes().unwrap(),
            None,
            String::new(),
        )
        .unwrap();

        let code = totp.generate_current().unwrap();
        assert!(totp_code_matches(SEED, &code).unwrap());
        assert!(!totp_code_matches(SEED, "000000").unwrap()
            || code == "000000");
    }

    #[test]
    fn known_vector_at_fixed_time() {
        // RFC 6238-style check against a fixed timestamp.
        let secret = Secret::Encoded(SEED.to_string());
        let totp = TOTP::new(
            Algorithm::SHA1,
            6,
            1,
            30,
            secret.to_bytes().unwrap(),
            None,
            String::new(),
        )
        .unwrap();
        let code = totp.generate(59);
        assert_eq!(code.len(), 6);
        assert!(totp.check(&code, 59));
        // One step later plus the skew window, the code no longer checks.
        assert!(!totp.check(&code, 59 + 90));
    }

    #[test]
    fn generated_secret_is_160_bits() {
        let secret = Secret::generate_secret();
        assert_eq!(secret.to_bytes().unwrap().len(), 20);
    }
}
