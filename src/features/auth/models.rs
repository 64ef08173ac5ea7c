use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

/// Role hierarchy. Variant order defines privilege order, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Manager,
    Admin,
    SystemAdmin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Manager => "manager",
            Role::Admin => "admin",
            Role::SystemAdmin => "system_admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "manager" => Ok(Role::Manager),
            "admin" => Ok(Role::Admin),
            "system_admin" => Ok(Role::SystemAdmin),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub email: String,
    pub name: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: String,
    pub is_active: bool,
    pub sso_provider: Option<String>,
    pub external_subject_id: Option<String>,
    #[serde(skip_serializing)]
    pub totp_secret_enc: Option<String>,
    pub is_totp_enabled: bool,
    #[serde(skip_serializing)]
    pub backup_codes_enc: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn role(&self) -> Role {
        Role::from_str(&self.role).unwrap_or(Role::User)
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub logo_object_key: Option<String>,
    pub primary_color: Option<String>,
    pub secondary_color: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Verified identity carried through request extensions by the auth
/// middleware. Downstream handlers never re-verify the token.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Principal {
    pub user_id: Uuid,
    pub organization_id: Option<Uuid>,
    pub role: Role,
    /// Not carried in token claims; cached by handlers that fetched the row.
    pub email: Option<String>,
}

// ---------------------------------------------------------------------------
// Request / response DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(email(message = "Email must be valid"))]
    pub email: String,
    #[validate(length(min = 1, message = "Password is required"))]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct TwoFactorVerifyRequest {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct BackupCodeVerifyRequest {
    pub user_id: Uuid,
    pub backup_code: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ForgotPasswordRequest {
    #[validate(email)]
    pub email: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ResetPasswordRequest {
    pub token: String,
    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct TotpVerifyRequest {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct TotpDisableRequest {
    pub password: String,
}

/// Full session body returned on every successful auth path.
#[derive(Debug, Clone, Serialize)]
pub struct SessionResponse {
    pub token: String,
    pub user_id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub role: Role,
    pub organization_id: Option<Uuid>,
}

/// Login either completes with a session or hands off to the second factor.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum LoginResponse {
    TwoFactorRequired {
        two_factor_required: bool,
        user_id: Uuid,
    },
    Session(SessionResponse),
}

/// User shape safe to return from admin endpoints. Secrets stay behind the
/// process boundary.
#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub email: String,
    pub name: Option<String>,
    pub role: Role,
    pub is_active: bool,
    pub is_totp_enabled: bool,
    pub sso_provider: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for UserResponse {
    fn from(u: &User) -> Self {
        UserResponse {
            id: u.id,
            organization_id: u.organization_id,
            email: u.email.clone(),
            name: u.name.clone(),
            role: u.role(),
            is_active: u.is_active,
            is_totp_enabled: u.is_totp_enabled,
            sso_provider: u.sso_provider.clone(),
            created_at: u.created_at,
        }
    }
}
