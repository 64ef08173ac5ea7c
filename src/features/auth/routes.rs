use crate::features::auth::mfa::{BackupCodesResponse, MfaError, MfaService, TotpSetupResponse};
use crate::features::auth::models::{
    BackupCodeVerifyRequest, ForgotPasswordRequest, LoginRequest, LoginResponse, Principal,
    ResetPasswordRequest, SessionResponse, TotpDisableRequest, TotpVerifyRequest,
    TwoFactorVerifyRequest, User, UserResponse,
};
use crate::features::auth::service::{AuthError, AuthService};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use validator::Validate;

pub fn public_auth_routes() -> Router<AuthService> {
    Router::new()
        .route("/login", post(login_handler))
        .route("/login/2fa/verify", post(totp_login_handler))
        .route("/login/2fa/backup-code/verify", post(backup_code_login_handler))
        .route("/forgot-password", post(forgot_password_handler))
        .route("/reset-password", post(reset_password_handler))
}

pub fn me_routes() -> Router<AuthService> {
    Router::new().route("/me", get(me_handler))
}

#[derive(Clone)]
pub struct MfaState {
    pub auth: AuthService,
    pub mfa: MfaService,
}

pub fn mfa_routes() -> Router<MfaState> {
    Router::new()
        .route("/totp/setup", post(totp_setup_handler))
        .route("/totp/verify", post(totp_verify_handler))
        .route("/totp/disable", post(totp_disable_handler))
        .route("/backup-codes/generate", post(backup_codes_handler))
}

async fn login_handler(
    State(auth): State<AuthService>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AuthError> {
    req.validate()
        .map_err(|e| AuthError::InvalidInput(e.to_string()))?;
    let response = auth.login(&req.email, &req.password).await?;
    Ok(Json(response))
}

async fn totp_login_handler(
    State(auth): State<AuthService>,
    Json(req): Json<TwoFactorVerifyRequest>,
) -> Result<Json<SessionResponse>, AuthError> {
    let session = auth.verify_totp_login(req.user_id, &req.token).await?;
    Ok(Json(session))
}

async fn backup_code_login_handler(
    State(auth): State<AuthService>,
    Json(req): Json<BackupCodeVerifyRequest>,
) -> Result<Json<SessionResponse>, AuthError> {
    let session = auth
        .verify_backup_code_login(req.user_id, &req.backup_code)
        .await?;
    Ok(Json(session))
}

/// Always 204, whatever happened: this endpoint must not leak whether the
/// email exists. Failures are only visible in the logs.
async fn forgot_password_handler(
    State(auth): State<AuthService>,
    Json(req): Json<ForgotPasswordRequest>,
) -> StatusCode {
    if req.validate().is_err() {
        return StatusCode::NO_CONTENT;
    }
    if let Err(e) = auth.request_password_reset(&req.email).await {
        tracing::error!(error = %e, "password reset request failed");
    }
    StatusCode::NO_CONTENT
}

async fn reset_password_handler(
    State(auth): State<AuthService>,
    Json(req): Json<ResetPasswordRequest>,
) -> Result<StatusCode, AuthError> {
    req.validate()
        .map_err(|e| AuthError::InvalidInput(e.to_string()))?;
    auth.reset_password(&req.token, &req.new_password).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn me_handler(
    State(auth): State<AuthService>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<UserResponse>, AuthError> {
    let user = auth
        .users()
        .find_by_id(principal.user_id)
        .await?
        .ok_or(AuthError::NotFound)?;
    Ok(Json(UserResponse::from(&user)))
}

// ---------------------------------------------------------------------------
// Self-service 2FA
// ---------------------------------------------------------------------------

async fn current_user(state: &MfaState, principal: &Principal) -> Result<User, MfaError> {
    state
        .auth
        .users()
        .find_by_id(principal.user_id)
        .await?
        .ok_or(MfaError::BadCredentials)
}

async fn totp_setup_handler(
    State(state): State<MfaState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<TotpSetupResponse>, MfaError> {
    let user = current_user(&state, &principal).await?;
    let setup = state.mfa.setup(&user).await?;
    Ok(Json(setup))
}

async fn totp_verify_handler(
    State(state): State<MfaState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<TotpVerifyRequest>,
) -> Result<StatusCode, MfaError> {
    let user = current_user(&state, &principal).await?;
    state.mfa.verify(&user, &req.token).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn totp_disable_handler(
    State(state): State<MfaState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<TotpDisableRequest>,
) -> Result<StatusCode, MfaError> {
    let user = current_user(&state, &principal).await?;
    state.mfa.disable(&user, &req.password).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn backup_codes_handler(
    State(state): State<MfaState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<BackupCodesResponse>, MfaError> {
    let user = current_user(&state, &principal).await?;
    let backup_codes = state.mfa.generate_backup_codes(&user).await?;
    Ok(Json(BackupCodesResponse { backup_codes }))
}
