use phoenix_grc_backend::features::auth::jwt;
use phoenix_grc_backend::features::auth::models::{LoginResponse, Role};
use phoenix_grc_backend::features::auth::service::AuthError;
use sqlx::PgPool;
use totp_rs::{Algorithm, Secret, TOTP};

mod common;

fn current_code(secret_base32: &str) -> String {
    let secret = Secret::Encoded(secret_base32.to_string());
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
    totp.generate_current().unwrap()
}

#[sqlx::test]
async fn password_login_happy_path(pool: PgPool) {
    let services = common::setup_services(pool.clone());
    let org = common::seed_org(&pool, "Acme").await;
    let alice = common::seed_user(&pool, Some(org), "alice@acme.test", "s3cret", "admin", true).await;

    let response = services.auth.login("alice@acme.test", "s3cret").await.unwrap();
    let session = match response {
        LoginResponse::Session(session) => session,
        other => panic!("expected a session, got {:?}", other),
    };

    assert_eq!(session.user_id, alice);
    assert_eq!(session.organization_id, Some(org));
    assert_eq!(session.role, Role::Admin);

    // The token decodes under the current signing key and carries the
    // authenticated user.
    let principal = jwt::verify(&session.token, &services.config).unwrap();
    assert_eq!(principal.user_id, alice);
    assert_eq!(principal.organization_id, Some(org));
}

#[sqlx::test]
async fn login_is_case_insensitive_on_email(pool: PgPool) {
    let services = common::setup_services(pool.clone());
    let org = common::seed_org(&pool, "Acme").await;
    common::seed_user(&pool, Some(org), "alice@acme.test", "s3cret", "user", true).await;

    let response = services.auth.login("ALICE@ACME.TEST", "s3cret").await;
    assert!(matches!(response, Ok(LoginResponse::Session(_))));
}

#[sqlx::test]
async fn unknown_email_and_wrong_password_both_reject(pool: PgPool) {
    let services = common::setup_services(pool.clone());
    let org = common::seed_org(&pool, "Acme").await;
    common::seed_user(&pool, Some(org), "alice@acme.test", "s3cret", "user", true).await;

    let missing = services.auth.login("nobody@acme.test", "whatever").await;
    assert!(matches!(missing, Err(AuthError::BadCredentials)));

    let wrong = services.auth.login("alice@acme.test", "not-the-password").await;
    assert!(matches!(wrong, Err(AuthError::BadCredentials)));
}

#[sqlx::test]
async fn inactive_user_cannot_log_in(pool: PgPool) {
    let services = common::setup_services(pool.clone());
    let org = common::seed_org(&pool, "Acme").await;
    common::seed_user(&pool, Some(org), "gone@acme.test", "s3cret", "user", false).await;

    let result = services.auth.login("gone@acme.test", "s3cret").await;
    assert!(matches!(result, Err(AuthError::AccountInactive)));
}

#[sqlx::test]
async fn totp_enrollment_then_two_step_login(pool: PgPool) {
    let services = common::setup_services(pool.clone());
    let org = common::seed_org(&pool, "Acme").await;
    let bob = common::seed_user(&pool, Some(org), "bob@acme.test", "s3cret", "user", true).await;

    // Enrollment stores the seed but does not enable yet.
    let user = services.users.find_by_id(bob).await.unwrap().unwrap();
    let setup = services.mfa.setup(&user).await.unwrap();
    assert!(!setup.secret.is_empty());
    assert!(setup.qr_code.starts_with("data:image/png;base64,"));

    let user = services.users.find_by_id(bob).await.unwrap().unwrap();
    assert!(!user.is_totp_enabled);
    assert!(user.totp_secret_enc.is_some());

    // First verification flips the flag exactly once.
    services.mfa.verify(&user, &current_code(&setup.secret)).await.unwrap();
    let user = services.users.find_by_id(bob).await.unwrap().unwrap();
    assert!(user.is_totp_enabled);

    // Password step now defers to the second factor without a token.
    let response = services.auth.login("bob@acme.test", "s3cret").await.unwrap();
    let user_id = match response {
        LoginResponse::TwoFactorRequired {
            two_factor_required,
            user_id,
        } => {
            assert!(two_factor_required);
            user_id
        }
        other => panic!("expected a 2fa handoff, got {:?}", other),
    };
    assert_eq!(user_id, bob);

    let session = services
        .auth
        .verify_totp_login(bob, &current_code(&setup.secret))
        .await
        .unwrap();
    assert_eq!(session.user_id, bob);

    // A wrong code after the window closed is rejected.
    let again = services.auth.verify_totp_login(bob, "000000").await;
    assert!(again.is_err());
}

#[sqlx::test]
async fn totp_step_requires_prior_password_step(pool: PgPool) {
    let services = common::setup_services(pool.clone());
    let org = common::seed_org(&pool, "Acme").await;
    let bob = common::seed_user(&pool, Some(org), "bob@acme.test", "s3cret", "user", true).await;

    let user = services.users.find_by_id(bob).await.unwrap().unwrap();
    let setup = services.mfa.setup(&user).await.unwrap();
    services.mfa.verify(&user, &current_code(&setup.secret)).await.unwrap();

    // No password step first: even a valid code must not mint a session.
    let result = services
        .auth
        .verify_totp_login(bob, &current_code(&setup.secret))
        .await;
    assert!(matches!(result, Err(AuthError::BadCredentials)));
}

#[sqlx::test]
async fn backup_code_is_single_use(pool: PgPool) {
    let services = common::setup_services(pool.clone());
    let org = common::seed_org(&pool, "Acme").await;
    let bob = common::seed_user(&pool, Some(org), "bob@acme.test", "s3cret", "user", true).await;

    let user = services.users.find_by_id(bob).await.unwrap().unwrap();
    let setup = services.mfa.setup(&user).await.unwrap();
    let user = services.users.find_by_id(bob).await.unwrap().unwrap();
    services.mfa.verify(&user, &current_code(&setup.secret)).await.unwrap();

    let user = services.users.find_by_id(bob).await.unwrap().unwrap();
    let codes = services.mfa.generate_backup_codes(&user).await.unwrap();
    assert_eq!(codes.len(), 10);

    // First use succeeds.
    services.auth.login("bob@acme.test", "s3cret").await.unwrap();
    let session = services
        .auth
        .verify_backup_code_login(bob, &codes[0])
        .await
        .unwrap();
    assert_eq!(session.user_id, bob);

    // Second use of the same code is invalid credentials.
    services.auth.login("bob@acme.test", "s3cret").await.unwrap();
    let replay = services.auth.verify_backup_code_login(bob, &codes[0]).await;
    assert!(matches!(replay, Err(AuthError::BadCredentials)));

    // A different remaining code still works.
    let session = services
        .auth
        .verify_backup_code_login(bob, &codes[1])
        .await
        .unwrap();
    assert_eq!(session.user_id, bob);
}

#[sqlx::test]
async fn regenerating_backup_codes_overwrites_the_previous_set(pool: PgPool) {
    let services = common::setup_services(pool.clone());
    let org = common::seed_org(&pool, "Acme").await;
    let bob = common::seed_user(&pool, Some(org), "bob@acme.test", "s3cret", "user", true).await;

    let user = services.users.find_by_id(bob).await.unwrap().unwrap();
    let setup = services.mfa.setup(&user).await.unwrap();
    let user = services.users.find_by_id(bob).await.unwrap().unwrap();
    services.mfa.verify(&user, &current_code(&setup.secret)).await.unwrap();

    let user = services.users.find_by_id(bob).await.unwrap().unwrap();
    let old_codes = services.mfa.generate_backup_codes(&user).await.unwrap();
    let _new_codes = services.mfa.generate_backup_codes(&user).await.unwrap();

    services.auth.login("bob@acme.test", "s3cret").await.unwrap();
    let old_use = services.auth.verify_backup_code_login(bob, &old_codes[0]).await;
    assert!(matches!(old_use, Err(AuthError::BadCredentials)));
}

#[sqlx::test]
async fn totp_disable_requires_the_current_password(pool: PgPool) {
    let services = common::setup_services(pool.clone());
    let org = common::seed_org(&pool, "Acme").await;
    let bob = common::seed_user(&pool, Some(org), "bob@acme.test", "s3cret", "user", true).await;

    let user = services.users.find_by_id(bob).await.unwrap().unwrap();
    let setup = services.mfa.setup(&user).await.unwrap();
    let user = services.users.find_by_id(bob).await.unwrap().unwrap();
    services.mfa.verify(&user, &current_code(&setup.secret)).await.unwrap();

    let user = services.users.find_by_id(bob).await.unwrap().unwrap();
    assert!(services.mfa.disable(&user, "wrong-password").await.is_err());

    services.mfa.disable(&user, "s3cret").await.unwrap();
    let user = services.users.find_by_id(bob).await.unwrap().unwrap();
    assert!(!user.is_totp_enabled);
    assert!(user.totp_secret_enc.is_none());
    assert!(user.backup_codes_enc.is_none());
}

#[sqlx::test]
async fn password_reset_rotates_credentials_and_consumes_the_token(pool: PgPool) {
    let services = common::setup_services(pool.clone());
    let org = common::seed_org(&pool, "Acme").await;
    common::seed_user(&pool, Some(org), "alice@acme.test", "old-password", "user", true).await;

    let token = services
        .auth
        .request_password_reset("alice@acme.test")
        .await
        .unwrap()
        .expect("token for existing user");

    services.auth.reset_password(&token, "new-password-123").await.unwrap();

    // Old password is gone, new one works.
    assert!(matches!(
        services.auth.login("alice@acme.test", "old-password").await,
        Err(AuthError::BadCredentials)
    ));
    assert!(matches!(
        services.auth.login("alice@acme.test", "new-password-123").await,
        Ok(LoginResponse::Session(_))
    ));

    // Token is one-shot.
    let replay = services.auth.reset_password(&token, "another-password").await;
    assert!(matches!(replay, Err(AuthError::InvalidInput(_))));
}

#[sqlx::test]
async fn password_reset_for_unknown_email_resolves_quietly(pool: PgPool) {
    let services = common::setup_services(pool.clone());
    let token = services
        .auth
        .request_password_reset("nobody@acme.test")
        .await
        .unwrap();
    assert!(token.is_none());
}
