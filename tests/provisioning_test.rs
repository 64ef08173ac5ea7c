use phoenix_grc_backend::crypto;
use phoenix_grc_backend::features::auth::service::AuthError;
use phoenix_grc_backend::features::sso::models::{ExternalIdentity, OrgBinding};
use sqlx::PgPool;

mod common;

fn google_identity(subject: &str, email: &str, name: &str) -> ExternalIdentity {
    ExternalIdentity {
        provider: "google".to_string(),
        subject_id: subject.to_string(),
        email: email.to_string(),
        display_name: Some(name.to_string()),
    }
}

#[sqlx::test]
async fn global_auto_provisioning_creates_exactly_one_user(pool: PgPool) {
    let acme = common::seed_org(&pool, "Acme").await;
    let mut config = common::test_config();
    config.sso_allow_user_creation = true;
    config.sso_default_org_id = Some(acme);
    let engine = common::provisioning_engine(&pool, &config);

    let identity = google_identity("gg-42", "new@ex.com", "New User");

    // First callback creates the user in the default tenant.
    let user = engine.provision(&identity, OrgBinding::Global).await.unwrap();
    assert_eq!(user.organization_id, Some(acme));
    assert_eq!(user.role, "user");
    assert_eq!(user.sso_provider.as_deref(), Some("google"));
    assert_eq!(user.external_subject_id.as_deref(), Some("gg-42"));
    assert!(user.is_active);

    // The sentinel hash keeps the password door shut.
    assert!(!crypto::verify_password("anything", &user.password_hash));

    // Second callback with the same subject refreshes, never duplicates.
    let again = engine.provision(&identity, OrgBinding::Global).await.unwrap();
    assert_eq!(again.id, user.id);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE external_subject_id = 'gg-42'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[sqlx::test]
async fn global_provisioning_disabled_rejects_unknown_identities(pool: PgPool) {
    let config = common::test_config();
    let engine = common::provisioning_engine(&pool, &config);

    let result = engine
        .provision(&google_identity("gg-43", "stranger@ex.com", "Stranger"), OrgBinding::Global)
        .await;
    assert!(matches!(result, Err(AuthError::Forbidden)));

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[sqlx::test]
async fn global_provisioning_without_default_org_creates_unattached(pool: PgPool) {
    let mut config = common::test_config();
    config.sso_allow_user_creation = true;
    let engine = common::provisioning_engine(&pool, &config);

    let user = engine
        .provision(&google_identity("gg-44", "floating@ex.com", "Floating"), OrgBinding::Global)
        .await
        .unwrap();
    assert_eq!(user.organization_id, None);
}

#[sqlx::test]
async fn global_login_links_to_an_existing_account_by_email(pool: PgPool) {
    let acme = common::seed_org(&pool, "Acme").await;
    let existing = common::seed_user(&pool, Some(acme), "alice@acme.test", "pw", "manager", true).await;

    let config = common::test_config();
    let engine = common::provisioning_engine(&pool, &config);

    let user = engine
        .provision(&google_identity("gg-45", "alice@acme.test", "Alice"), OrgBinding::Global)
        .await
        .unwrap();

    // Linked, not created: same id, same tenant, same role.
    assert_eq!(user.id, existing);
    assert_eq!(user.organization_id, Some(acme));
    assert_eq!(user.role, "manager");
    assert_eq!(user.sso_provider.as_deref(), Some("google"));
    assert_eq!(user.external_subject_id.as_deref(), Some("gg-45"));
}

#[sqlx::test]
async fn org_scoped_provisioning_creates_in_that_org(pool: PgPool) {
    let acme = common::seed_org(&pool, "Acme").await;
    let config = common::test_config();
    let engine = common::provisioning_engine(&pool, &config);

    let user = engine
        .provision(
            &google_identity("gg-46", "hire@acme.test", "New Hire"),
            OrgBinding::Org(acme),
        )
        .await
        .unwrap();
    assert_eq!(user.organization_id, Some(acme));
    assert_eq!(user.role, "user");
}

#[sqlx::test]
async fn org_scoped_email_link_ignores_accounts_of_other_tenants(pool: PgPool) {
    let acme = common::seed_org(&pool, "Acme").await;
    let umbrella = common::seed_org(&pool, "Umbrella").await;
    let foreign = common::seed_user(&pool, Some(umbrella), "shared@ex.com", "pw", "user", true).await;

    let config = common::test_config();
    let engine = common::provisioning_engine(&pool, &config);

    // Same email exists in another tenant: org-scoped flows must not link
    // across the boundary. With global email uniqueness the insert collides,
    // which surfaces as an error rather than a silent cross-tenant link.
    let result = engine
        .provision(&google_identity("gg-47", "shared@ex.com", "Shared"), OrgBinding::Org(acme))
        .await;
    assert!(result.is_err());

    let owner: Option<uuid::Uuid> =
        sqlx::query_scalar("SELECT id FROM users WHERE lower(email) = 'shared@ex.com'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(owner, Some(foreign));
}

#[sqlx::test]
async fn returning_saml_user_is_reactivated_and_refreshed(pool: PgPool) {
    let acme = common::seed_org(&pool, "Acme").await;
    let config = common::test_config();
    let engine = common::provisioning_engine(&pool, &config);

    let identity = ExternalIdentity {
        provider: "saml".to_string(),
        subject_id: "pat@corp.example".to_string(),
        email: "pat@corp.example".to_string(),
        display_name: Some("Pat Doe".to_string()),
    };

    let user = engine.provision(&identity, OrgBinding::Org(acme)).await.unwrap();

    // Deactivate, then come back through the IdP.
    sqlx::query("UPDATE users SET is_active = FALSE WHERE id = $1")
        .bind(user.id)
        .execute(&pool)
        .await
        .unwrap();

    let back = engine.provision(&identity, OrgBinding::Org(acme)).await.unwrap();
    assert_eq!(back.id, user.id);
    assert!(back.is_active);
}
