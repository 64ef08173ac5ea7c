use crate::crypto::SENTINEL_PASSWORD_HASH;
use crate::features::auth::models::{Organization, Principal, Role, User};
use crate::features::auth::service::AuthError;
use sqlx::PgPool;
use uuid::Uuid;

/// Tenant-scoped persistence for users and organizations. Reads either take
/// an organization filter or are explicitly cross-tenant (global SSO lookup
/// is the only caller of those).
#[derive(Clone)]
pub struct UserService {
    pool: PgPool,
}

/// What a federated login wants persisted for a brand-new account.
#[derive(Debug, Clone)]
pub struct FederatedUserSpec {
    pub email: String,
    pub name: Option<String>,
    pub organization_id: Option<Uuid>,
    pub provider: String,
    pub subject_id: String,
}

impl UserService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, AuthError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    /// Case-folded email lookup. Email uniqueness is global, so this read is
    /// cross-tenant by nature.
    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, AuthError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE lower(email) = lower($1)")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    /// Lookup by federated subject. Org-scoped IdPs pass their tenant;
    /// the global IdP passes `None` and matches across tenants.
    pub async fn get_user_by_external(
        &self,
        provider: &str,
        subject_id: &str,
        organization_id: Option<Uuid>,
    ) -> Result<Option<User>, AuthError> {
        let user = match organization_id {
            Some(org_id) => {
                sqlx::query_as::<_, User>(
                    "SELECT * FROM users WHERE sso_provider = $1 AND external_subject_id = $2 \
                     AND organization_id = $3",
                )
                .bind(provider)
                .bind(subject_id)
                .bind(org_id)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, User>(
                    "SELECT * FROM users WHERE sso_provider = $1 AND external_subject_id = $2",
                )
                .bind(provider)
                .bind(subject_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        Ok(user)
    }

    /// Create a user from a verified federated identity. The password hash
    /// is a sentinel the verifier always rejects; a real password can only
    /// arrive through the reset flow.
    pub async fn create_federated(&self, spec: &FederatedUserSpec) -> Result<User, AuthError> {
        let id = Uuid::new_v4();
        let user = sqlx::query_as::<_, User>(
            "INSERT INTO users \
             (id, organization_id, email, name, password_hash, role, is_active, \
              sso_provider, external_subject_id) \
             VALUES ($1, $2, lower($3), $4, $5, $6, TRUE, $7, $8) \
             RETURNING *",
        )
        .bind(id)
        .bind(spec.organization_id)
        .bind(&spec.email)
        .bind(&spec.name)
        .bind(SENTINEL_PASSWORD_HASH)
        .bind(Role::User.as_str())
        .bind(&spec.provider)
        .bind(&spec.subject_id)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(user_id = %user.id, provider = %spec.provider, "federated user created");
        Ok(user)
    }

    /// Attach a federated identity to an existing account. The organization
    /// stays whatever it already was.
    pub async fn link_external(
        &self,
        user_id: Uuid,
        provider: &str,
        subject_id: &str,
    ) -> Result<User, AuthError> {
        let user = sqlx::query_as::<_, User>(
            "UPDATE users SET sso_provider = $1, external_subject_id = $2, updated_at = NOW() \
             WHERE id = $3 RETURNING *",
        )
        .bind(provider)
        .bind(subject_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(user_id = %user_id, provider = %provider, "federated identity linked");
        Ok(user)
    }

    /// Refresh a returning federated user: fill an empty display name,
    /// record the last-seen provider pair, reactivate.
    pub async fn touch_federated(
        &self,
        user_id: Uuid,
        provider: &str,
        subject_id: &str,
        display_name: Option<&str>,
    ) -> Result<User, AuthError> {
        let user = sqlx::query_as::<_, User>(
            "UPDATE users SET \
               name = COALESCE(name, $1), \
               sso_provider = $2, \
               external_subject_id = $3, \
               is_active = TRUE, \
               updated_at = NOW() \
             WHERE id = $4 RETURNING *",
        )
        .bind(display_name)
        .bind(provider)
        .bind(subject_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(user)
    }

    /// Paginated tenant user listing, newest first. Page is 1-based.
    pub async fn list_org_users(
        &self,
        org_id: Uuid,
        page: i64,
        page_size: i64,
    ) -> Result<Vec<User>, AuthError> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 100);
        let users = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE organization_id = $1 \
             ORDER BY created_at DESC LIMIT $2 OFFSET $3",
        )
        .bind(org_id)
        .bind(page_size)
        .bind((page - 1) * page_size)
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    /// Change a user's role. Runs inside a transaction that locks the
    /// tenant's active admin rows so the last one can never be demoted
    /// concurrently.
    pub async fn set_role(
        &self,
        acting: &Principal,
        org_id: Uuid,
        target_user_id: Uuid,
        new_role: Role,
    ) -> Result<User, AuthError> {
        if new_role == Role::SystemAdmin && acting.role < Role::SystemAdmin {
            return Err(AuthError::Forbidden);
        }

        let mut tx = self.pool.begin().await?;

        let target = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE id = $1 AND organization_id = $2 FOR UPDATE",
        )
        .bind(target_user_id)
        .bind(org_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AuthError::NotFound)?;

        let losing_admin = target.role() == Role::Admin && new_role != Role::Admin;
        if losing_admin && target.is_active {
            self.guard_last_admin(&mut tx, org_id, target.id).await?;
        }

        let updated = sqlx::query_as::<_, User>(
            "UPDATE users SET role = $1, updated_at = NOW() WHERE id = $2 RETURNING *",
        )
        .bind(new_role.as_str())
        .bind(target.id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(
            acting = %acting.user_id,
            target = %target_user_id,
            role = %new_role,
            "user role changed"
        );
        Ok(updated)
    }

    /// Activate or deactivate a user, with the same last-admin guard.
    pub async fn set_active(
        &self,
        acting: &Principal,
        org_id: Uuid,
        target_user_id: Uuid,
        active: bool,
    ) -> Result<User, AuthError> {
        let mut tx = self.pool.begin().await?;

        let target = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE id = $1 AND organization_id = $2 FOR UPDATE",
        )
        .bind(target_user_id)
        .bind(org_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AuthError::NotFound)?;

        if !active && target.is_active && target.role() == Role::Admin {
            self.guard_last_admin(&mut tx, org_id, target.id).await?;
        }

        let updated = sqlx::query_as::<_, User>(
            "UPDATE users SET is_active = $1, updated_at = NOW() WHERE id = $2 RETURNING *",
        )
        .bind(active)
        .bind(target.id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(
            acting = %acting.user_id,
            target = %target_user_id,
            active,
            "user status changed"
        );
        Ok(updated)
    }

    /// Lock the tenant's active admins and fail unless one other than the
    /// target remains.
    async fn guard_last_admin(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        org_id: Uuid,
        target_id: Uuid,
    ) -> Result<(), AuthError> {
        let admins: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM users WHERE organization_id = $1 AND role = 'admin' \
             AND is_active = TRUE FOR UPDATE",
        )
        .bind(org_id)
        .fetch_all(&mut **tx)
        .await?;

        if !admins.iter().any(|id| *id != target_id) {
            return Err(AuthError::LastAdmin);
        }
        Ok(())
    }

    pub async fn get_organization(&self, org_id: Uuid) -> Result<Option<Organization>, AuthError> {
        let org = sqlx::query_as::<_, Organization>("SELECT * FROM organizations WHERE id = $1")
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(org)
    }
}
