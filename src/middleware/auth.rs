use crate::config::Config;
use crate::features::auth::jwt;
use crate::features::auth::models::{Principal, Role};
use crate::features::auth::service::AuthError;
use axum::{
    extract::Request,
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
    Extension,
};
use std::sync::Arc;
use uuid::Uuid;

/// Guard for everything under the protected prefix.
///
/// Extracts the bearer token, verifies it, injects the [`Principal`] into
/// request extensions, and enforces the tenant-path invariant: when the
/// route carries an organization id segment it must equal the token's
/// organization. System admins are the only exemption. Stateless and
/// re-entrant.
pub async fn auth_middleware(
    Extension(config): Extension<Arc<Config>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let token = bearer_token(&req).ok_or(AuthError::BadCredentials)?;
    let principal = jwt::verify(&token, &config)?;

    if let Some(path_org) = org_id_in_path(req.uri().path()) {
        let exempt = principal.role == Role::SystemAdmin;
        if !exempt && principal.organization_id != Some(path_org) {
            tracing::warn!(
                user_id = %principal.user_id,
                path_org = %path_org,
                "tenant mismatch on protected route"
            );
            return Err(AuthError::TenantMismatch);
        }
    }

    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

/// Minimum-role gate for admin routes. Layered inside `auth_middleware`, so
/// the principal is already present.
pub async fn require_admin(
    Extension(principal): Extension<Principal>,
    req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    require_role(&principal, Role::Admin)?;
    Ok(next.run(req).await)
}

pub fn require_role(principal: &Principal, minimum: Role) -> Result<(), AuthError> {
    if principal.role < minimum {
        tracing::warn!(
            user_id = %principal.user_id,
            role = %principal.role,
            required = %minimum,
            "insufficient role"
        );
        return Err(AuthError::Forbidden);
    }
    Ok(())
}

fn bearer_token(req: &Request) -> Option<String> {
    let header = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    header
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// The organization id is the path segment following `organizations`, when
/// present.
fn org_id_in_path(path: &str) -> Option<Uuid> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    while let Some(segment) = segments.next() {
        if segment == "organizations" {
            return segments.next().and_then(|s| Uuid::parse_str(s).ok());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn org_id_extraction() {
        let org = Uuid::new_v4();
        let path = format!("/api/v1/organizations/{}/users/abc/role", org);
        assert_eq!(org_id_in_path(&path), Some(org));

        assert_eq!(org_id_in_path("/api/v1/me"), None);
        assert_eq!(org_id_in_path("/api/v1/organizations/not-a-uuid/users"), None);
    }

    #[test]
    fn role_gate_respects_hierarchy() {
        let principal = |role| Principal {
            user_id: Uuid::new_v4(),
            organization_id: None,
            role,
            email: None,
        };

        assert!(require_role(&principal(Role::Admin), Role::Admin).is_ok());
        assert!(require_role(&principal(Role::SystemAdmin), Role::Admin).is_ok());
        assert!(require_role(&principal(Role::Manager), Role::Admin).is_err());
        assert!(require_role(&principal(Role::User), Role::Manager).is_err());
    }
}
