use crate::config::Config;
use crate::features::auth::models::User;
use crate::features::auth::service::AuthError;
use crate::features::sso::models::{ExternalIdentity, OrgBinding};
use crate::features::users::service::{FederatedUserSpec, UserService};
use uuid::Uuid;

/// Outcome of the provisioning decision table for one verified identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Returning federated user: refresh last-seen data and issue.
    Refresh { user_id: Uuid },
    /// Existing account matched by email: attach the federated identity.
    Link { user_id: Uuid },
    /// No account: create one in the given tenant (or unattached).
    Create { organization_id: Option<Uuid> },
    /// Global provisioning is disabled and nobody matched.
    Reject,
}

/// The decision table. Pure so every row is unit-testable:
///
/// * subject match wins over email match (returning user),
/// * email match links, leaving the account's tenant untouched,
/// * no match creates org-scoped, or consults the global-creation policy.
pub fn decide(
    by_subject: Option<&User>,
    by_email: Option<&User>,
    binding: OrgBinding,
    allow_global_creation: bool,
    global_default_org: Option<Uuid>,
) -> Decision {
    if let Some(user) = by_subject {
        return Decision::Refresh { user_id: user.id };
    }
    if let Some(user) = by_email {
        return Decision::Link { user_id: user.id };
    }
    match binding {
        OrgBinding::Org(org_id) => Decision::Create {
            organization_id: Some(org_id),
        },
        OrgBinding::Global => {
            if !allow_global_creation {
                Decision::Reject
            } else {
                Decision::Create {
                    organization_id: global_default_org,
                }
            }
        }
    }
}

/// Applies the decision table to the identity store.
#[derive(Clone)]
pub struct ProvisioningEngine {
    users: UserService,
    allow_global_creation: bool,
    global_default_org: Option<Uuid>,
}

impl ProvisioningEngine {
    pub fn new(users: UserService, config: &Config) -> Self {
        Self {
            users,
            allow_global_creation: config.sso_allow_user_creation,
            global_default_org: config.sso_default_org_id,
        }
    }

    /// Map a verified external identity to an internal user, creating or
    /// linking as the table dictates.
    pub async fn provision(
        &self,
        identity: &ExternalIdentity,
        binding: OrgBinding,
    ) -> Result<User, AuthError> {
        let org_filter = match binding {
            OrgBinding::Org(org_id) => Some(org_id),
            OrgBinding::Global => None,
        };

        let by_subject = self
            .users
            .get_user_by_external(&identity.provider, &identity.subject_id, org_filter)
            .await?;

        // Email linking is tenant-bound for org IdPs and global for the
        // global IdP.
        let by_email = match self.users.get_user_by_email(&identity.email).await? {
            Some(user) => match binding {
                OrgBinding::Org(org_id) if user.organization_id != Some(org_id) => None,
                _ => Some(user),
            },
            None => None,
        };

        let decision = decide(
            by_subject.as_ref(),
            by_email.as_ref(),
            binding,
            self.allow_global_creation,
            self.global_default_org,
        );

        match decision {
            Decision::Refresh { user_id } => {
                self.users
                    .touch_federated(
                        user_id,
                        &identity.provider,
                        &identity.subject_id,
                        identity.display_name.as_deref(),
                    )
                    .await
            }
            Decision::Link { user_id } => {
                self.users
                    .link_external(user_id, &identity.provider, &identity.subject_id)
                    .await
            }
            Decision::Create { organization_id } => {
                if let Some(org_id) = organization_id {
                    if self.users.get_organization(org_id).await?.is_none() {
                        return Err(AuthError::Internal(
                            "configured organization does not exist".into(),
                        ));
                    }
                }
                self.users
                    .create_federated(&FederatedUserSpec {
                        email: identity.email.clone(),
                        name: identity.display_name.clone(),
                        organization_id,
                        provider: identity.provider.clone(),
                        subject_id: identity.subject_id.clone(),
                    })
                    .await
            }
            Decision::Reject => {
                tracing::warn!(
                    provider = %identity.provider,
                    "global provisioning disabled, rejecting unknown identity"
                );
                Err(AuthError::Forbidden)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user_in(org: Option<Uuid>) -> User {
        User {
            id: Uuid::new_v4(),
            organization_id: org,
            email: "someone@ex.com".into(),
            name: None,
            password_hash: "!sso".into(),
            role: "user".into(),
            is_active: true,
            sso_provider: Some("google".into()),
            external_subject_id: Some("gg-42".into()),
            totp_secret_enc: None,
            is_totp_enabled: false,
            backup_codes_enc: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn org_scoped_subject_match_refreshes() {
        let org = Uuid::new_v4();
        let existing = user_in(Some(org));
        let d = decide(Some(&existing), None, OrgBinding::Org(org), false, None);
        assert_eq!(d, Decision::Refresh { user_id: existing.id });
    }

    #[test]
    fn org_scoped_email_match_links() {
        let org = Uuid::new_v4();
        let existing = user_in(Some(org));
        let d = decide(None, Some(&existing), OrgBinding::Org(org), false, None);
        assert_eq!(d, Decision::Link { user_id: existing.id });
    }

    #[test]
    fn org_scoped_no_match_creates_in_that_org() {
        let org = Uuid::new_v4();
        let d = decide(None, None, OrgBinding::Org(org), false, None);
        assert_eq!(d, Decision::Create { organization_id: Some(org) });
    }

    #[test]
    fn subject_match_wins_over_email_match() {
        let org = Uuid::new_v4();
        let by_subject = user_in(Some(org));
        let by_email = user_in(Some(org));
        let d = decide(
            Some(&by_subject),
            Some(&by_email),
            OrgBinding::Org(org),
            false,
            None,
        );
        assert_eq!(d, Decision::Refresh { user_id: by_subject.id });
    }

    #[test]
    fn global_email_match_links_without_moving_tenant() {
        let existing = user_in(Some(Uuid::new_v4()));
        let d = decide(None, Some(&existing), OrgBinding::Global, true, None);
        assert_eq!(d, Decision::Link { user_id: existing.id });
    }

    #[test]
    fn global_creation_disabled_rejects() {
        let d = decide(None, None, OrgBinding::Global, false, Some(Uuid::new_v4()));
        assert_eq!(d, Decision::Reject);
    }

    #[test]
    fn global_creation_with_default_org() {
        let default_org = Uuid::new_v4();
        let d = decide(None, None, OrgBinding::Global, true, Some(default_org));
        assert_eq!(d, Decision::Create { organization_id: Some(default_org) });
    }

    #[test]
    fn global_creation_without_default_is_unattached() {
        let d = decide(None, None, OrgBinding::Global, true, None);
        assert_eq!(d, Decision::Create { organization_id: None });
    }
}
