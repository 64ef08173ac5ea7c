use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Tenant-scoped federation config row. The `config_enc` blob is AES-GCM
/// ciphertext holding the provider-specific settings (client secret, IdP
/// certificate); it never leaves the process decrypted.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct IdentityProvider {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub idp_type: String,
    pub name: String,
    pub is_active: bool,
    pub is_public: bool,
    #[serde(skip_serializing)]
    pub config_enc: String,
    pub attribute_map: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdpType {
    Saml,
    Oauth2Google,
    Oauth2Github,
}

impl IdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdpType::Saml => "saml",
            IdpType::Oauth2Google => "oauth2_google",
            IdpType::Oauth2Github => "oauth2_github",
        }
    }
}

impl fmt::Display for IdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdpType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "saml" => Ok(IdpType::Saml),
            "oauth2_google" => Ok(IdpType::Oauth2Google),
            "oauth2_github" => Ok(IdpType::Oauth2Github),
            _ => Err(()),
        }
    }
}

/// Decrypted SAML IdP settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamlIdpConfig {
    pub idp_entity_id: String,
    pub idp_sso_url: String,
    /// PEM-encoded X.509 signing certificate of the IdP.
    pub idp_certificate: String,
}

/// Decrypted OAuth2 client settings for an org-scoped IdP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OauthIdpConfig {
    pub client_id: String,
    pub client_secret: String,
}

/// How SAML attribute names map onto the fields we need. Defaults cover the
/// common friendly names; OID forms are configurable per IdP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeMap {
    #[serde(default = "default_email_attr")]
    pub email: String,
    #[serde(default = "default_first_name_attr")]
    pub first_name: String,
    #[serde(default = "default_last_name_attr")]
    pub last_name: String,
}

fn default_email_attr() -> String {
    "email".into()
}

fn default_first_name_attr() -> String {
    "firstName".into()
}

fn default_last_name_attr() -> String {
    "lastName".into()
}

impl Default for AttributeMap {
    fn default() -> Self {
        AttributeMap {
            email: default_email_attr(),
            first_name: default_first_name_attr(),
            last_name: default_last_name_attr(),
        }
    }
}

impl AttributeMap {
    pub fn from_stored(value: Option<&serde_json::Value>) -> Self {
        value
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }
}

/// A verified external identity, normalized across SAML and OAuth2.
#[derive(Debug, Clone)]
pub struct ExternalIdentity {
    /// Provider tag recorded on the user row: `google`, `github` or `saml`.
    pub provider: String,
    pub subject_id: String,
    pub email: String,
    pub display_name: Option<String>,
}

/// Which tenant a federated login binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrgBinding {
    /// Org-scoped IdP: the new or linked user belongs to this tenant.
    Org(Uuid),
    /// Global IdP: provisioning rules come from process configuration.
    Global,
}

/// Entry in the anonymous discovery feed.
#[derive(Debug, Serialize)]
pub struct PublicIdpEntry {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub idp_type: String,
    pub provider_slug: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_map_defaults_apply() {
        let map = AttributeMap::from_stored(None);
        assert_eq!(map.email, "email");
        assert_eq!(map.first_name, "firstName");
        assert_eq!(map.last_name, "lastName");
    }

    #[test]
    fn attribute_map_accepts_oid_forms() {
        let stored = serde_json::json!({
            "email": "urn:oid:0.9.2342.19200300.100.1.3",
            "first_name": "urn:oid:2.5.4.42",
        });
        let map = AttributeMap::from_stored(Some(&stored));
        assert_eq!(map.email, "urn:oid:0.9.2342.19200300.100.1.3");
        assert_eq!(map.first_name, "urn:oid:2.5.4.42");
        assert_eq!(map.last_name, "lastName");
    }

    #[test]
    fn idp_type_round_trips() {
        for t in [IdpType::Saml, IdpType::Oauth2Google, IdpType::Oauth2Github] {
            assert_eq!(IdpType::from_str(t.as_str()), Ok(t));
        }
        assert!(IdpType::from_str("ldap").is_err());
    }
}
