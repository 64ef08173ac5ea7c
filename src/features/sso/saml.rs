use crate::crypto;
use crate::features::auth::service::AuthError;
use crate::features::sso::models::{AttributeMap, SamlIdpConfig};
use chrono::{DateTime, Duration, Utc};
use flate2::write::DeflateEncoder;
use flate2::Compression;
use quick_xml::events::Event;
use quick_xml::Reader;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::signature::Verifier;
use rsa::{BigUint, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use x509_parser::prelude::FromDer;

/// Clock skew tolerated on assertion validity windows.
const SKEW_SECS: i64 = 60;

/// How long an outstanding AuthnRequest id stays answerable.
const REQUEST_TTL_SECS: i64 = 600;

const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";

/// Process-wide SAML state: outstanding AuthnRequest ids and the assertion
/// replay cache. Both evict expired entries on insert.
#[derive(Clone, Default)]
pub struct SamlBroker {
    outstanding: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
    replay: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl SamlBroker {
    pub fn register_request(&self, request_id: &str) {
        let now = Utc::now();
        let mut outstanding = self.outstanding.lock().expect("saml state poisoned");
        outstanding.retain(|_, deadline| *deadline > now);
        outstanding.insert(
            request_id.to_string(),
            now + Duration::seconds(REQUEST_TTL_SECS),
        );
    }

    /// Consume an outstanding request id. False when unknown or expired.
    pub fn take_request(&self, request_id: &str) -> bool {
        let mut outstanding = self.outstanding.lock().expect("saml state poisoned");
        match outstanding.remove(request_id) {
            Some(deadline) => deadline > Utc::now(),
            None => false,
        }
    }

    /// Record an assertion id; false when it was already seen (replay).
    /// Entries live as long as the assertion itself is valid.
    pub fn record_assertion(&self, assertion_id: &str, valid_until: DateTime<Utc>) -> bool {
        let now = Utc::now();
        let mut replay = self.replay.lock().expect("saml state poisoned");
        replay.retain(|_, deadline| *deadline > now);
        if replay.contains_key(assertion_id) {
            return false;
        }
        replay.insert(assertion_id.to_string(), valid_until + Duration::seconds(SKEW_SECS));
        true
    }
}

pub fn sp_entity_id(app_root_url: &str, idp_id: Uuid) -> String {
    format!("{}/auth/saml/{}/metadata", app_root_url.trim_end_matches('/'), idp_id)
}

pub fn acs_url(app_root_url: &str, idp_id: Uuid) -> String {
    format!("{}/auth/saml/{}/acs", app_root_url.trim_end_matches('/'), idp_id)
}

/// SP metadata document: entity id (= the metadata URL itself) and ACS.
pub fn metadata_xml(sp_entity_id: &str, acs_url: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{sp_entity_id}">
  <md:SPSSODescriptor AuthnRequestsSigned="false" WantAssertionsSigned="true" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
    <md:NameIDFormat>urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress</md:NameIDFormat>
    <md:AssertionConsumerService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="{acs_url}" index="0" isDefault="true"/>
  </md:SPSSODescriptor>
</md:EntityDescriptor>"#
    )
}

/// Build an AuthnRequest for the HTTP-Redirect binding. Returns the request
/// id (to be registered as outstanding) and the XML document.
pub fn build_authn_request(
    sp_entity_id: &str,
    acs_url: &str,
    idp_sso_url: &str,
) -> (String, String) {
    let request_id = format!("_{}", hex::encode(Uuid::new_v4().as_bytes()));
    let issue_instant = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    let xml = format!(
        r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{request_id}" Version="2.0" IssueInstant="{issue_instant}" Destination="{idp_sso_url}" AssertionConsumerServiceURL="{acs_url}" ProtocolBinding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST"><saml:Issuer>{sp_entity_id}</saml:Issuer><samlp:NameIDPolicy Format="urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress" AllowCreate="true"/></samlp:AuthnRequest>"#
    );
    (request_id, xml)
}

/// Deflate + base64 for the Redirect binding's SAMLRequest parameter.
pub fn encode_redirect_payload(xml: &str) -> Result<String, AuthError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(xml.as_bytes())
        .map_err(|e| AuthError::Internal(e.to_string()))?;
    let deflated = encoder.finish().map_err(|e| AuthError::Internal(e.to_string()))?;
    Ok(base64::encode_config(deflated, base64::STANDARD))
}

/// Final redirect to the IdP SSO URL with SAMLRequest and RelayState.
pub fn redirect_url(
    idp_sso_url: &str,
    saml_request: &str,
    relay_state: &str,
) -> Result<String, AuthError> {
    let mut url = reqwest::Url::parse(idp_sso_url)
        .map_err(|_| AuthError::Internal("invalid IdP SSO URL".into()))?;
    url.query_pairs_mut()
        .append_pair("SAMLRequest", saml_request)
        .append_pair("RelayState", relay_state);
    Ok(url.into())
}

/// Fresh RelayState nonce bound to the browser through a cookie.
pub fn relay_state_nonce() -> String {
    crypto::random_token(16)
}

/// Everything pulled out of a SAML response document in one parse.
#[derive(Debug, Default)]
struct ParsedResponse {
    destination: Option<String>,
    in_response_to: Option<String>,
    status_code: Option<String>,
    issuer: Option<String>,
    assertion_id: Option<String>,
    not_before: Option<String>,
    not_on_or_after: Option<String>,
    audience: Option<String>,
    name_id: Option<String>,
    attributes: HashMap<String, Vec<String>>,
    signature_value: Option<String>,
    digest_value: Option<String>,
}

/// A verified assertion, reduced to what provisioning needs.
#[derive(Debug)]
pub struct VerifiedAssertion {
    pub subject_id: String,
    pub email: String,
    pub display_name: Option<String>,
}

/// What the SP expects the assertion to assert.
pub struct SpExpectations<'a> {
    pub acs_url: &'a str,
    pub sp_entity_id: &'a str,
}

fn assertion_invalid(reason: &str) -> AuthError {
    tracing::warn!(reason, "saml assertion rejected");
    AuthError::BadCredentials
}

/// Full ACS-side verification: signature, destination, issuer, validity
/// window (±60 s), audience, InResponseTo, replay. All checks must hold.
pub fn validate_response(
    decoded_xml: &str,
    idp: &SamlIdpConfig,
    attribute_map: &AttributeMap,
    expect: &SpExpectations<'_>,
    broker: &SamlBroker,
) -> Result<VerifiedAssertion, AuthError> {
    let key = rsa_public_key_from_cert_pem(&idp.idp_certificate)?;
    validate_response_with_key(decoded_xml, &key, idp, attribute_map, expect, broker)
}

/// Verification seam below certificate parsing, so tests can drive it with
/// a bare key pair.
pub(crate) fn validate_response_with_key(
    decoded_xml: &str,
    idp_key: &RsaPublicKey,
    idp: &SamlIdpConfig,
    attribute_map: &AttributeMap,
    expect: &SpExpectations<'_>,
    broker: &SamlBroker,
) -> Result<VerifiedAssertion, AuthError> {
    let parsed = parse_response(decoded_xml)?;

    match parsed.status_code.as_deref() {
        Some(STATUS_SUCCESS) => {}
        _ => return Err(assertion_invalid("status is not Success")),
    }

    verify_signature(decoded_xml, &parsed, idp_key)?;

    if parsed.destination.as_deref() != Some(expect.acs_url) {
        return Err(assertion_invalid("destination does not match ACS URL"));
    }
    if parsed.issuer.as_deref() != Some(idp.idp_entity_id.as_str()) {
        return Err(assertion_invalid("issuer does not match IdP entity id"));
    }

    let now = Utc::now();
    let not_before = parse_instant(parsed.not_before.as_deref())
        .ok_or_else(|| assertion_invalid("missing NotBefore"))?;
    let not_on_or_after = parse_instant(parsed.not_on_or_after.as_deref())
        .ok_or_else(|| assertion_invalid("missing NotOnOrAfter"))?;
    if now < not_before - Duration::seconds(SKEW_SECS) {
        return Err(assertion_invalid("assertion not yet valid"));
    }
    if now > not_on_or_after + Duration::seconds(SKEW_SECS) {
        return Err(assertion_invalid("assertion expired"));
    }

    if parsed.audience.as_deref() != Some(expect.sp_entity_id) {
        return Err(assertion_invalid("audience does not match SP entity id"));
    }

    if let Some(in_response_to) = parsed.in_response_to.as_deref() {
        if !broker.take_request(in_response_to) {
            return Err(assertion_invalid("InResponseTo does not match an outstanding request"));
        }
    }

    let assertion_id = parsed
        .assertion_id
        .as_deref()
        .ok_or_else(|| assertion_invalid("missing assertion id"))?;
    if !broker.record_assertion(assertion_id, not_on_or_after) {
        return Err(assertion_invalid("assertion replayed"));
    }

    let email = parsed
        .attributes
        .get(&attribute_map.email)
        .and_then(|v| v.first())
        .cloned()
        .ok_or_else(|| {
            AuthError::InvalidInput("identity provider did not supply an email".into())
        })?;

    let first = parsed
        .attributes
        .get(&attribute_map.first_name)
        .and_then(|v| v.first())
        .cloned();
    let last = parsed
        .attributes
        .get(&attribute_map.last_name)
        .and_then(|v| v.first())
        .cloned();
    let display_name = match (first, last) {
        (Some(f), Some(l)) => Some(format!("{} {}", f, l)),
        (Some(f), None) => Some(f),
        (None, Some(l)) => Some(l),
        (None, None) => None,
    };

    let subject_id = parsed
        .name_id
        .clone()
        .unwrap_or_else(|| email.clone());

    Ok(VerifiedAssertion {
        subject_id,
        email,
        display_name,
    })
}

fn parse_instant(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// XML parsing
// ---------------------------------------------------------------------------

fn parse_response(xml: &str) -> Result<ParsedResponse, AuthError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut parsed = ParsedResponse::default();
    let mut stack: Vec<String> = Vec::new();
    let mut current_attribute: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let local = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                handle_element_start(&mut parsed, &mut current_attribute, &local, &e)?;
                stack.push(local);
            }
            Ok(Event::Empty(e)) => {
                let local = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                handle_element_start(&mut parsed, &mut current_attribute, &local, &e)?;
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|_| assertion_invalid("unreadable text node"))?
                    .trim()
                    .to_string();
                if text.is_empty() {
                    continue;
                }
                match stack.last().map(String::as_str) {
                    Some("Issuer") if parsed.issuer.is_none() => parsed.issuer = Some(text),
                    Some("Audience") if parsed.audience.is_none() => parsed.audience = Some(text),
                    Some("NameID") if parsed.name_id.is_none() => parsed.name_id = Some(text),
                    Some("SignatureValue") if parsed.signature_value.is_none() => {
                        parsed.signature_value = Some(text)
                    }
                    Some("DigestValue") if parsed.digest_value.is_none() => {
                        parsed.digest_value = Some(text)
                    }
                    Some("AttributeValue") => {
                        if let Some(name) = &current_attribute {
                            parsed.attributes.entry(name.clone()).or_default().push(text);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                let local = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if local == "Attribute" {
                    current_attribute = None;
                }
                stack.pop();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(_) => return Err(assertion_invalid("malformed XML")),
        }
    }

    Ok(parsed)
}

fn handle_element_start(
    parsed: &mut ParsedResponse,
    current_attribute: &mut Option<String>,
    local: &str,
    e: &quick_xml::events::BytesStart<'_>,
) -> Result<(), AuthError> {
    let attr = |name: &str| -> Option<String> {
        e.attributes().flatten().find_map(|a| {
            if a.key.local_name().as_ref() == name.as_bytes() {
                a.unescape_value().ok().map(|v| v.to_string())
            } else {
                None
            }
        })
    };

    match local {
        "Response" => {
            parsed.destination = attr("Destination");
            parsed.in_response_to = attr("InResponseTo");
        }
        "StatusCode" => {
            if parsed.status_code.is_none() {
                parsed.status_code = attr("Value");
            }
        }
        "Assertion" => {
            if parsed.assertion_id.is_none() {
                parsed.assertion_id = attr("ID");
            }
        }
        "Conditions" => {
            parsed.not_before = attr("NotBefore");
            parsed.not_on_or_after = attr("NotOnOrAfter");
        }
        "Attribute" => {
            *current_attribute = attr("Name");
        }
        _ => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Signature verification
// ---------------------------------------------------------------------------

/// Extract the RSA public key out of a PEM X.509 certificate.
pub fn rsa_public_key_from_cert_pem(cert_pem: &str) -> Result<RsaPublicKey, AuthError> {
    let block = pem::parse(cert_pem.trim())
        .map_err(|_| AuthError::Internal("IdP certificate is not valid PEM".into()))?;
    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(block.contents())
        .map_err(|_| AuthError::Internal("IdP certificate is not valid X.509".into()))?;
    match cert
        .public_key()
        .parsed()
        .map_err(|_| AuthError::Internal("unreadable certificate public key".into()))?
    {
        x509_parser::public_key::PublicKey::RSA(rsa) => RsaPublicKey::new(
            BigUint::from_bytes_be(rsa.modulus),
            BigUint::from_bytes_be(rsa.exponent),
        )
        .map_err(|_| AuthError::Internal("invalid RSA key in certificate".into())),
        _ => Err(AuthError::Internal("IdP certificate key is not RSA".into())),
    }
}

/// Verify the XML signature: RSA-SHA256 over the SignedInfo octets as
/// transmitted, and the reference digest recomputed over the document with
/// the Signature element spliced out. Documents already in canonical form
/// (the common IdP case) verify; anything else fails closed.
fn verify_signature(
    xml: &str,
    parsed: &ParsedResponse,
    key: &RsaPublicKey,
) -> Result<(), AuthError> {
    let signature_b64 = parsed
        .signature_value
        .as_deref()
        .ok_or_else(|| assertion_invalid("missing signature"))?;
    let digest_b64 = parsed
        .digest_value
        .as_deref()
        .ok_or_else(|| assertion_invalid("missing reference digest"))?;

    let (start, end) = find_element_span(xml, "SignedInfo", 0)
        .ok_or_else(|| assertion_invalid("missing SignedInfo"))?;
    let signed_info = &xml[start..end];

    let signature_bytes = decode_b64_loose(signature_b64)
        .ok_or_else(|| assertion_invalid("undecodable signature value"))?;
    let signature = Signature::try_from(signature_bytes.as_slice())
        .map_err(|_| assertion_invalid("malformed signature value"))?;
    VerifyingKey::<Sha256>::new(key.clone())
        .verify(signed_info.as_bytes(), &signature)
        .map_err(|_| assertion_invalid("signature does not verify"))?;

    let digest_bytes = decode_b64_loose(digest_b64)
        .ok_or_else(|| assertion_invalid("undecodable digest value"))?;
    let mut stripped = xml.to_string();
    while let Some((s, e)) = find_element_span(&stripped, "Signature", 0) {
        stripped.replace_range(s..e, "");
    }
    let computed = Sha256::digest(stripped.as_bytes());
    if computed.as_slice() != digest_bytes.as_slice() {
        return Err(assertion_invalid("reference digest mismatch"));
    }
    Ok(())
}

pub(crate) fn decode_b64_loose(input: &str) -> Option<Vec<u8>> {
    let compact: String = input.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    base64::decode_config(compact, base64::STANDARD).ok()
}

/// Byte span of the first element whose local name matches, from the
/// opening `<` through the matching end tag. Prefix-agnostic; assumes the
/// element does not nest within itself, which holds for the signature
/// elements this is used on.
fn find_element_span(xml: &str, local: &str, from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    let start = loop {
        let open = xml[i..].find('<')? + i;
        let rest = &xml[open + 1..];
        if rest.starts_with('/') || rest.starts_with('?') || rest.starts_with('!') {
            i = open + 1;
            continue;
        }
        let name_end = rest
            .find(|c: char| c == ' ' || c == '>' || c == '/' || c == '\t' || c == '\n')
            .unwrap_or(rest.len());
        let name = &rest[..name_end];
        let local_part = name.rsplit(':').next().unwrap_or(name);
        if local_part == local {
            break open;
        }
        i = open + 1;
    };

    // Find the matching close tag.
    let mut j = start;
    loop {
        let close = xml[j..].find("</")? + j;
        let rest = &xml[close + 2..];
        let name_end = rest.find('>')?;
        let name = rest[..name_end].trim();
        let local_part = name.rsplit(':').next().unwrap_or(name);
        if local_part == local {
            return Some((start, close + 2 + name_end + 1));
        }
        j = close + 2;
    }
}
