pub mod models;
pub mod oauth;
pub mod provisioning;
pub mod routes;
pub mod saml;
