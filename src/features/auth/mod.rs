pub mod jwt;
pub mod mfa;
pub mod models;
pub mod routes;
pub mod service;

// Re-export the main public types used by other modules.
pub use models::*;
pub use service::{AuthError, AuthService};
