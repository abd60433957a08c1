//! tokenkeeper - session token lifecycle management for the dashboard.
//!
//! Owns the access/refresh token pair of the signed-in user: decodes claims,
//! persists the pair, renews it before expiry without ever issuing two
//! renewals for the same refresh token, and tears everything down on logout.

pub mod api;
pub mod auth;
pub mod config;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ApiClient, ApiError, AuthApi};
pub use auth::{AuthError, AuthGate, CredentialPair, SessionManager, SessionSnapshot};
pub use config::Config;
