//! Remote authentication API.
//!
//! The session core talks to the server only through the `AuthApi` trait;
//! `ApiClient` is the HTTP implementation against the dashboard backend's
//! `/auth/*` endpoints.

pub mod client;
pub mod error;

use async_trait::async_trait;

use crate::auth::{CredentialPair, RefreshError};

pub use client::ApiClient;
pub use error::ApiError;

#[async_trait]
pub trait AuthApi: Send + Sync {
    /// Exchange an identifier and secret for a fresh credential pair
    async fn login(&self, identifier: &str, secret: &str) -> Result<CredentialPair, ApiError>;

    /// Create an account. Does not sign in.
    async fn register(&self, identifier: &str, secret: &str) -> Result<(), ApiError>;

    /// Exchange a refresh token for a new pair. The server rotates the
    /// refresh token on every success.
    async fn refresh(&self, refresh_token: &str) -> Result<CredentialPair, RefreshError>;

    /// Best-effort server-side revocation of a refresh token
    async fn revoke(&self, refresh_token: &str) -> Result<(), ApiError>;

    /// Diagnostic: whether the server still holds the refresh token as active
    async fn token_status(&self, access_token: &str, refresh_token: &str) -> Result<bool, ApiError>;
}
