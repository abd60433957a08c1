//! HTTP client for the dashboard backend's authentication endpoints.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::{CredentialPair, RefreshError};

use super::{ApiError, AuthApi};

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Serialize)]
struct CredentialsRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct RefreshTokenRequest<'a> {
    #[serde(rename = "refreshToken")]
    refresh_token: &'a str,
}

/// Body returned by login and refresh: either both tokens or an error
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(rename = "accessToken")]
    access_token: Option<String>,
    #[serde(rename = "refreshToken")]
    refresh_token: Option<String>,
    error: Option<String>,
}

impl TokenResponse {
    fn into_pair(self) -> std::result::Result<CredentialPair, String> {
        match (self.access_token, self.refresh_token) {
            (Some(access), Some(refresh)) if !access.is_empty() && !refresh.is_empty() => {
                Ok(CredentialPair::new(access, refresh))
            }
            _ => Err(self
                .error
                .unwrap_or_else(|| "response did not contain both tokens".to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenStatusResponse {
    #[serde(default)]
    active: bool,
}

/// API client for the dashboard backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> std::result::Result<Option<reqwest::Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Send a request, backing off on 429, and parse the JSON body.
    async fn send<T: DeserializeOwned>(
        &self,
        path: &str,
        build: impl Fn(&Client, &str) -> RequestBuilder,
    ) -> std::result::Result<T, ApiError> {
        let url = self.url(path);
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = build(&self.client, &url).send().await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => {
                    let body = response.text().await?;
                    return serde_json::from_str(&body).map_err(|e| {
                        ApiError::InvalidResponse(format!("{} from {}", e, path))
                    });
                }
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(path = path, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
            }
        }
    }

    async fn post<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> std::result::Result<T, ApiError> {
        self.send(path, |client, url| client.post(url).json(body)).await
    }

    /// Map a refresh failure onto the denial/network split the session relies on.
    /// Only an explicit rejection ends a session; anything else may be transient.
    fn classify_refresh_error(err: ApiError) -> RefreshError {
        match err {
            ApiError::Unauthorized | ApiError::Rejected(_) => RefreshError::Denied(err.to_string()),
            other => RefreshError::Network(other.to_string()),
        }
    }
}

#[async_trait]
impl AuthApi for ApiClient {
    async fn login(&self, identifier: &str, secret: &str) -> std::result::Result<CredentialPair, ApiError> {
        let body = CredentialsRequest {
            email: identifier,
            password: secret,
        };
        let response: TokenResponse = self.post("/auth/login", &body).await?;
        response.into_pair().map_err(ApiError::Rejected)
    }

    async fn register(&self, identifier: &str, secret: &str) -> std::result::Result<(), ApiError> {
        let body = CredentialsRequest {
            email: identifier,
            password: secret,
        };
        let _: serde_json::Value = self.post("/auth/register", &body).await?;
        debug!("Account registered");
        Ok(())
    }

    async fn refresh(&self, refresh_token: &str) -> std::result::Result<CredentialPair, RefreshError> {
        let body = RefreshTokenRequest { refresh_token };
        let response: TokenResponse = self
            .post("/auth/refresh", &body)
            .await
            .map_err(Self::classify_refresh_error)?;
        response.into_pair().map_err(RefreshError::Denied)
    }

    async fn revoke(&self, refresh_token: &str) -> std::result::Result<(), ApiError> {
        let body = RefreshTokenRequest { refresh_token };
        let _: serde_json::Value = self.post("/auth/logout", &body).await?;
        Ok(())
    }

    async fn token_status(&self, access_token: &str, refresh_token: &str) -> std::result::Result<bool, ApiError> {
        let response: TokenStatusResponse = self
            .send("/auth/refresh-status", |client, url| {
                client
                    .get(url)
                    .bearer_auth(access_token)
                    .query(&[("refreshToken", refresh_token)])
            })
            .await?;
        Ok(response.active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash() {
        let client = ApiClient::new("http://localhost:8080///").expect("client");
        assert_eq!(client.url("/auth/login"), "http://localhost:8080/auth/login");
    }

    #[test]
    fn test_parse_token_response() {
        let json = r#"{"accessToken": "a.b.c", "refreshToken": "d.e.f"}"#;
        let resp: TokenResponse = serde_json::from_str(json).expect("Failed to parse token JSON");
        assert_eq!(resp.into_pair(), Ok(CredentialPair::new("a.b.c", "d.e.f")));
    }

    #[test]
    fn test_parse_token_response_error() {
        let json = r#"{"error": "Invalid refresh token"}"#;
        let resp: TokenResponse = serde_json::from_str(json).expect("Failed to parse error JSON");
        assert_eq!(resp.into_pair(), Err("Invalid refresh token".to_string()));

        // One token alone is not a usable pair
        let json = r#"{"accessToken": "a.b.c"}"#;
        let resp: TokenResponse = serde_json::from_str(json).expect("Failed to parse partial JSON");
        assert!(resp.into_pair().is_err());
    }

    #[test]
    fn test_parse_token_status() {
        let resp: TokenStatusResponse = serde_json::from_str(r#"{"active": true}"#).expect("parse");
        assert!(resp.active);
        let resp: TokenStatusResponse = serde_json::from_str("{}").expect("parse");
        assert!(!resp.active);
    }

    #[test]
    fn test_classify_refresh_error() {
        assert!(matches!(
            ApiClient::classify_refresh_error(ApiError::Unauthorized),
            RefreshError::Denied(_)
        ));
        assert!(matches!(
            ApiClient::classify_refresh_error(ApiError::Rejected("expired".into())),
            RefreshError::Denied(_)
        ));
        assert!(matches!(
            ApiClient::classify_refresh_error(ApiError::ServerError("boom".into())),
            RefreshError::Network(_)
        ));
        assert!(matches!(
            ApiClient::classify_refresh_error(ApiError::InvalidResponse("html".into())),
            RefreshError::Network(_)
        ));
    }
}
