//! Application configuration management.
//!
//! This module handles loading and saving the application configuration,
//! which includes the API base URL, the storage backend for the session,
//! the renewal schedule and the last used identifier.
//!
//! Configuration is stored at `~/.config/tokenkeeper/config.json`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::gate::DEFAULT_LOGIN_ROUTE;
use crate::auth::{FileTokenStore, KeyringTokenStore, MemoryTokenStore, RenewalPolicy, TokenStore};

/// Application name used for config/data directory paths
const APP_NAME: &str = "tokenkeeper";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding the configured API base URL
pub const API_BASE_ENV: &str = "TOKENKEEPER_API_BASE";

const DEFAULT_API_BASE: &str = "http://localhost:8080";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Keyring,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base: Option<String>,
    pub storage: StorageBackend,
    pub last_identifier: Option<String>,
    pub renew_margin_secs: u64,
    pub max_renewal_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub login_route: String,
}

impl Default for Config {
    fn default() -> Self {
        let policy = RenewalPolicy::default();
        Self {
            api_base: None,
            storage: StorageBackend::default(),
            last_identifier: None,
            renew_margin_secs: policy.margin.as_secs(),
            max_renewal_attempts: policy.max_attempts,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
            login_route: DEFAULT_LOGIN_ROUTE.to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .context("Failed to read config file")?;
            Ok(serde_json::from_str(&contents).context("Failed to parse config file")?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Per-profile directory for the stored session and rotation history
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// API base URL: environment override first, then config, then default
    pub fn api_base(&self) -> String {
        std::env::var(API_BASE_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.api_base.clone())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
    }

    pub fn renewal_policy(&self) -> RenewalPolicy {
        RenewalPolicy {
            margin: Duration::from_secs(self.renew_margin_secs),
            max_attempts: self.max_renewal_attempts.max(1),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    pub fn token_store(&self) -> Result<Arc<dyn TokenStore>> {
        Ok(match self.storage {
            StorageBackend::File => Arc::new(FileTokenStore::new(self.data_dir()?)),
            StorageBackend::Keyring => Arc::new(KeyringTokenStore::new(APP_NAME)),
            StorageBackend::Memory => Arc::new(MemoryTokenStore::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_round_trips() {
        let config = Config::default();
        assert_eq!(config.renewal_policy(), RenewalPolicy::default());
        assert_eq!(config.login_route, "/login");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"storage": "keyring", "renew_margin_secs": 120}"#)
                .expect("parse config");
        assert_eq!(config.storage, StorageBackend::Keyring);
        assert_eq!(config.renewal_policy().margin, Duration::from_secs(120));
        assert_eq!(config.renewal_policy().max_attempts, 3);
    }

    #[test]
    fn test_zero_attempts_is_clamped() {
        let config = Config {
            max_renewal_attempts: 0,
            ..Config::default()
        };
        assert_eq!(config.renewal_policy().max_attempts, 1);
    }

    #[test]
    fn test_api_base_from_config() {
        let config = Config {
            api_base: Some("https://queue.example.com".to_string()),
            ..Config::default()
        };
        // Only meaningful when the override is not set in the test environment
        if std::env::var(API_BASE_ENV).is_err() {
            assert_eq!(config.api_base(), "https://queue.example.com");
            assert_eq!(Config::default().api_base(), DEFAULT_API_BASE);
        }
    }
}
