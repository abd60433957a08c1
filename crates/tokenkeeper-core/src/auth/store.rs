use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};

/// Session file name in the profile data directory
const SESSION_FILE: &str = "session.json";

/// Keychain account under which the current pair is stored
const KEYRING_ACCOUNT: &str = "current-session";

/// The access/refresh token pair. Always stored and loaded together.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct CredentialPair {
    #[serde(rename = "accessToken")]
    pub access_token: String,
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

// Tokens must never reach log output in full
impl std::fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &crate::utils::mask_token(&self.access_token))
            .field("refresh_token", &crate::utils::mask_token(&self.refresh_token))
            .finish()
    }
}

/// Durable single-slot storage for the current credential pair.
///
/// There is exactly one current session per profile: `save` overwrites
/// whatever was stored before, regardless of subject.
pub trait TokenStore: Send + Sync {
    fn save(&self, pair: &CredentialPair) -> Result<()>;
    fn load(&self) -> Result<Option<CredentialPair>>;
    fn clear(&self) -> Result<()>;
}

/// Stores the pair as JSON in the profile data directory.
pub struct FileTokenStore {
    data_dir: PathBuf,
}

impl FileTokenStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    fn session_path(&self) -> PathBuf {
        self.data_dir.join(SESSION_FILE)
    }
}

impl TokenStore for FileTokenStore {
    fn save(&self, pair: &CredentialPair) -> Result<()> {
        let path = self.session_path();
        std::fs::create_dir_all(&self.data_dir)
            .context("Failed to create session directory")?;

        // Write beside the target and rename so readers never see half a pair
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(pair)?;
        std::fs::write(&tmp, contents).context("Failed to write session file")?;
        std::fs::rename(&tmp, &path).context("Failed to replace session file")?;
        Ok(())
    }

    fn load(&self) -> Result<Option<CredentialPair>> {
        let path = self.session_path();
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)
            .context("Failed to read session file")?;
        let pair: CredentialPair = serde_json::from_str(&contents)
            .context("Failed to parse session file")?;
        Ok(Some(pair))
    }

    fn clear(&self) -> Result<()> {
        let path = self.session_path();
        if path.exists() {
            std::fs::remove_file(path).context("Failed to remove session file")?;
        }
        Ok(())
    }
}

/// Stores the pair in the OS keychain as a single entry.
pub struct KeyringTokenStore {
    service: String,
}

impl KeyringTokenStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(&self.service, KEYRING_ACCOUNT).context("Failed to create keyring entry")
    }
}

impl TokenStore for KeyringTokenStore {
    fn save(&self, pair: &CredentialPair) -> Result<()> {
        let contents = serde_json::to_string(pair)?;
        self.entry()?
            .set_password(&contents)
            .context("Failed to store session in keychain")?;
        Ok(())
    }

    fn load(&self) -> Result<Option<CredentialPair>> {
        match self.entry()?.get_password() {
            Ok(contents) => {
                let pair = serde_json::from_str(&contents)
                    .context("Failed to parse session from keychain")?;
                Ok(Some(pair))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(anyhow!(e).context("Failed to read session from keychain")),
        }
    }

    fn clear(&self) -> Result<()> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(anyhow!(e).context("Failed to delete session from keychain")),
        }
    }
}

/// Process-local store for ephemeral sessions.
#[derive(Default)]
pub struct MemoryTokenStore {
    slot: Mutex<Option<CredentialPair>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            slot: Mutex::new(Some(pair)),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn save(&self, pair: &CredentialPair) -> Result<()> {
        let mut slot = self.slot.lock().map_err(|_| anyhow!("token store lock poisoned"))?;
        *slot = Some(pair.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<CredentialPair>> {
        let slot = self.slot.lock().map_err(|_| anyhow!("token store lock poisoned"))?;
        Ok(slot.clone())
    }

    fn clear(&self) -> Result<()> {
        let mut slot = self.slot.lock().map_err(|_| anyhow!("token store lock poisoned"))?;
        *slot = None;
        Ok(())
    }
}
