//! Per-subject audit trail of refresh-token rotations.
//!
//! Diagnostics only: entries hold masked tokens and nothing here is
//! consulted when deciding whether a session is valid.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::utils::mask_token;

/// Rotation history file name in the profile data directory
const LEDGER_FILE: &str = "rotation_history.json";

/// Maximum entries kept per subject
pub const MAX_ROTATIONS_PER_SUBJECT: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct RotationEntry {
    #[cfg_attr(feature = "ts", ts(type = "string"))]
    pub timestamp: DateTime<Utc>,
    pub old_masked: String,
    pub new_masked: String,
}

impl RotationEntry {
    /// Build an entry from raw token values; only masked forms are kept.
    pub fn new(old_refresh_token: &str, new_refresh_token: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            old_masked: mask_token(old_refresh_token),
            new_masked: mask_token(new_refresh_token),
        }
    }
}

type History = HashMap<String, VecDeque<RotationEntry>>;

pub struct RotationLedger {
    path: Option<PathBuf>,
    entries: Mutex<History>,
}

impl RotationLedger {
    /// Ledger that lives only as long as the process
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Open (or create) a ledger persisted in `data_dir`.
    /// An unreadable history file starts a fresh ledger; the audit trail
    /// never blocks startup.
    pub fn open(data_dir: PathBuf) -> Result<Self> {
        let path = data_dir.join(LEDGER_FILE);
        let entries = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .context("Failed to read rotation history")?;
            match serde_json::from_str(&contents) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "Discarding corrupt rotation history");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };
        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    pub fn record(&self, subject: &str, entry: RotationEntry) -> Result<()> {
        let mut entries = self.lock()?;
        let history = entries.entry(subject.to_string()).or_default();
        history.push_back(entry);
        while history.len() > MAX_ROTATIONS_PER_SUBJECT {
            history.pop_front();
        }
        debug!(subject = subject, len = history.len(), "Rotation recorded");
        self.persist(&entries)
    }

    /// Rotations for a subject, oldest first
    pub fn history(&self, subject: &str) -> Vec<RotationEntry> {
        match self.entries.lock() {
            Ok(entries) => entries
                .get(subject)
                .map(|h| h.iter().cloned().collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    pub fn purge(&self, subject: &str) -> Result<()> {
        let mut entries = self.lock()?;
        if entries.remove(subject).is_some() {
            debug!(subject = subject, "Rotation history purged");
            self.persist(&entries)?;
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, History>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("rotation ledger lock poisoned"))
    }

    fn persist(&self, entries: &History) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(entries)?;
        std::fs::write(&tmp, contents).context("Failed to write rotation history")?;
        std::fs::rename(&tmp, path).context("Failed to replace rotation history")?;
        Ok(())
    }
}
