//! Upstream definitions source: file-backed snapshot provider with
//! coalescable reload notifications

use crate::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::Notify;
use tracing::info;

/// One desired upstream as loaded from the definitions file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamDefinition {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: String,
}

/// Owns the definitions file and the reload notification channel.
///
/// `load` replaces the in-memory snapshot atomically; a failed load
/// leaves the previous snapshot in place. Reload notifications are
/// single-shot and coalesce: triggering twice before the pool's
/// listener wakes results in one reconciliation.
pub struct DefinitionsManager {
    path: PathBuf,
    definitions: RwLock<Vec<UpstreamDefinition>>,
    reload: Notify,
    reload_token: String,
}

impl DefinitionsManager {
    pub fn new(path: impl Into<PathBuf>, reload_token: impl Into<String>) -> Self {
        DefinitionsManager {
            path: path.into(),
            definitions: RwLock::new(Vec::new()),
            reload: Notify::new(),
            reload_token: reload_token.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the definitions file, replacing the snapshot.
    /// Duplicate addresses are rejected here, before the pool sees them.
    pub async fn load(&self) -> Result<()> {
        let data = tokio::fs::read(&self.path).await.map_err(|e| {
            Error::config(format!(
                "failed to read upstream definitions '{}': {}",
                self.path.display(),
                e
            ))
        })?;

        let parsed: Vec<UpstreamDefinition> = serde_json::from_slice(&data).map_err(|e| {
            Error::parse(format!(
                "failed to parse upstream definitions '{}': {}",
                self.path.display(),
                e
            ))
        })?;

        let mut seen = HashSet::with_capacity(parsed.len());
        for def in &parsed {
            if def.address.is_empty() {
                return Err(Error::config("upstream definition with empty address"));
            }
            if !seen.insert(def.address.as_str()) {
                return Err(Error::config(format!(
                    "duplicate upstream address '{}' in definitions",
                    def.address
                )));
            }
        }

        info!(count = parsed.len(), path = %self.path.display(), "upstream definitions loaded");
        *self.definitions.write() = parsed;
        Ok(())
    }

    /// Cloned snapshot of the current definitions.
    pub fn definitions(&self) -> Vec<UpstreamDefinition> {
        self.definitions.read().clone()
    }

    /// Post a reload notification. Coalesces with any pending one.
    pub fn trigger_reload(&self) {
        self.reload.notify_one();
    }

    /// Resolve when a reload notification is (or already was) pending.
    pub async fn reload_requested(&self) {
        self.reload.notified().await;
    }

    /// Constant-time enough for an admin endpoint: empty configured
    /// tokens never match.
    pub fn check_reload_token(&self, token: &str) -> bool {
        !self.reload_token.is_empty() && self.reload_token == token
    }
}
