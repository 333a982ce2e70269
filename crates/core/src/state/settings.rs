//! # Keeper Settings
//!
//! Single-row JSON settings record. Everything the orchestration core needs
//! to resolve providers and reach the external session API lives here; a
//! fresh database yields the defaults.

use super::db::KeeperDb;
use crate::models::{ModelConfig, ProviderKind};
use anyhow::{Context, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};

fn default_enabled() -> bool {
    true
}

fn default_check_interval() -> u64 {
    30
}

fn default_worker_concurrency() -> usize {
    4
}

/// Persisted orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeeperSettings {
    /// Master switch for the scheduler tick
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Seconds between scheduler ticks
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,
    /// Number of queue workers
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// Provider used for decomposition calls
    #[serde(default)]
    pub supervisor_provider: ProviderKind,
    /// Model override; provider default when absent
    #[serde(default)]
    pub supervisor_model: Option<String>,
    /// API key for the supervisor provider
    #[serde(default)]
    pub supervisor_api_key: Option<String>,
    /// API key for the external agent-session API
    #[serde(default)]
    pub agent_api_key: Option<String>,
    /// Base URL of the external agent-session API
    #[serde(default)]
    pub agent_base_url: Option<String>,
}

impl Default for KeeperSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_seconds: default_check_interval(),
            worker_concurrency: default_worker_concurrency(),
            supervisor_provider: ProviderKind::default(),
            supervisor_model: None,
            supervisor_api_key: None,
            agent_api_key: None,
            agent_base_url: None,
        }
    }
}

impl KeeperSettings {
    /// Load settings, falling back to defaults when no row exists.
    pub fn load(db: &KeeperDb) -> Result<Self> {
        let conn = db.connection();
        let conn = conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let result: Option<String> = conn
            .query_row("SELECT data FROM settings WHERE id = 1", [], |row| {
                row.get(0)
            })
            .ok();

        match result {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => Ok(KeeperSettings::default()),
        }
    }

    /// Save settings.
    pub fn save(&self, db: &KeeperDb) -> Result<()> {
        let conn = db.connection();
        let conn = conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let data = serde_json::to_string(self)?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (id, data) VALUES (1, ?1)",
            params![data],
        )
        .context("Failed to save settings")?;

        Ok(())
    }

    /// Resolved supervisor model target.
    pub fn supervisor_config(&self) -> ModelConfig {
        let model = self
            .supervisor_model
            .clone()
            .unwrap_or_else(|| self.supervisor_provider.default_model().to_string());
        ModelConfig::new(self.supervisor_provider, model)
    }
}
