//! # Circuit Breaker State Storage
//!
//! One row per (provider, model) pair, keyed `provider:model`. Rows are
//! created lazily on first check and survive process restarts; the state
//! machine itself lives in [`crate::breaker`].

use super::db::KeeperDb;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Circuit position
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; failures increment the counter
    #[default]
    Closed,
    /// Cooling down; calls are rerouted to the fallback model
    Open,
    /// One probe allowed to test recovery
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "closed" => Self::Closed,
            "open" => Self::Open,
            "half_open" => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// Creation-time knobs for a breaker row.
#[derive(Debug, Clone)]
pub struct BreakerDefaults {
    pub threshold: i64,
    pub recovery_ms: i64,
    pub fallback_model: String,
}

impl Default for BreakerDefaults {
    fn default() -> Self {
        Self {
            threshold: 5,
            recovery_ms: 60_000,
            fallback_model: "gpt-4o-mini".to_string(),
        }
    }
}

/// Persisted breaker record for one (provider, model) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub key: String,
    pub provider: String,
    pub model: String,
    pub state: CircuitState,
    pub failure_count: i64,
    pub success_count: i64,
    pub threshold: i64,
    pub recovery_ms: i64,
    pub fallback_model: String,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_open_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl BreakerRecord {
    /// Fresh closed record.
    pub fn new(provider: &str, model: &str, defaults: &BreakerDefaults) -> Self {
        Self {
            key: format!("{}:{}", provider, model),
            provider: provider.to_string(),
            model: model.to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            threshold: defaults.threshold,
            recovery_ms: defaults.recovery_ms,
            fallback_model: defaults.fallback_model.clone(),
            opened_at: None,
            half_open_at: None,
            last_failure_at: None,
            last_success_at: None,
        }
    }
}

/// Manager for breaker rows.
pub struct BreakerStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl BreakerStore {
    pub fn new(db: &KeeperDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Idempotent get-or-create: a missing row materializes as a default
    /// closed record.
    pub fn get_or_create(
        &self,
        provider: &str,
        model: &str,
        defaults: &BreakerDefaults,
    ) -> Result<BreakerRecord> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let fresh = BreakerRecord::new(provider, model, defaults);
        conn.execute(
            r#"
            INSERT OR IGNORE INTO circuit_breaker_states
                (key, provider, model, state, failure_count, success_count, threshold, recovery_ms, fallback_model, updated_at)
            VALUES (?1, ?2, ?3, 'closed', 0, 0, ?4, ?5, ?6, ?7)
            "#,
            params![
                fresh.key,
                fresh.provider,
                fresh.model,
                fresh.threshold,
                fresh.recovery_ms,
                fresh.fallback_model,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to create breaker record")?;

        conn.query_row(
            r#"
            SELECT key, provider, model, state, failure_count, success_count, threshold, recovery_ms, fallback_model,
                   opened_at, half_open_at, last_failure_at, last_success_at
            FROM circuit_breaker_states WHERE key = ?1
            "#,
            params![fresh.key],
            Self::row_to_record,
        )
        .context("Failed to load breaker record")
    }

    /// Persist a transitioned record.
    pub fn save(&self, record: &BreakerRecord) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            r#"
            UPDATE circuit_breaker_states SET
                state = ?1,
                failure_count = ?2,
                success_count = ?3,
                opened_at = ?4,
                half_open_at = ?5,
                last_failure_at = ?6,
                last_success_at = ?7,
                updated_at = ?8
            WHERE key = ?9
            "#,
            params![
                record.state.as_str(),
                record.failure_count,
                record.success_count,
                record.opened_at.map(|t| t.to_rfc3339()),
                record.half_open_at.map(|t| t.to_rfc3339()),
                record.last_failure_at.map(|t| t.to_rfc3339()),
                record.last_success_at.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
                record.key,
            ],
        )
        .context("Failed to save breaker record")?;

        Ok(())
    }

    /// All breaker rows, for monitoring.
    pub fn list_all(&self) -> Result<Vec<BreakerRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut stmt = conn.prepare(
            r#"
            SELECT key, provider, model, state, failure_count, success_count, threshold, recovery_ms, fallback_model,
                   opened_at, half_open_at, last_failure_at, last_success_at
            FROM circuit_breaker_states
            ORDER BY updated_at DESC
            "#,
        )?;

        let records = stmt
            .query_map([], Self::row_to_record)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list breaker records")?;

        Ok(records)
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<BreakerRecord> {
        let state: String = row.get(3)?;
        let opened_at: Option<String> = row.get(9)?;
        let half_open_at: Option<String> = row.get(10)?;
        let last_failure_at: Option<String> = row.get(11)?;
        let last_success_at: Option<String> = row.get(12)?;

        Ok(BreakerRecord {
            key: row.get(0)?,
            provider: row.get(1)?,
            model: row.get(2)?,
            state: CircuitState::from_str(&state),
            failure_count: row.get(4)?,
            success_count: row.get(5)?,
            threshold: row.get(6)?,
            recovery_ms: row.get(7)?,
            fallback_model: row.get(8)?,
            opened_at: opened_at.as_deref().and_then(parse_optional),
            half_open_at: half_open_at.as_deref().and_then(parse_optional),
            last_failure_at: last_failure_at.as_deref().and_then(parse_optional),
            last_success_at: last_success_at.as_deref().and_then(parse_optional),
        })
    }
}

fn parse_optional(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .ok()
}
