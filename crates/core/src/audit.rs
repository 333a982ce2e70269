//! # Audit Log
//!
//! Fire-and-forget structured log of orchestration actions. Entries land in
//! SQLite and are mirrored to `tracing`; a failed write must never take an
//! orchestration path down, so errors are logged and swallowed here.

use crate::state::KeeperDb;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Category of an audit entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Info,
    Action,
    Error,
    Skip,
}

impl AuditKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Action => "action",
            Self::Error => "error",
            Self::Skip => "skip",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "action" => Self::Action,
            "error" => Self::Error,
            "skip" => Self::Skip,
            _ => Self::Info,
        }
    }
}

/// One audit entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub message: String,
    pub kind: AuditKind,
    /// Swarm or session id, or "global"
    pub scope: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Audit sink over the keeper database.
#[derive(Clone)]
pub struct AuditLog {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl AuditLog {
    pub fn new(db: &KeeperDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Record an entry. Fire-and-forget: write failures are traced, not
    /// propagated.
    pub fn log(&self, message: &str, kind: AuditKind, scope: &str) {
        self.log_with(message, kind, scope, None);
    }

    /// Record an entry with structured metadata.
    pub fn log_with(
        &self,
        message: &str,
        kind: AuditKind,
        scope: &str,
        metadata: Option<serde_json::Value>,
    ) {
        match kind {
            AuditKind::Error => tracing::warn!(scope, "{}", message),
            _ => tracing::info!(scope, "{}", message),
        }

        if let Err(e) = self.write(message, kind, scope, metadata) {
            tracing::warn!("Failed to persist audit entry: {}", e);
        }
    }

    fn write(
        &self,
        message: &str,
        kind: AuditKind,
        scope: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            r#"
            INSERT INTO audit_log (message, kind, scope, metadata, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                message,
                kind.as_str(),
                scope,
                metadata.map(|m| m.to_string()),
                Utc::now().to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    /// Most recent entries, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, message, kind, scope, metadata, created_at
            FROM audit_log
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let entries = stmt
            .query_map(params![limit as i64], |row| {
                let kind: String = row.get(2)?;
                let metadata: Option<String> = row.get(4)?;
                let created_at: String = row.get(5)?;
                Ok(AuditEntry {
                    id: row.get(0)?,
                    message: row.get(1)?,
                    kind: AuditKind::from_str(&kind),
                    scope: row.get(3)?,
                    metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_and_read_back() {
        let db = KeeperDb::open_in_memory().unwrap();
        let audit = AuditLog::new(&db);

        audit.log("Dispatched task", AuditKind::Action, "swarm-1");
        audit.log_with(
            "Decomposition failed",
            AuditKind::Error,
            "swarm-2",
            Some(serde_json::json!({ "attempt": 1 })),
        );

        let entries = audit.recent(10).unwrap();
        assert_eq!(entries.len(), 2);
        // Newest first
        assert_eq!(entries[0].kind, AuditKind::Error);
        assert_eq!(entries[0].scope, "swarm-2");
        assert!(entries[0].metadata.is_some());
        assert_eq!(entries[1].message, "Dispatched task");
    }

    #[test]
    fn test_recent_respects_limit() {
        let db = KeeperDb::open_in_memory().unwrap();
        let audit = AuditLog::new(&db);
        for i in 0..5 {
            audit.log(&format!("entry {}", i), AuditKind::Info, "global");
        }
        assert_eq!(audit.recent(3).unwrap().len(), 3);
    }
}
