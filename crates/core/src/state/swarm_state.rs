//! # Swarm State Management
//!
//! Swarms and their sub-tasks, stored in SQLite. A swarm is one
//! decomposition-and-execution run; each task is one independently
//! dispatchable unit owned by exactly one swarm.

use super::db::KeeperDb;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Persisted swarm events are capped at this many entries.
const MAX_EVENT_LOG: usize = 100;

/// Lifecycle of a swarm
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SwarmStatus {
    /// Waiting for the decomposition call to finish
    #[default]
    Decomposing,
    /// Tasks persisted, dispatcher active
    Running,
    /// Externally paused; dispatch ticks no-op
    Paused,
    /// All tasks reached a terminal state
    Completed,
    /// Decomposition failed
    Failed,
}

impl SwarmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decomposing => "decomposing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "decomposing" => Self::Decomposing,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Decomposing,
        }
    }
}

/// Lifecycle of a sub-task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not yet eligible or not yet picked up
    #[default]
    Pending,
    /// External session launched
    Dispatched,
    /// External session reported progress
    Running,
    /// External session finished successfully
    Completed,
    /// Launch failed or external session failed
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "dispatched" => Self::Dispatched,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    /// Occupies a concurrency slot.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Dispatched | Self::Running)
    }

    /// Counts toward swarm completion.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One entry in a swarm's bounded event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmEventRecord {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// One decomposition-and-execution run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Swarm {
    pub id: String,
    pub name: String,
    /// The high-level goal being decomposed
    pub prompt: String,
    pub status: SwarmStatus,
    pub total_tasks: i64,
    pub done_tasks: i64,
    /// Combined report on completion, or a failure diagnostic
    #[serde(default)]
    pub result: Option<String>,
    /// Last [`MAX_EVENT_LOG`] orchestration events
    #[serde(default)]
    pub events: Vec<SwarmEventRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One independently dispatchable unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmTask {
    pub id: String,
    pub swarm_id: String,
    pub title: String,
    pub prompt: String,
    /// Task ids that must complete before this task may dispatch
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub status: TaskStatus,
    /// External session id, set once dispatched
    #[serde(default)]
    pub session_id: Option<String>,
    /// Decomposition order; dispatch tie-break only
    pub priority: i64,
    #[serde(default)]
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for bulk task creation during decomposition
#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub prompt: String,
    pub depends_on: Vec<String>,
    pub priority: i64,
}

/// Manager for swarm and task storage
pub struct SwarmManager {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl SwarmManager {
    pub fn new(db: &KeeperDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Create a swarm in the `decomposing` state.
    pub fn create_swarm(&self, name: &str, prompt: &str) -> Result<Swarm> {
        let now = Utc::now();
        let swarm = Swarm {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            prompt: prompt.to_string(),
            status: SwarmStatus::Decomposing,
            total_tasks: 0,
            done_tasks: 0,
            result: None,
            events: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            r#"
            INSERT INTO swarms (id, name, prompt, status, total_tasks, done_tasks, result, events_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 0, 0, NULL, '[]', ?5, ?6)
            "#,
            params![
                swarm.id,
                swarm.name,
                swarm.prompt,
                swarm.status.as_str(),
                swarm.created_at.to_rfc3339(),
                swarm.updated_at.to_rfc3339(),
            ],
        )
        .context("Failed to create swarm")?;

        Ok(swarm)
    }

    /// Load a swarm by id.
    pub fn load(&self, id: &str) -> Result<Swarm> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.query_row(
            r#"
            SELECT id, name, prompt, status, total_tasks, done_tasks, result, events_json, created_at, updated_at
            FROM swarms WHERE id = ?1
            "#,
            params![id],
            Self::row_to_swarm,
        )
        .with_context(|| format!("Swarm not found: {}", id))
    }

    /// List swarms with a given status.
    pub fn list_by_status(&self, status: SwarmStatus) -> Result<Vec<Swarm>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, name, prompt, status, total_tasks, done_tasks, result, events_json, created_at, updated_at
            FROM swarms WHERE status = ?1
            ORDER BY created_at DESC
            "#,
        )?;

        let swarms = stmt
            .query_map(params![status.as_str()], Self::row_to_swarm)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list swarms")?;

        Ok(swarms)
    }

    /// Update a swarm's status.
    pub fn update_status(&self, id: &str, status: SwarmStatus) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let now = Utc::now().to_rfc3339();
        let affected = conn.execute(
            "UPDATE swarms SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now, id],
        )?;

        if affected == 0 {
            anyhow::bail!("Swarm not found: {}", id);
        }

        Ok(())
    }

    /// Externally pause a swarm. Dispatch ticks observe the status guard.
    pub fn pause(&self, id: &str) -> Result<()> {
        self.update_status(id, SwarmStatus::Paused)
    }

    /// Resume a paused swarm.
    pub fn resume(&self, id: &str) -> Result<()> {
        self.update_status(id, SwarmStatus::Running)
    }

    /// Transition decomposing -> running once tasks are persisted.
    pub fn mark_running(&self, id: &str, total_tasks: i64) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let now = Utc::now().to_rfc3339();
        let affected = conn.execute(
            "UPDATE swarms SET status = 'running', total_tasks = ?1, updated_at = ?2 WHERE id = ?3",
            params![total_tasks, now, id],
        )?;

        if affected == 0 {
            anyhow::bail!("Swarm not found: {}", id);
        }

        Ok(())
    }

    /// Mark a swarm failed with a diagnostic.
    pub fn set_failed(&self, id: &str, diagnostic: &str) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let now = Utc::now().to_rfc3339();
        let affected = conn.execute(
            "UPDATE swarms SET status = 'failed', result = ?1, updated_at = ?2 WHERE id = ?3",
            params![diagnostic, now, id],
        )?;

        if affected == 0 {
            anyhow::bail!("Swarm not found: {}", id);
        }

        Ok(())
    }

    /// Persist the count of completed tasks.
    pub fn set_done_tasks(&self, id: &str, done: i64) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE swarms SET done_tasks = ?1, updated_at = ?2 WHERE id = ?3",
            params![done, now, id],
        )?;

        Ok(())
    }

    /// Terminal transition: all tasks accounted for.
    pub fn complete(&self, id: &str, result: &str, done: i64) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE swarms SET status = 'completed', result = ?1, done_tasks = ?2, updated_at = ?3 WHERE id = ?4",
            params![result, done, now, id],
        )?;

        Ok(())
    }

    /// Append to the swarm's bounded event log, keeping the last
    /// [`MAX_EVENT_LOG`] entries.
    pub fn append_event(&self, id: &str, record: SwarmEventRecord) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let events_json: String = conn
            .query_row(
                "SELECT events_json FROM swarms WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .with_context(|| format!("Swarm not found: {}", id))?;

        let mut events: Vec<SwarmEventRecord> =
            serde_json::from_str(&events_json).unwrap_or_default();
        events.push(record);
        if events.len() > MAX_EVENT_LOG {
            let excess = events.len() - MAX_EVENT_LOG;
            events.drain(..excess);
        }

        conn.execute(
            "UPDATE swarms SET events_json = ?1 WHERE id = ?2",
            params![serde_json::to_string(&events)?, id],
        )?;

        Ok(())
    }

    /// Insert one sub-task.
    pub fn insert_task(&self, swarm_id: &str, task: NewTask) -> Result<SwarmTask> {
        let now = Utc::now();
        let row = SwarmTask {
            id: Uuid::new_v4().to_string(),
            swarm_id: swarm_id.to_string(),
            title: task.title,
            prompt: task.prompt,
            depends_on: task.depends_on,
            status: TaskStatus::Pending,
            session_id: None,
            priority: task.priority,
            result: None,
            created_at: now,
            updated_at: now,
        };

        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            r#"
            INSERT INTO swarm_tasks (id, swarm_id, title, prompt, depends_on_json, status, session_id, priority, result, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, NULL, ?8, ?9)
            "#,
            params![
                row.id,
                row.swarm_id,
                row.title,
                row.prompt,
                serde_json::to_string(&row.depends_on)?,
                row.status.as_str(),
                row.priority,
                row.created_at.to_rfc3339(),
                row.updated_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert swarm task")?;

        Ok(row)
    }

    /// All tasks of a swarm, decomposition order first.
    pub fn tasks(&self, swarm_id: &str) -> Result<Vec<SwarmTask>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, swarm_id, title, prompt, depends_on_json, status, session_id, priority, result, created_at, updated_at
            FROM swarm_tasks WHERE swarm_id = ?1
            ORDER BY priority ASC
            "#,
        )?;

        let tasks = stmt
            .query_map(params![swarm_id], Self::row_to_task)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list swarm tasks")?;

        Ok(tasks)
    }

    /// Load one task by id.
    pub fn load_task(&self, id: &str) -> Result<SwarmTask> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.query_row(
            r#"
            SELECT id, swarm_id, title, prompt, depends_on_json, status, session_id, priority, result, created_at, updated_at
            FROM swarm_tasks WHERE id = ?1
            "#,
            params![id],
            Self::row_to_task,
        )
        .with_context(|| format!("Task not found: {}", id))
    }

    /// Find the task an external session belongs to.
    pub fn find_task_by_session(&self, session_id: &str) -> Result<Option<SwarmTask>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let task = conn
            .query_row(
                r#"
                SELECT id, swarm_id, title, prompt, depends_on_json, status, session_id, priority, result, created_at, updated_at
                FROM swarm_tasks WHERE session_id = ?1
                "#,
                params![session_id],
                Self::row_to_task,
            )
            .ok();

        Ok(task)
    }

    /// Record a successful launch: pending -> dispatched with its session id.
    pub fn set_task_dispatched(&self, id: &str, session_id: &str) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let now = Utc::now().to_rfc3339();
        let affected = conn.execute(
            "UPDATE swarm_tasks SET status = 'dispatched', session_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![session_id, now, id],
        )?;

        if affected == 0 {
            anyhow::bail!("Task not found: {}", id);
        }

        Ok(())
    }

    /// Launch failure is terminal for the task, siblings unaffected.
    pub fn set_task_failed(&self, id: &str, error: &str) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let now = Utc::now().to_rfc3339();
        let affected = conn.execute(
            "UPDATE swarm_tasks SET status = 'failed', result = ?1, updated_at = ?2 WHERE id = ?3",
            params![error, now, id],
        )?;

        if affected == 0 {
            anyhow::bail!("Task not found: {}", id);
        }

        Ok(())
    }

    /// Apply an inbound session-lifecycle signal to a task.
    pub fn set_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<&str>,
    ) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let now = Utc::now().to_rfc3339();
        let affected = match result {
            Some(r) => conn.execute(
                "UPDATE swarm_tasks SET status = ?1, result = ?2, updated_at = ?3 WHERE id = ?4",
                params![status.as_str(), r, now, id],
            )?,
            None => conn.execute(
                "UPDATE swarm_tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, id],
            )?,
        };

        if affected == 0 {
            anyhow::bail!("Task not found: {}", id);
        }

        Ok(())
    }

    fn row_to_swarm(row: &rusqlite::Row) -> rusqlite::Result<Swarm> {
        let status: String = row.get(3)?;
        let events_json: String = row.get(7)?;
        let created_at: String = row.get(8)?;
        let updated_at: String = row.get(9)?;

        Ok(Swarm {
            id: row.get(0)?,
            name: row.get(1)?,
            prompt: row.get(2)?,
            status: SwarmStatus::from_str(&status),
            total_tasks: row.get(4)?,
            done_tasks: row.get(5)?,
            result: row.get(6)?,
            events: serde_json::from_str(&events_json).unwrap_or_default(),
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
        })
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<SwarmTask> {
        let depends_on_json: String = row.get(4)?;
        let status: String = row.get(5)?;
        let created_at: String = row.get(9)?;
        let updated_at: String = row.get(10)?;

        Ok(SwarmTask {
            id: row.get(0)?,
            swarm_id: row.get(1)?,
            title: row.get(2)?,
            prompt: row.get(3)?,
            depends_on: serde_json::from_str(&depends_on_json).unwrap_or_default(),
            status: TaskStatus::from_str(&status),
            session_id: row.get(6)?,
            priority: row.get(7)?,
            result: row.get(8)?,
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
        })
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (KeeperDb, SwarmManager) {
        let db = KeeperDb::open_in_memory().unwrap();
        let mgr = SwarmManager::new(&db);
        (db, mgr)
    }

    #[test]
    fn test_create_and_load_swarm() {
        let (_db, mgr) = manager();
        let swarm = mgr.create_swarm("Add Auth", "Add login").unwrap();
        assert_eq!(swarm.status, SwarmStatus::Decomposing);

        let loaded = mgr.load(&swarm.id).unwrap();
        assert_eq!(loaded.name, "Add Auth");
        assert_eq!(loaded.total_tasks, 0);
    }

    #[test]
    fn test_mark_running_sets_totals() {
        let (_db, mgr) = manager();
        let swarm = mgr.create_swarm("s", "p").unwrap();
        mgr.mark_running(&swarm.id, 4).unwrap();

        let loaded = mgr.load(&swarm.id).unwrap();
        assert_eq!(loaded.status, SwarmStatus::Running);
        assert_eq!(loaded.total_tasks, 4);
    }

    #[test]
    fn test_pause_and_resume() {
        let (_db, mgr) = manager();
        let swarm = mgr.create_swarm("s", "p").unwrap();
        mgr.mark_running(&swarm.id, 1).unwrap();
        mgr.pause(&swarm.id).unwrap();
        assert_eq!(mgr.load(&swarm.id).unwrap().status, SwarmStatus::Paused);
        mgr.resume(&swarm.id).unwrap();
        assert_eq!(mgr.load(&swarm.id).unwrap().status, SwarmStatus::Running);
    }

    #[test]
    fn test_event_log_is_bounded() {
        let (_db, mgr) = manager();
        let swarm = mgr.create_swarm("s", "p").unwrap();

        for i in 0..(MAX_EVENT_LOG + 20) {
            mgr.append_event(
                &swarm.id,
                SwarmEventRecord {
                    event: format!("event-{}", i),
                    data: serde_json::Value::Null,
                    timestamp: Utc::now(),
                },
            )
            .unwrap();
        }

        let loaded = mgr.load(&swarm.id).unwrap();
        assert_eq!(loaded.events.len(), MAX_EVENT_LOG);
        // Oldest entries were dropped
        assert_eq!(loaded.events[0].event, "event-20");
    }

    #[test]
    fn test_task_lifecycle() {
        let (_db, mgr) = manager();
        let swarm = mgr.create_swarm("s", "p").unwrap();
        let task = mgr
            .insert_task(
                &swarm.id,
                NewTask {
                    title: "A".into(),
                    prompt: "p1".into(),
                    depends_on: vec![],
                    priority: 0,
                },
            )
            .unwrap();

        assert_eq!(task.status, TaskStatus::Pending);

        mgr.set_task_dispatched(&task.id, "sess-1").unwrap();
        let loaded = mgr.load_task(&task.id).unwrap();
        assert_eq!(loaded.status, TaskStatus::Dispatched);
        assert_eq!(loaded.session_id.as_deref(), Some("sess-1"));

        mgr.set_task_status(&task.id, TaskStatus::Completed, Some("done"))
            .unwrap();
        let loaded = mgr.load_task(&task.id).unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.result.as_deref(), Some("done"));
    }

    #[test]
    fn test_find_task_by_session() {
        let (_db, mgr) = manager();
        let swarm = mgr.create_swarm("s", "p").unwrap();
        let task = mgr
            .insert_task(
                &swarm.id,
                NewTask {
                    title: "A".into(),
                    prompt: "p1".into(),
                    depends_on: vec![],
                    priority: 0,
                },
            )
            .unwrap();

        assert!(mgr.find_task_by_session("sess-9").unwrap().is_none());
        mgr.set_task_dispatched(&task.id, "sess-9").unwrap();
        let found = mgr.find_task_by_session("sess-9").unwrap().unwrap();
        assert_eq!(found.id, task.id);
    }

    #[test]
    fn test_tasks_ordered_by_priority() {
        let (_db, mgr) = manager();
        let swarm = mgr.create_swarm("s", "p").unwrap();
        for (i, title) in ["C", "A", "B"].iter().enumerate() {
            mgr.insert_task(
                &swarm.id,
                NewTask {
                    title: title.to_string(),
                    prompt: "p".into(),
                    depends_on: vec![],
                    priority: (2 - i) as i64,
                },
            )
            .unwrap();
        }

        let tasks = mgr.tasks(&swarm.id).unwrap();
        let titles: Vec<&str> = tasks.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["B", "A", "C"]);
    }

    #[test]
    fn test_depends_on_round_trip() {
        let (_db, mgr) = manager();
        let swarm = mgr.create_swarm("s", "p").unwrap();
        let task = mgr
            .insert_task(
                &swarm.id,
                NewTask {
                    title: "B".into(),
                    prompt: "p".into(),
                    depends_on: vec!["task-a".into(), "task-x".into()],
                    priority: 1,
                },
            )
            .unwrap();

        let loaded = mgr.load_task(&task.id).unwrap();
        assert_eq!(loaded.depends_on, vec!["task-a", "task-x"]);
    }
}
