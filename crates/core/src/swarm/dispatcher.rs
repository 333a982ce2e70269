//! # Task Dispatcher
//!
//! Promotes eligible pending tasks to running agent sessions under a fixed
//! concurrency cap, honoring dependencies, and detects swarm completion.
//! Designed to be safely re-invoked on every scheduler tick: eligibility
//! and slot accounting are recomputed from freshly read state, never from
//! an internal cursor, so duplicate invocations dispatch nothing new.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;

use crate::audit::{AuditKind, AuditLog};
use crate::session::SessionClient;
use crate::state::{KeeperDb, KeeperSettings, SwarmManager, SwarmStatus, TaskStatus};

use super::events::{DaemonEvent, EventBus, EventKind};
use super::persist_event;

/// Concurrency cap on in-flight sessions per swarm.
pub const MAX_PARALLEL: usize = 3;

/// Dispatches pending swarm tasks as external agent sessions.
pub struct TaskDispatcher {
    db: Arc<KeeperDb>,
    sessions: Arc<dyn SessionClient>,
    events: EventBus,
    audit: AuditLog,
}

impl TaskDispatcher {
    pub fn new(db: Arc<KeeperDb>, sessions: Arc<dyn SessionClient>, events: EventBus) -> Self {
        let audit = AuditLog::new(&db);
        Self {
            db,
            sessions,
            events,
            audit,
        }
    }

    /// One dispatch tick for a swarm.
    #[tracing::instrument(skip(self))]
    pub async fn dispatch_pending_tasks(&self, swarm_id: &str) -> Result<()> {
        let settings = KeeperSettings::load(&self.db)?;
        if settings.agent_api_key.is_none() && std::env::var("AGENT_API_KEY").is_err() {
            tracing::debug!("Dispatcher skipped: no agent API key configured");
            return Ok(());
        }

        let manager = SwarmManager::new(&self.db);
        let swarm = manager.load(swarm_id)?;

        // The only pause mechanism: a non-running swarm is a no-op.
        if swarm.status != SwarmStatus::Running {
            if swarm.status == SwarmStatus::Paused {
                tracing::info!("Dispatcher skipped for swarm {} (paused)", swarm_id);
            }
            return Ok(());
        }

        let tasks = manager.tasks(swarm_id)?;

        let in_flight = tasks.iter().filter(|t| t.status.is_in_flight()).count();
        let completed_ids: HashSet<&str> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.as_str())
            .collect();

        // Eligibility is recomputed from scratch every tick; tasks with
        // unmet dependencies just stay pending until a later tick.
        let slots = MAX_PARALLEL.saturating_sub(in_flight);
        let batch: Vec<_> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| {
                t.depends_on
                    .iter()
                    .all(|dep| completed_ids.contains(dep.as_str()))
            })
            .take(slots)
            .collect();

        // Launch sequentially: one tick never bursts past the cap.
        for task in batch {
            let title = format!("[Swarm] {}", task.title);
            match self
                .sessions
                .create_session(None, &task.prompt, &title)
                .await
            {
                Ok(session) => {
                    manager.set_task_dispatched(&task.id, &session.id)?;

                    self.events.emit(
                        DaemonEvent::new(EventKind::SwarmTaskUpdated).with_data(
                            serde_json::json!({
                                "swarmId": swarm_id,
                                "taskId": task.id,
                                "status": "dispatched",
                                "sessionId": session.id
                            }),
                        ),
                    );

                    let short = session.id.chars().take(8).collect::<String>();
                    let data = serde_json::json!({
                        "swarmId": swarm_id,
                        "taskId": task.id,
                        "sessionId": session.id,
                        "message": format!("Agent session {} started.", short)
                    });
                    self.events
                        .emit(DaemonEvent::new(EventKind::TaskExecuting).with_data(data.clone()));
                    persist_event(&manager, swarm_id, &EventKind::TaskExecuting, data);

                    self.audit.log(
                        &format!("Dispatched swarm task \"{}\" -> session {}", task.title, short),
                        AuditKind::Action,
                        swarm_id,
                    );
                }
                Err(e) => {
                    // A launch failure is terminal for this task only.
                    tracing::error!("Failed to dispatch task {}: {}", task.id, e);
                    manager.set_task_failed(&task.id, &e.to_string())?;
                    self.audit.log(
                        &format!("Failed to dispatch task \"{}\": {}", task.title, e),
                        AuditKind::Error,
                        swarm_id,
                    );
                }
            }
        }

        self.check_completion(&manager, swarm_id)
    }

    /// Re-read and finalize the swarm if every task reached a terminal
    /// state. Partial success still completes.
    fn check_completion(&self, manager: &SwarmManager, swarm_id: &str) -> Result<()> {
        let swarm = manager.load(swarm_id)?;
        let tasks = manager.tasks(swarm_id)?;

        let done = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count() as i64;
        let failed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count() as i64;

        manager.set_done_tasks(swarm_id, done)?;

        if done + failed >= swarm.total_tasks {
            let results: Vec<String> = tasks
                .iter()
                .filter_map(|t| {
                    t.result
                        .as_ref()
                        .map(|r| format!("## {}\n{}", t.title, r))
                })
                .collect();
            let report = if results.is_empty() {
                "All tasks completed.".to_string()
            } else {
                results.join("\n\n")
            };

            manager.complete(swarm_id, &report, done)?;

            let data = serde_json::json!({
                "swarmId": swarm_id,
                "status": "completed",
                "message": "Swarm execution finalized."
            });
            self.events
                .emit(DaemonEvent::new(EventKind::SwarmCompleted).with_data(data.clone()));
            persist_event(manager, swarm_id, &EventKind::SwarmCompleted, data);

            self.audit.log(
                &format!(
                    "Swarm \"{}\" completed ({}/{} succeeded)",
                    swarm.name, done, swarm.total_tasks
                ),
                AuditKind::Action,
                swarm_id,
            );
        }

        Ok(())
    }

    /// Apply an inbound session-lifecycle signal to the owning task. This
    /// core never produces these signals itself. Returns false when no task
    /// owns the session.
    pub fn apply_session_update(
        &self,
        session_id: &str,
        status: TaskStatus,
        result: Option<&str>,
    ) -> Result<bool> {
        let manager = SwarmManager::new(&self.db);
        let Some(task) = manager.find_task_by_session(session_id)? else {
            tracing::debug!("Session update for unknown session {}", session_id);
            return Ok(false);
        };

        manager.set_task_status(&task.id, status, result)?;

        self.events.emit(
            DaemonEvent::new(EventKind::SwarmTaskUpdated).with_data(serde_json::json!({
                "swarmId": task.swarm_id,
                "taskId": task.id,
                "status": status.as_str(),
                "sessionId": session_id
            })),
        );

        Ok(true)
    }
}
