//! # Swarm Coordinator
//!
//! Turns one goal prompt into a persisted dependency graph of sub-tasks via
//! a single decomposition call, then hands off to the dispatcher. The
//! completion call is guarded by the circuit breaker; a denied call runs
//! against the breaker's fallback model instead.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::sync::Arc;

use crate::audit::{AuditKind, AuditLog};
use crate::breaker::CircuitBreaker;
use crate::provider::{ChatMessage, CompletionRequest, ProviderRegistry};
use crate::state::{KeeperDb, KeeperSettings, NewTask, SwarmManager};
use crate::util::{extract, Clock, SystemClock};

use super::events::{DaemonEvent, EventBus, EventKind};
use super::persist_event;

const DECOMPOSE_SYSTEM_PROMPT: &str = "You are a senior engineering manager decomposing tasks \
for a team of AI coding agents. Each sub-task must be independent and parallelizable. \
Return ONLY valid JSON, no markdown.";

/// One item of the decomposition response.
#[derive(Debug, Clone, Deserialize)]
struct DecomposedItem {
    title: String,
    prompt: String,
    #[serde(default, rename = "dependsOn")]
    depends_on: Option<DependsOn>,
}

/// The model may hand back a single reference or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum DependsOn {
    One(String),
    Many(Vec<String>),
}

impl DependsOn {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s],
            Self::Many(v) => v,
        }
    }
}

/// Decomposes goals into swarms of dispatchable sub-tasks.
pub struct SwarmCoordinator {
    db: Arc<KeeperDb>,
    registry: ProviderRegistry,
    events: EventBus,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
}

impl SwarmCoordinator {
    pub fn new(db: Arc<KeeperDb>, registry: ProviderRegistry, events: EventBus) -> Self {
        let audit = AuditLog::new(&db);
        Self {
            db,
            registry,
            events,
            audit,
            clock: Arc::new(SystemClock),
        }
    }

    /// Inject a clock, shared with the circuit breakers this coordinator
    /// creates.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Decompose a goal into 2-6 sub-tasks and persist them. Returns the
    /// new swarm's id; the dispatcher takes over from there.
    #[tracing::instrument(skip(self, prompt))]
    pub async fn decompose(&self, name: &str, prompt: &str) -> Result<String> {
        let settings = KeeperSettings::load(&self.db)?;
        let manager = SwarmManager::new(&self.db);

        let swarm = manager.create_swarm(name, prompt)?;

        self.emit_and_log(
            &manager,
            &swarm.id,
            EventKind::SwarmCreated,
            serde_json::json!({ "swarmId": swarm.id, "name": swarm.name }),
        );
        self.emit_and_log(
            &manager,
            &swarm.id,
            EventKind::TaskPondering,
            serde_json::json!({
                "swarmId": swarm.id,
                "taskId": "root",
                "message": "Analyzing task requirements..."
            }),
        );

        // Provider resolution failures leave the swarm in `decomposing`:
        // nothing beyond the initial row has been persisted yet.
        let kind = settings.supervisor_provider;
        let provider = self
            .registry
            .get(kind)
            .with_context(|| format!("Provider '{}' not available", kind.as_str()))?;

        let config = settings.supervisor_config();
        let api_key = settings
            .supervisor_api_key
            .clone()
            .or_else(|| std::env::var(kind.api_key_env()).ok())
            .unwrap_or_default();

        let breaker = CircuitBreaker::new(&self.db, kind.as_str(), &config.model)
            .with_clock(Arc::clone(&self.clock));
        let verdict = breaker.should_allow()?;
        let (model, guarded) = if verdict.allowed {
            (config.model.clone(), true)
        } else {
            let fallback = verdict.fallback.unwrap_or_else(|| config.model.clone());
            tracing::warn!(
                "Circuit open for {}:{}, rerouting decomposition to {}",
                kind.as_str(),
                config.model,
                fallback
            );
            (fallback, false)
        };

        let request = CompletionRequest {
            messages: vec![ChatMessage::user(format!(
                "Decompose the following software engineering task into 2-6 independent, \
parallelizable sub-tasks. Each sub-task should be self-contained and achievable by a single \
AI coding agent.\n\n\
Format your response as a JSON array of objects with \"title\" and \"prompt\" fields. A task \
that requires another task's output may carry a \"dependsOn\" field listing the titles of \
earlier tasks. Example:\n\
[{{\"title\": \"Add user model\", \"prompt\": \"Create a User model with id, email and name \
fields.\"}}]\n\n\
Task to decompose:\n{}",
                prompt
            ))],
            api_key,
            model,
            system_prompt: Some(DECOMPOSE_SYSTEM_PROMPT.to_string()),
            json_mode: false,
        };

        let response = match provider.complete(request).await {
            Ok(response) => {
                if guarded {
                    breaker.record_success()?;
                }
                response
            }
            Err(e) => {
                if guarded {
                    breaker.record_failure()?;
                }
                let diagnostic = format!("Decomposition call failed: {}", e);
                manager.set_failed(&swarm.id, &diagnostic)?;
                self.audit
                    .log(&diagnostic, AuditKind::Error, &swarm.id);
                return Err(e).context("Decomposition call failed");
            }
        };

        let items: Vec<DecomposedItem> = match extract::parse_lenient(&response.content) {
            Ok(items) => items,
            Err(e) => {
                manager.set_failed(&swarm.id, "Failed to parse decomposition output")?;
                self.audit.log(
                    "Failed to parse decomposition output",
                    AuditKind::Error,
                    &swarm.id,
                );
                return Err(e).context("Failed to parse task decomposition");
            }
        };

        // Persist in array order; the index becomes the dispatch tie-break.
        // dependsOn references name earlier items by title (the model cannot
        // know row ids); unresolved references stay verbatim and simply
        // never become eligible.
        let mut inserted: Vec<(String, String)> = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let depends_on = item
                .depends_on
                .map(DependsOn::into_vec)
                .unwrap_or_default()
                .into_iter()
                .map(|reference| {
                    inserted
                        .iter()
                        .find(|(title, id)| *title == reference || *id == reference)
                        .map(|(_, id)| id.clone())
                        .unwrap_or(reference)
                })
                .collect();

            let task = manager.insert_task(
                &swarm.id,
                NewTask {
                    title: item.title.clone(),
                    prompt: item.prompt,
                    depends_on,
                    priority: index as i64,
                },
            )?;
            inserted.push((item.title, task.id));
        }

        let total = inserted.len() as i64;
        manager.mark_running(&swarm.id, total)?;

        self.emit_and_log(
            &manager,
            &swarm.id,
            EventKind::TaskFinalizing,
            serde_json::json!({
                "swarmId": swarm.id,
                "taskId": "root",
                "message": "Task decomposition complete."
            }),
        );
        self.events.emit(
            DaemonEvent::new(EventKind::SwarmUpdated).with_data(serde_json::json!({
                "swarmId": swarm.id,
                "status": "running",
                "totalTasks": total
            })),
        );

        self.audit.log(
            &format!("Swarm \"{}\" decomposed into {} sub-tasks", name, total),
            AuditKind::Action,
            &swarm.id,
        );

        Ok(swarm.id)
    }

    /// Emit on the bus and append to the swarm's bounded event log.
    fn emit_and_log(
        &self,
        manager: &SwarmManager,
        swarm_id: &str,
        kind: EventKind,
        data: serde_json::Value,
    ) {
        self.events
            .emit(DaemonEvent::new(kind.clone()).with_data(data.clone()));
        persist_event(manager, swarm_id, &kind, data);
    }
}
