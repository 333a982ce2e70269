//! # Worker Pool
//!
//! A bounded pool of workers pulls jobs from the durable queue and routes
//! them by name to the coordinator, the dispatcher, or the session-update
//! handler. Each worker carries one job to completion; handler failures
//! propagate to the queue's retry policy.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::state::TaskStatus;
use crate::swarm::{SwarmCoordinator, TaskDispatcher};

use super::queue::{Job, JobQueue};

/// Job names understood by the router.
pub mod job_names {
    /// Decompose a newly-requested swarm: `{ name, prompt }`
    pub const DECOMPOSE_SWARM: &str = "decompose_swarm";
    /// One dispatch tick for a running swarm: `{ swarmId }`
    pub const DISPATCH_SWARM_TASKS: &str = "dispatch_swarm_tasks";
    /// Inbound session-lifecycle signal: `{ sessionId, status, result? }`
    pub const PROCESS_SESSION: &str = "process_session";
}

#[derive(Debug, Deserialize)]
struct DecomposePayload {
    name: String,
    prompt: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DispatchPayload {
    swarm_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionUpdatePayload {
    session_id: String,
    status: String,
    #[serde(default)]
    result: Option<String>,
}

/// Map an external session state onto a task status. Unknown states are
/// ignored rather than rejected; the session vocabulary is not ours.
fn task_status_for_session(state: &str) -> Option<TaskStatus> {
    match state {
        "running" | "in_progress" => Some(TaskStatus::Running),
        "completed" => Some(TaskStatus::Completed),
        "failed" => Some(TaskStatus::Failed),
        _ => None,
    }
}

/// Routes claimed jobs to their handlers.
pub struct JobRouter {
    coordinator: Arc<SwarmCoordinator>,
    dispatcher: Arc<TaskDispatcher>,
}

impl JobRouter {
    pub fn new(coordinator: Arc<SwarmCoordinator>, dispatcher: Arc<TaskDispatcher>) -> Self {
        Self {
            coordinator,
            dispatcher,
        }
    }

    /// Run one job to completion.
    pub async fn handle(&self, job: &Job) -> Result<()> {
        match job.name.as_str() {
            job_names::DECOMPOSE_SWARM => {
                let payload: DecomposePayload = serde_json::from_value(job.payload.clone())
                    .context("Malformed decompose payload")?;
                self.coordinator
                    .decompose(&payload.name, &payload.prompt)
                    .await?;
                Ok(())
            }
            job_names::DISPATCH_SWARM_TASKS => {
                let payload: DispatchPayload = serde_json::from_value(job.payload.clone())
                    .context("Malformed dispatch payload")?;
                self.dispatcher
                    .dispatch_pending_tasks(&payload.swarm_id)
                    .await
            }
            job_names::PROCESS_SESSION => {
                let payload: SessionUpdatePayload = serde_json::from_value(job.payload.clone())
                    .context("Malformed session payload")?;
                if let Some(status) = task_status_for_session(&payload.status) {
                    self.dispatcher.apply_session_update(
                        &payload.session_id,
                        status,
                        payload.result.as_deref(),
                    )?;
                }
                Ok(())
            }
            other => anyhow::bail!("Unknown job name: {}", other),
        }
    }
}

/// Bounded pool of queue workers.
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    router: Arc<JobRouter>,
    concurrency: usize,
    poll_interval: Duration,
}

/// Handle to a running pool; dropping it does not stop the workers.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Signal all workers and wait for them to finish their current job.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

impl WorkerPool {
    pub fn new(queue: Arc<JobQueue>, router: Arc<JobRouter>, concurrency: usize) -> Self {
        Self {
            queue,
            router,
            concurrency: concurrency.max(1),
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Shorten the idle poll. Tests use this to keep latency low.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Spawn the workers.
    pub fn start(&self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::with_capacity(self.concurrency);

        for worker_id in 0..self.concurrency {
            let queue = Arc::clone(&self.queue);
            let router = Arc::clone(&self.router);
            let mut shutdown = shutdown_rx.clone();
            let poll_interval = self.poll_interval;

            workers.push(tokio::spawn(async move {
                tracing::debug!("Worker {} started", worker_id);
                loop {
                    if *shutdown.borrow() {
                        break;
                    }

                    match queue.claim_next() {
                        Ok(Some(job)) => {
                            let outcome = router.handle(&job).await;
                            match outcome {
                                Ok(()) => {
                                    tracing::info!("Job {} ({}) completed", job.id, job.name);
                                    if let Err(e) = queue.complete(job.id) {
                                        tracing::error!(
                                            "Failed to mark job {} completed: {}",
                                            job.id,
                                            e
                                        );
                                    }
                                }
                                Err(e) => {
                                    tracing::error!("Job {} ({}) failed: {}", job.id, job.name, e);
                                    if let Err(e) = queue.fail(job.id, &e.to_string()) {
                                        tracing::error!(
                                            "Failed to record job {} failure: {}",
                                            job.id,
                                            e
                                        );
                                    }
                                }
                            }
                        }
                        Ok(None) => {
                            tokio::select! {
                                _ = tokio::time::sleep(poll_interval) => {}
                                _ = shutdown.changed() => {}
                            }
                        }
                        Err(e) => {
                            tracing::error!("Worker {} claim error: {}", worker_id, e);
                            tokio::time::sleep(poll_interval).await;
                        }
                    }
                }
                tracing::debug!("Worker {} stopped", worker_id);
            }));
        }

        WorkerHandle {
            shutdown: shutdown_tx,
            workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderRegistry;
    use crate::queue::queue::JobStatus;
    use crate::session::{SessionClient, SessionError, SessionHandle};
    use crate::state::{KeeperDb, KeeperSettings, NewTask, SwarmManager, SwarmStatus};
    use crate::swarm::EventBus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSessionClient {
        counter: AtomicUsize,
    }

    #[async_trait]
    impl SessionClient for CountingSessionClient {
        async fn create_session(
            &self,
            _source: Option<&str>,
            _prompt: &str,
            _title: &str,
        ) -> Result<SessionHandle, SessionError> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(SessionHandle {
                id: format!("sess-{}", n),
            })
        }
    }

    struct Rig {
        db: Arc<KeeperDb>,
        queue: Arc<JobQueue>,
        router: Arc<JobRouter>,
    }

    fn rig() -> Rig {
        let db = Arc::new(KeeperDb::open_in_memory().unwrap());
        let mut settings = KeeperSettings::default();
        settings.agent_api_key = Some("agent-key".into());
        settings.save(&db).unwrap();

        let events = EventBus::default();
        let coordinator = Arc::new(SwarmCoordinator::new(
            Arc::clone(&db),
            ProviderRegistry::empty(),
            events.clone(),
        ));
        let dispatcher = Arc::new(TaskDispatcher::new(
            Arc::clone(&db),
            Arc::new(CountingSessionClient {
                counter: AtomicUsize::new(0),
            }),
            events,
        ));

        Rig {
            db: Arc::clone(&db),
            queue: Arc::new(JobQueue::new(&db)),
            router: Arc::new(JobRouter::new(coordinator, dispatcher)),
        }
    }

    fn seed_running_swarm(db: &KeeperDb, titles: &[&str]) -> String {
        let manager = SwarmManager::new(db);
        let swarm = manager.create_swarm("test", "goal").unwrap();
        for (i, title) in titles.iter().enumerate() {
            manager
                .insert_task(
                    &swarm.id,
                    NewTask {
                        title: title.to_string(),
                        prompt: "p".into(),
                        depends_on: vec![],
                        priority: i as i64,
                    },
                )
                .unwrap();
        }
        manager.mark_running(&swarm.id, titles.len() as i64).unwrap();
        swarm.id
    }

    #[tokio::test]
    async fn test_router_runs_dispatch_jobs() {
        let r = rig();
        let swarm_id = seed_running_swarm(&r.db, &["A"]);

        let id = r
            .queue
            .enqueue(
                job_names::DISPATCH_SWARM_TASKS,
                serde_json::json!({ "swarmId": swarm_id }),
            )
            .unwrap();
        let job = r.queue.claim_next().unwrap().unwrap();
        assert_eq!(job.id, id);

        r.router.handle(&job).await.unwrap();

        let tasks = SwarmManager::new(&r.db).tasks(&swarm_id).unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Dispatched);
    }

    #[tokio::test]
    async fn test_router_applies_session_updates() {
        let r = rig();
        let swarm_id = seed_running_swarm(&r.db, &["A"]);

        // Dispatch first so the task owns a session
        r.queue
            .enqueue(
                job_names::DISPATCH_SWARM_TASKS,
                serde_json::json!({ "swarmId": swarm_id }),
            )
            .unwrap();
        let job = r.queue.claim_next().unwrap().unwrap();
        r.router.handle(&job).await.unwrap();

        let manager = SwarmManager::new(&r.db);
        let session_id = manager.tasks(&swarm_id).unwrap()[0]
            .session_id
            .clone()
            .unwrap();

        r.queue
            .enqueue(
                job_names::PROCESS_SESSION,
                serde_json::json!({
                    "sessionId": session_id,
                    "status": "completed",
                    "result": "shipped"
                }),
            )
            .unwrap();
        let job = r.queue.claim_next().unwrap().unwrap();
        r.router.handle(&job).await.unwrap();

        let task = &manager.tasks(&swarm_id).unwrap()[0];
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("shipped"));
    }

    #[tokio::test]
    async fn test_router_ignores_unknown_session_states() {
        let r = rig();
        let job = Job {
            id: 1,
            name: job_names::PROCESS_SESSION.to_string(),
            payload: serde_json::json!({ "sessionId": "sess-0", "status": "planning" }),
            status: JobStatus::Active,
            attempts: 1,
            max_attempts: 3,
            last_error: None,
            run_at: chrono::Utc::now(),
            created_at: chrono::Utc::now(),
        };
        // No task owns sess-0 and the state is unknown; both are tolerated
        r.router.handle(&job).await.unwrap();
    }

    #[tokio::test]
    async fn test_router_rejects_unknown_job_names() {
        let r = rig();
        let job = Job {
            id: 1,
            name: "ci_fix".to_string(),
            payload: serde_json::json!({}),
            status: JobStatus::Active,
            attempts: 1,
            max_attempts: 3,
            last_error: None,
            run_at: chrono::Utc::now(),
            created_at: chrono::Utc::now(),
        };
        assert!(r.router.handle(&job).await.is_err());
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_shuts_down() {
        let r = rig();
        let swarm_id = seed_running_swarm(&r.db, &["A", "B"]);

        let job_id = r
            .queue
            .enqueue(
                job_names::DISPATCH_SWARM_TASKS,
                serde_json::json!({ "swarmId": swarm_id }),
            )
            .unwrap();

        let pool = WorkerPool::new(Arc::clone(&r.queue), Arc::clone(&r.router), 2)
            .with_poll_interval(Duration::from_millis(10));
        let handle = pool.start();

        // Wait for the job to complete
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if r.queue.get(job_id).unwrap().status == JobStatus::Completed {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "job never completed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handle.shutdown().await;

        let tasks = SwarmManager::new(&r.db).tasks(&swarm_id).unwrap();
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Dispatched));
        assert_eq!(
            SwarmManager::new(&r.db).load(&swarm_id).unwrap().status,
            SwarmStatus::Running
        );
    }

    #[tokio::test]
    async fn test_failed_handler_propagates_to_queue_policy() {
        let r = rig();
        // Dispatch for a swarm that does not exist: the handler errors
        let id = r
            .queue
            .enqueue(
                job_names::DISPATCH_SWARM_TASKS,
                serde_json::json!({ "swarmId": "no-such-swarm" }),
            )
            .unwrap();

        let job = r.queue.claim_next().unwrap().unwrap();
        let err = r.router.handle(&job).await.unwrap_err();
        r.queue.fail(job.id, &err.to_string()).unwrap();

        let job = r.queue.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.last_error.is_some());
    }
}
