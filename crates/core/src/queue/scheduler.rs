//! # Scheduler
//!
//! Fixed-interval polling loop that feeds the queue: one dispatch-tick job
//! per running swarm per tick. Decomposition jobs enter the queue at
//! request time via [`Scheduler::request_swarm`]. The scheduler is an
//! explicit object with a start/stop lifecycle; ticks are directly callable
//! so tests never need real timers.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::state::{KeeperDb, KeeperSettings, SwarmManager, SwarmStatus};

use super::queue::JobQueue;
use super::worker::job_names;

/// Periodic tick source for the orchestration queue.
pub struct Scheduler {
    db: Arc<KeeperDb>,
    queue: Arc<JobQueue>,
}

/// Handle to a running scheduler loop.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

impl Scheduler {
    pub fn new(db: Arc<KeeperDb>, queue: Arc<JobQueue>) -> Self {
        Self { db, queue }
    }

    /// Request decomposition of a new goal. Returns the queued job id; the
    /// coordinator creates the swarm when a worker picks the job up.
    pub fn request_swarm(&self, name: &str, prompt: &str) -> Result<i64> {
        self.queue.enqueue(
            job_names::DECOMPOSE_SWARM,
            serde_json::json!({ "name": name, "prompt": prompt }),
        )
    }

    /// One tick: enqueue a dispatch job for every running swarm. Duplicate
    /// enqueues across ticks are tolerated, the dispatcher is idempotent.
    /// Returns the number of jobs enqueued.
    pub fn tick(&self) -> Result<usize> {
        let manager = SwarmManager::new(&self.db);
        let running = manager.list_by_status(SwarmStatus::Running)?;

        for swarm in &running {
            self.queue.enqueue(
                job_names::DISPATCH_SWARM_TASKS,
                serde_json::json!({ "swarmId": swarm.id }),
            )?;
        }

        if !running.is_empty() {
            tracing::debug!("Scheduler tick enqueued {} dispatch jobs", running.len());
        }

        Ok(running.len())
    }

    /// Run the tick loop until shut down. The interval and the enabled
    /// flag are re-read from settings every iteration, so both can change
    /// at runtime.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            tracing::info!("Scheduler started");
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let settings = match KeeperSettings::load(&self.db) {
                    Ok(settings) => settings,
                    Err(e) => {
                        tracing::error!("Scheduler failed to load settings: {}", e);
                        KeeperSettings::default()
                    }
                };

                if settings.enabled {
                    if let Err(e) = self.tick() {
                        tracing::error!("Scheduler tick failed: {}", e);
                    }
                }

                let interval = Duration::from_secs(settings.check_interval_seconds.max(1));
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
            tracing::info!("Scheduler stopped");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::queue::JobStatus;
    use crate::state::NewTask;

    fn rig() -> (Arc<KeeperDb>, Arc<JobQueue>, Scheduler) {
        let db = Arc::new(KeeperDb::open_in_memory().unwrap());
        let queue = Arc::new(JobQueue::new(&db));
        let scheduler = Scheduler::new(Arc::clone(&db), Arc::clone(&queue));
        (db, queue, scheduler)
    }

    fn seed_swarm(db: &KeeperDb, status: SwarmStatus) -> String {
        let manager = SwarmManager::new(db);
        let swarm = manager.create_swarm("s", "p").unwrap();
        manager
            .insert_task(
                &swarm.id,
                NewTask {
                    title: "A".into(),
                    prompt: "p".into(),
                    depends_on: vec![],
                    priority: 0,
                },
            )
            .unwrap();
        match status {
            SwarmStatus::Running => manager.mark_running(&swarm.id, 1).unwrap(),
            SwarmStatus::Paused => {
                manager.mark_running(&swarm.id, 1).unwrap();
                manager.pause(&swarm.id).unwrap();
            }
            _ => {}
        }
        swarm.id
    }

    #[test]
    fn test_tick_enqueues_one_job_per_running_swarm() {
        let (db, queue, scheduler) = rig();
        let running_a = seed_swarm(&db, SwarmStatus::Running);
        let running_b = seed_swarm(&db, SwarmStatus::Running);
        seed_swarm(&db, SwarmStatus::Paused);
        seed_swarm(&db, SwarmStatus::Decomposing);

        let enqueued = scheduler.tick().unwrap();
        assert_eq!(enqueued, 2);
        assert_eq!(queue.queued_count().unwrap(), 2);

        let first = queue.claim_next().unwrap().unwrap();
        let second = queue.claim_next().unwrap().unwrap();
        assert_eq!(first.name, job_names::DISPATCH_SWARM_TASKS);
        let swarm_ids: Vec<String> = [&first, &second]
            .iter()
            .map(|j| j.payload["swarmId"].as_str().unwrap().to_string())
            .collect();
        assert!(swarm_ids.contains(&running_a));
        assert!(swarm_ids.contains(&running_b));
    }

    #[test]
    fn test_duplicate_ticks_are_tolerated() {
        let (db, queue, scheduler) = rig();
        seed_swarm(&db, SwarmStatus::Running);

        scheduler.tick().unwrap();
        scheduler.tick().unwrap();

        // Two jobs for the same swarm; the dispatcher's idempotence makes
        // the duplicate harmless.
        assert_eq!(queue.queued_count().unwrap(), 2);
    }

    #[test]
    fn test_request_swarm_enqueues_decomposition() {
        let (_db, queue, scheduler) = rig();
        let id = scheduler.request_swarm("Add Auth", "Add login").unwrap();

        let job = queue.claim_next().unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.name, job_names::DECOMPOSE_SWARM);
        assert_eq!(job.payload["name"], "Add Auth");
        assert_eq!(job.payload["prompt"], "Add login");
        assert_eq!(job.status, JobStatus::Active);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let (_db, _queue, scheduler) = rig();
        let handle = scheduler.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.shutdown().await;
    }
}
