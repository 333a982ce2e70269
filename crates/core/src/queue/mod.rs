//! # Job Queue / Worker Harness
//!
//! Durable, bounded-concurrency execution surface. A periodic scheduler
//! tick enqueues work; workers pull jobs and route them by name to the
//! coordinator, dispatcher, and session-update handlers.

pub mod queue;
pub mod scheduler;
pub mod worker;

pub use queue::{Job, JobQueue, JobStatus};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use worker::{job_names, JobRouter, WorkerHandle, WorkerPool};
