//! # Keeper Core
//!
//! Task-orchestration core: decomposes a high-level goal into a dependency
//! graph of sub-tasks, dispatches them with bounded concurrency to
//! externally-run agent sessions, and guards every completion call with a
//! per-(provider, model) circuit breaker.
//!
//! ## Architecture
//!
//! - `breaker/` - circuit breaker state machine + persistence adapter
//! - `provider/` - completion-provider trait, registry, HTTP implementations
//! - `state/` - SQLite persistence (swarms, tasks, breaker rows, settings)
//! - `swarm/` - coordinator (decompose) and dispatcher (dispatch ticks)
//! - `queue/` - durable job queue, worker pool, scheduler
//!
//! ## Usage
//!
//! ```rust,ignore
//! use keeper_core::provider::ProviderRegistry;
//! use keeper_core::state::KeeperDb;
//! use keeper_core::swarm::{EventBus, SwarmCoordinator};
//!
//! let db = Arc::new(KeeperDb::open()?);
//! let coordinator = SwarmCoordinator::new(db, ProviderRegistry::with_defaults(), EventBus::default());
//! let swarm_id = coordinator.decompose("Add Auth", "Add login to the app").await?;
//! ```

pub mod audit;
pub mod breaker;
pub mod models;
pub mod provider;
pub mod queue;
pub mod session;
pub mod state;
pub mod swarm;
pub mod util;
