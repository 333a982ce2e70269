//! # Swarm Orchestration
//!
//! One goal prompt becomes a swarm: a persisted dependency graph of
//! sub-tasks, each dispatched as an external agent session.
//!
//! ## Flow
//!
//! ```text
//! Goal -> Coordinator (decompose) -> pending tasks
//!      -> Dispatcher (per tick)   -> external sessions -> completion
//! ```

pub mod coordinator;
pub mod dispatcher;
pub mod events;

pub use coordinator::SwarmCoordinator;
pub use dispatcher::{TaskDispatcher, MAX_PARALLEL};
pub use events::{DaemonEvent, EventBus, EventKind};

use crate::state::{SwarmEventRecord, SwarmManager};

/// Append an event to a swarm's bounded persisted log. Best-effort: a
/// failed append is traced, never propagated.
pub(crate) fn persist_event(
    manager: &SwarmManager,
    swarm_id: &str,
    kind: &EventKind,
    data: serde_json::Value,
) {
    let record = SwarmEventRecord {
        event: kind.as_str().to_string(),
        data,
        timestamp: chrono::Utc::now(),
    };
    if let Err(e) = manager.append_event(swarm_id, record) {
        tracing::warn!("Failed to persist swarm event: {}", e);
    }
}
