//! # Orchestration Events
//!
//! Fire-and-forget progress events for external observers (dashboards,
//! websocket bridges). Emission never blocks and never fails orchestration:
//! with no subscribers the event is simply dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Kind of orchestration event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A swarm row was created
    SwarmCreated,
    /// Swarm status or totals changed
    SwarmUpdated,
    /// A sub-task changed status
    SwarmTaskUpdated,
    /// All tasks reached a terminal state
    SwarmCompleted,
    // === Sub-task lifecycle narration ===
    /// Decomposition is analyzing the goal
    TaskPondering,
    /// A sub-task's external session started
    TaskExecuting,
    /// Decomposition finished, tasks persisted
    TaskFinalizing,
}

impl EventKind {
    /// Stable name, also used in the persisted per-swarm event log.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SwarmCreated => "swarm_created",
            Self::SwarmUpdated => "swarm_updated",
            Self::SwarmTaskUpdated => "swarm_task_updated",
            Self::SwarmCompleted => "swarm_completed",
            Self::TaskPondering => "swarm:task_pondering",
            Self::TaskExecuting => "swarm:task_executing",
            Self::TaskFinalizing => "swarm:task_finalizing",
        }
    }
}

/// An event published to external observers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonEvent {
    /// Unique event ID
    pub id: String,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// Kind of event
    pub kind: EventKind,
    /// Associated payload (JSON)
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl DaemonEvent {
    /// Create a new event
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            data: None,
        }
    }

    /// Add payload to the event
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Broadcast bus for orchestration events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DaemonEvent>,
}

impl EventBus {
    /// Bus with the given subscriber buffer size.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Fire-and-forget: a bus without subscribers drops
    /// the event silently.
    pub fn emit(&self, event: DaemonEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let event = DaemonEvent::new(EventKind::SwarmCreated)
            .with_data(serde_json::json!({ "swarmId": "s-1" }));
        assert_eq!(event.kind, EventKind::SwarmCreated);
        assert_eq!(event.data.unwrap()["swarmId"], "s-1");
    }

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(DaemonEvent::new(EventKind::TaskExecuting));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, EventKind::TaskExecuting);
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.emit(DaemonEvent::new(EventKind::SwarmUpdated));
    }

    #[test]
    fn test_kind_names_are_stable() {
        assert_eq!(EventKind::TaskPondering.as_str(), "swarm:task_pondering");
        assert_eq!(EventKind::SwarmCompleted.as_str(), "swarm_completed");
    }
}
