//! # Circuit Breaker
//!
//! Per-(provider, model) resilience guard implementing the standard
//! closed -> open -> half-open -> closed state machine:
//!
//! - CLOSED: normal operation, failures increment a counter. At
//!   `threshold` consecutive failures -> OPEN.
//! - OPEN: callers are told to use the fallback model. After `recovery_ms`
//!   the next check transitions to HALF_OPEN and allows one probe.
//! - HALF_OPEN: probe allowed. Success -> CLOSED, failure -> OPEN.
//!
//! The state machine itself is a set of pure functions over
//! [`BreakerRecord`]; [`CircuitBreaker`] is the persistence adapter that
//! reads a row, applies a transition, and writes it back. The breaker only
//! decides and bookkeeps - retry policy belongs to the caller, and a deny
//! is a verdict, never an error.

pub mod transition;

use crate::state::{BreakerDefaults, BreakerRecord, BreakerStore, CircuitState, KeeperDb};
use crate::util::{Clock, SystemClock};
use anyhow::Result;
use std::sync::Arc;

/// Outcome of a [`CircuitBreaker::should_allow`] check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerVerdict {
    /// Whether the guarded model may be called
    pub allowed: bool,
    /// Model to reroute to when denied
    pub fallback: Option<String>,
    /// Circuit position after the check
    pub state: CircuitState,
}

/// Persistence adapter for one (provider, model) pair.
pub struct CircuitBreaker {
    store: BreakerStore,
    clock: Arc<dyn Clock>,
    provider: String,
    model: String,
    defaults: BreakerDefaults,
}

impl CircuitBreaker {
    /// Breaker for a provider/model pair with default thresholds and the
    /// system clock.
    pub fn new(db: &KeeperDb, provider: &str, model: &str) -> Self {
        Self {
            store: BreakerStore::new(db),
            clock: Arc::new(SystemClock),
            provider: provider.to_string(),
            model: model.to_string(),
            defaults: BreakerDefaults::default(),
        }
    }

    /// Inject a clock. Tests step across the recovery window with this.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override threshold / recovery / fallback for rows this breaker creates.
    pub fn with_defaults(mut self, defaults: BreakerDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Decide whether the guarded model may be called right now. Reading
    /// creates a default closed record if absent.
    pub fn should_allow(&self) -> Result<BreakerVerdict> {
        let record = self
            .store
            .get_or_create(&self.provider, &self.model, &self.defaults)?;

        let (next, verdict) = transition::check(record, self.clock.now());
        if let Some(next) = next {
            self.store.save(&next)?;
        }
        Ok(verdict)
    }

    /// Report a successful call against the guarded model.
    pub fn record_success(&self) -> Result<()> {
        let record = self
            .store
            .get_or_create(&self.provider, &self.model, &self.defaults)?;
        let next = transition::on_success(record, self.clock.now());
        self.store.save(&next)
    }

    /// Report a failed call against the guarded model.
    pub fn record_failure(&self) -> Result<()> {
        let record = self
            .store
            .get_or_create(&self.provider, &self.model, &self.defaults)?;
        let next = transition::on_failure(record, self.clock.now());
        self.store.save(&next)
    }

    /// Current persisted record, for monitoring.
    pub fn snapshot(&self) -> Result<BreakerRecord> {
        self.store
            .get_or_create(&self.provider, &self.model, &self.defaults)
    }
}
