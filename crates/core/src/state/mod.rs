pub mod breaker_state;
pub mod db;
pub mod settings;
pub mod swarm_state;

pub use db::KeeperDb;

pub use breaker_state::{BreakerDefaults, BreakerRecord, BreakerStore, CircuitState};
pub use settings::KeeperSettings;
pub use swarm_state::{
    NewTask, Swarm, SwarmEventRecord, SwarmManager, SwarmStatus, SwarmTask, TaskStatus,
};
