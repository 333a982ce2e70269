//! Keeper Daemon
//!
//! Wires the orchestration core together and runs it: durable queue,
//! bounded worker pool, periodic scheduler, and an event subscriber that
//! mirrors orchestration progress into the logs.

use anyhow::Result;
use clap::{Parser, Subcommand};
use keeper_core::provider::ProviderRegistry;
use keeper_core::queue::{JobQueue, JobRouter, Scheduler, WorkerPool};
use keeper_core::session::HttpSessionClient;
use keeper_core::state::{BreakerStore, KeeperDb, KeeperSettings};
use keeper_core::swarm::{EventBus, SwarmCoordinator, TaskDispatcher};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keeper", about = "Autonomous task-orchestration daemon")]
struct Cli {
    /// Path to the keeper database
    #[arg(long, default_value = ".keeper/keeper.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestration daemon (default)
    Run,
    /// Queue a new swarm for decomposition
    Swarm {
        /// Goal prompt to decompose
        prompt: String,
        /// Display name for the swarm
        #[arg(long)]
        name: Option<String>,
    },
    /// Show circuit breaker states
    Breakers,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let db = Arc::new(KeeperDb::open_at(&cli.db)?);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(db).await,
        Command::Swarm { prompt, name } => {
            let queue = Arc::new(JobQueue::new(&db));
            let scheduler = Scheduler::new(Arc::clone(&db), queue);
            let name = name
                .unwrap_or_else(|| format!("Swarm {}", chrono::Utc::now().format("%Y-%m-%dT%H:%M")));
            let job_id = scheduler.request_swarm(&name, &prompt)?;
            println!("Queued decomposition job {} for \"{}\"", job_id, name);
            Ok(())
        }
        Command::Breakers => {
            let store = BreakerStore::new(&db);
            for record in store.list_all()? {
                println!(
                    "{:<40} {:<10} failures={} successes={}",
                    record.key,
                    record.state.as_str(),
                    record.failure_count,
                    record.success_count
                );
            }
            Ok(())
        }
    }
}

async fn run_daemon(db: Arc<KeeperDb>) -> Result<()> {
    let settings = KeeperSettings::load(&db)?;

    let events = EventBus::default();
    let registry = ProviderRegistry::with_defaults();

    let agent_api_key = settings
        .agent_api_key
        .clone()
        .or_else(|| std::env::var("AGENT_API_KEY").ok())
        .unwrap_or_default();
    let agent_base_url = settings
        .agent_base_url
        .clone()
        .or_else(|| std::env::var("AGENT_BASE_URL").ok())
        .unwrap_or_else(|| "http://localhost:8080/v1".to_string());

    let sessions = Arc::new(HttpSessionClient::new(
        reqwest::Client::new(),
        agent_api_key,
        agent_base_url,
    ));

    let coordinator = Arc::new(SwarmCoordinator::new(
        Arc::clone(&db),
        registry,
        events.clone(),
    ));
    let dispatcher = Arc::new(TaskDispatcher::new(
        Arc::clone(&db),
        sessions,
        events.clone(),
    ));

    let queue = Arc::new(JobQueue::new(&db));
    let router = Arc::new(JobRouter::new(coordinator, dispatcher));

    let pool = WorkerPool::new(Arc::clone(&queue), router, settings.worker_concurrency);
    let workers = pool.start();

    let scheduler = Scheduler::new(Arc::clone(&db), Arc::clone(&queue)).start();

    // Mirror orchestration events into the logs
    let mut rx = events.subscribe();
    let event_logger = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    tracing::info!(kind = event.kind.as_str(), "orchestration event");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event logger lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    tracing::info!("Keeper daemon running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    scheduler.shutdown().await;
    workers.shutdown().await;
    event_logger.abort();

    Ok(())
}
