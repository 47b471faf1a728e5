//! plenum-worker: runs a pool of claim loops against the jobs queue.
//!
//! # Usage
//!
//! ```bash
//! # Workers against Postgres, Redis and SQS from the environment
//! plenum-worker --workers 8
//!
//! # Self-contained in-process backends, for local smoke tests
//! plenum-worker --memory
//! ```

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use plenum_core::Config;
use plenum_etl::{DatasetStore, MemoryDatasetStore, MemoryMetaStore, MetaStore, PgDatasetStore, PgMetaStore, SyncEngine};
use plenum_queue::{DurableQueue, MemoryQueue, SqsQueue};
use plenum_tickets::{JobClient, MemoryTicketStore, RedisTicketStore, TicketStore};
use plenum_worker::db::init_pg_pool;
use plenum_worker::{
    Claimer, DispatchTable, LogOnlyProtection, MemoryWorkerRegistry, PgWorkerRegistry, WorkerPool, WorkerRegistry,
};

#[derive(Parser, Debug)]
#[command(name = "plenum-worker", version, about)]
struct Cli {
    /// Number of concurrent claim loops (overrides WORKER_COUNT).
    #[arg(long)]
    workers: Option<u32>,

    /// Use in-process queue, ticket store and dataset stores.
    #[arg(long)]
    memory: bool,

    /// Configuration profile; keys resolve `<PROFILE>_<KEY>` before `<KEY>`.
    #[arg(long, env = "PLENUM_PROFILE")]
    profile: Option<String>,
}

struct Backends {
    queue: Arc<dyn DurableQueue>,
    tickets: Arc<dyn TicketStore>,
    datasets: Arc<dyn DatasetStore>,
    meta: Arc<dyn MetaStore>,
    registry: Arc<dyn WorkerRegistry>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.profile {
        Some(profile) => Config::for_profile(profile),
        None => Config::from_env(),
    };
    if let Some(workers) = cli.workers {
        config.worker.workers = workers;
    }
    config.log_summary();

    let backends = if cli.memory {
        info!("Using in-memory backends");
        Backends {
            queue: Arc::new(MemoryQueue::new(config.queue.visibility_timeout_secs)),
            tickets: Arc::new(MemoryTicketStore::new(config.tickets.ttl_secs)),
            datasets: Arc::new(MemoryDatasetStore::new()),
            meta: Arc::new(MemoryMetaStore::new()),
            registry: Arc::new(MemoryWorkerRegistry::new()),
        }
    } else {
        config.validate().context("invalid configuration")?;
        let pool = init_pg_pool(&config.postgres)
            .await
            .context("failed to initialise PostgreSQL")?;
        let tickets = RedisTicketStore::connect(&config.tickets)
            .await
            .context("failed to connect to the ticket store")?;
        let queue = SqsQueue::new(&config.aws, &config.queue)
            .await
            .context("failed to create the queue client")?;
        Backends {
            queue: Arc::new(queue),
            tickets: Arc::new(tickets),
            datasets: Arc::new(PgDatasetStore::new(pool.clone(), config.etl.insert_batch_rows)),
            meta: Arc::new(PgMetaStore::new(pool.clone())),
            registry: Arc::new(PgWorkerRegistry::new(pool)),
        }
    };

    let engine = SyncEngine::new(backends.datasets, backends.meta, &config.etl);
    let jobs = JobClient::new(backends.tickets.clone(), backends.queue.clone());
    let dispatch = DispatchTable::new(engine, backends.tickets.clone(), jobs, &config.etl, &config.worker);
    let claimer = Claimer::new(backends.tickets, backends.queue, Arc::new(dispatch), &config.worker)
        .with_keepalive(config.queue.visibility_timeout_secs);
    let pool = WorkerPool::new(
        claimer,
        backends.registry,
        Arc::new(LogOnlyProtection::new()),
        config.worker.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        os_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    pool.run(shutdown_rx).await.context("worker pool failed")?;
    Ok(())
}

/// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C elsewhere.
async fn os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
            }
            _ => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
