mod cli;
mod output;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::debug;

use plenum_core::Config;
use plenum_etl::{ColumnRoles, NewDataset, PgDatasetStore, PgMetaStore, SyncEngine};
use plenum_queue::SqsQueue;
use plenum_tickets::{JobClient, JobView, RedisTicketStore, TicketId};
use plenum_worker::db::init_pg_pool;
use plenum_worker::{PgWorkerRegistry, WorkerRegistry};

use crate::cli::{CliArgs, Command, RegisterArgs};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    let config = match &args.profile {
        Some(profile) => Config::for_profile(profile),
        None => Config::from_env(),
    };

    match args.command {
        Command::Submit {
            endpoint,
            query,
            wait,
            wait_timeout,
        } => {
            let jobs = job_client(&config).await?;
            let ticket = jobs
                .submit(&endpoint, query.into_iter().collect())
                .await
                .context("failed to submit job")?;
            output::print_ticket(&ticket)?;
            if wait {
                let view = wait_for(&jobs, &ticket, Duration::from_secs(wait_timeout)).await?;
                output::print_job(&view)?;
            }
        }
        Command::Status { ticket } => {
            let ticket: TicketId = ticket.parse().context("invalid ticket id")?;
            let jobs = job_client(&config).await?;
            match jobs.job(&ticket).await.context("failed to read ticket")? {
                Some(view) => output::print_job(&view)?,
                None => {
                    output::print_error(&format!("unknown or expired ticket {ticket}"))?;
                    std::process::exit(2);
                }
            }
        }
        Command::Register(register) => {
            let pool = init_pg_pool(&config.postgres)
                .await
                .context("failed to initialise PostgreSQL")?;
            let engine = SyncEngine::new(
                Arc::new(PgDatasetStore::new(pool.clone(), config.etl.insert_batch_rows)),
                Arc::new(PgMetaStore::new(pool)),
                &config.etl,
            );
            let meta = engine
                .register(new_dataset(register))
                .await
                .context("failed to register dataset")?;
            output::print_json(&serde_json::to_value(meta)?)?;
        }
        Command::Workers => {
            let pool = init_pg_pool(&config.postgres)
                .await
                .context("failed to initialise PostgreSQL")?;
            let workers = PgWorkerRegistry::new(pool)
                .list()
                .await
                .context("failed to list workers")?;
            output::print_workers(&workers, Utc::now())?;
        }
    }

    Ok(())
}

async fn job_client(config: &Config) -> Result<JobClient> {
    if config.queue.queue_url.is_empty() {
        bail!("JOBS_QUEUE_URL is not set");
    }
    let tickets = RedisTicketStore::connect(&config.tickets)
        .await
        .context("failed to connect to the ticket store")?;
    let queue = SqsQueue::new(&config.aws, &config.queue)
        .await
        .context("failed to create the queue client")?;
    Ok(JobClient::new(Arc::new(tickets), Arc::new(queue)))
}

async fn wait_for(jobs: &JobClient, ticket: &TicketId, timeout: Duration) -> Result<JobView> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let Some(view) = jobs.job(ticket).await.context("failed to read ticket")? else {
            bail!("ticket {ticket} expired while waiting");
        };
        if view.status.status.is_terminal() {
            return Ok(view);
        }
        debug!(ticket = %ticket, status = %view.status.status, "Waiting for ticket");
        if tokio::time::Instant::now() + POLL_INTERVAL > deadline {
            bail!(
                "ticket {ticket} still {} after {}s",
                view.status.status,
                timeout.as_secs()
            );
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn new_dataset(args: RegisterArgs) -> NewDataset {
    NewDataset {
        human_name: args.name,
        source_url: args.url,
        roles: ColumnRoles {
            observed_date: args.observed_date,
            latitude: args.latitude,
            longitude: args.longitude,
            location: args.location,
            business_key: args.business_key,
        },
        update_freq: args.update_freq,
    }
}
