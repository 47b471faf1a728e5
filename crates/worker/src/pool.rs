//! Worker pool: N independent claim loops under one supervisor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use plenum_core::config::WorkerConfig;

use crate::claim::Claimer;
use crate::error::WorkerError;
use crate::protection::ScaleInProtection;
use crate::registry::{Registration, WorkerRegistry};

struct Slot {
    registration: Arc<Registration>,
    handle: JoinHandle<()>,
}

/// Runs the configured number of claim loops.
///
/// Loops coordinate only through the ticket store and the queue. The
/// supervisor tick checks every live worker into the registry, revives loops
/// that died, and keeps scale-in protection on while any job is running.
pub struct WorkerPool {
    claimer: Arc<Claimer>,
    registry: Arc<dyn WorkerRegistry>,
    protection: Arc<dyn ScaleInProtection>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(
        claimer: Claimer,
        registry: Arc<dyn WorkerRegistry>,
        protection: Arc<dyn ScaleInProtection>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            claimer: Arc::new(claimer),
            registry,
            protection,
            config,
        }
    }

    /// Run until `shutdown` turns true (or its sender is dropped). Loops
    /// finish the job in hand before exiting. After `shutdown_timeout_secs`
    /// idle stragglers are aborted; a loop that still holds a claim is
    /// always waited for, so no ticket is left `processing`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        match self.claimer.queue().health_check().await {
            Ok(health) => info!(%health, "Queue reachable"),
            Err(e) => warn!(error = %e, "Queue health check failed"),
        }

        let mut slots = Vec::with_capacity(self.config.workers as usize);
        let mut last_error = None;
        for _ in 0..self.config.workers {
            match self.spawn_slot(shutdown.clone()).await {
                Ok(slot) => slots.push(Some(slot)),
                Err(e) => {
                    error!(error = %e, "Failed to start claim loop");
                    last_error = Some(e);
                    slots.push(None);
                }
            }
        }
        if let (true, Some(e)) = (slots.iter().all(Option::is_none), last_error) {
            return Err(e);
        }
        info!(workers = slots.iter().flatten().count(), "Worker pool started");

        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.heartbeat_secs.max(1)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.supervise(&mut slots, &shutdown).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.drain(slots).await;
        Ok(())
    }

    async fn spawn_slot(&self, shutdown: watch::Receiver<bool>) -> Result<Slot, WorkerError> {
        let registration = Arc::new(Registration::acquire(self.registry.clone()).await?);
        let handle = tokio::spawn(claim_loop(
            self.claimer.clone(),
            registration.clone(),
            Duration::from_secs(self.config.idle_wait_secs),
            shutdown,
        ));
        Ok(Slot { registration, handle })
    }

    async fn supervise(&self, slots: &mut [Option<Slot>], shutdown: &watch::Receiver<bool>) {
        for slot in slots.iter_mut() {
            if slot.as_ref().is_some_and(|s| !s.handle.is_finished()) {
                continue;
            }
            if let Some(dead) = slot.take() {
                warn!(worker = %dead.registration.name(), "Claim loop exited unexpectedly, reviving");
                dead.registration.release().await;
            }
            match self.spawn_slot(shutdown.clone()).await {
                Ok(revived) => *slot = Some(revived),
                Err(e) => warn!(error = %e, "Failed to revive claim loop"),
            }
        }

        let mut live = 0;
        let mut active = 0;
        for slot in slots.iter().flatten() {
            live += 1;
            if slot.registration.is_busy() {
                active += 1;
            }
            if let Err(e) = slot.registration.check_in().await {
                warn!(worker = %slot.registration.name(), error = %e, "Worker check-in failed");
            }
        }

        if let Err(e) = self.protection.set_protected(active > 0).await {
            warn!(error = %e, "Failed to update scale-in protection");
        }
        info!(workers = live, active, "Worker pool report");
    }

    async fn drain(&self, slots: Vec<Option<Slot>>) {
        let timeout = Duration::from_secs(self.config.shutdown_timeout_secs);
        info!(?timeout, "Stopping worker pool");
        let deadline = tokio::time::Instant::now() + timeout;

        for Slot { registration, mut handle } in slots.into_iter().flatten() {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                if registration.is_busy() {
                    warn!(
                        worker = %registration.name(),
                        ticket = ?registration.active_ticket(),
                        "Shutdown timeout passed with a job in flight, waiting for it"
                    );
                    if let Err(e) = (&mut handle).await {
                        warn!(worker = %registration.name(), error = %e, "Claim loop ended abnormally");
                    }
                } else {
                    warn!(worker = %registration.name(), "Claim loop did not stop in time, aborting");
                    handle.abort();
                }
            }
            registration.release().await;
        }

        if let Err(e) = self.protection.set_protected(false).await {
            warn!(error = %e, "Failed to clear scale-in protection");
        }
        info!("Worker pool stopped");
    }
}

async fn claim_loop(
    claimer: Arc<Claimer>,
    registration: Arc<Registration>,
    idle_wait: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let worker = registration.name().to_string();
    info!(worker = %worker, "Claim loop started");

    while !*shutdown.borrow() {
        // A poll can be dropped safely: nothing is claimed yet.
        let polled = tokio::select! {
            polled = claimer.queue().poll() => polled,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        match polled {
            Ok(Some(message)) => match claimer.process_message(&registration, &message).await {
                Ok(disposition) => debug!(worker = %worker, message = %message.id, ?disposition, "Message settled"),
                Err(e) => warn!(worker = %worker, message = %message.id, error = %e, "Message left for redelivery"),
            },
            Ok(None) => {
                if idle(&mut shutdown, idle_wait).await {
                    break;
                }
            }
            Err(e) => {
                warn!(worker = %worker, error = %e, "Queue poll failed");
                if idle(&mut shutdown, idle_wait).await {
                    break;
                }
            }
        }
    }

    registration.release().await;
    info!(worker = %worker, "Claim loop stopped");
}

/// Sleep for `wait` unless shutdown arrives first. Returns whether to stop.
async fn idle(shutdown: &mut watch::Receiver<bool>, wait: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(wait) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
