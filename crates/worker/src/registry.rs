//! Worker Registry: one row per live worker, read by the autoscaler.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use plenum_tickets::TicketId;

use crate::error::WorkerError;
use crate::names::generate_name;

const MAX_NAME_ATTEMPTS: u32 = 20;

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct WorkerRecord {
    pub name: String,
    pub birth_time: DateTime<Utc>,
    pub last_check_in: DateTime<Utc>,
    pub active_ticket: Option<String>,
}

/// Every write is keyed by worker name and touches only that worker's row.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Insert a new row. Returns `false` when the name is already taken.
    async fn register(&self, name: &str, birth_time: DateTime<Utc>) -> Result<bool, WorkerError>;

    /// Refresh the heartbeat, recreating the row if it was removed.
    async fn check_in(
        &self,
        name: &str,
        birth_time: DateTime<Utc>,
        active_ticket: Option<&str>,
    ) -> Result<(), WorkerError>;

    async fn set_active_ticket(
        &self,
        name: &str,
        birth_time: DateTime<Utc>,
        active_ticket: Option<&str>,
    ) -> Result<(), WorkerError>;

    async fn deregister(&self, name: &str) -> Result<(), WorkerError>;

    async fn list(&self) -> Result<Vec<WorkerRecord>, WorkerError>;
}

// ── Postgres ──────────────────────────────────────────────────

pub struct PgWorkerRegistry {
    pool: PgPool,
}

impl PgWorkerRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkerRegistry for PgWorkerRegistry {
    async fn register(&self, name: &str, birth_time: DateTime<Utc>) -> Result<bool, WorkerError> {
        let result = sqlx::query(
            "INSERT INTO workers (name, birth_time, last_check_in) VALUES ($1, $2, $2) \
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(name)
        .bind(birth_time)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn check_in(
        &self,
        name: &str,
        birth_time: DateTime<Utc>,
        active_ticket: Option<&str>,
    ) -> Result<(), WorkerError> {
        sqlx::query(
            "INSERT INTO workers (name, birth_time, last_check_in, active_ticket) VALUES ($1, $2, now(), $3) \
             ON CONFLICT (name) DO UPDATE SET last_check_in = EXCLUDED.last_check_in",
        )
        .bind(name)
        .bind(birth_time)
        .bind(active_ticket)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_active_ticket(
        &self,
        name: &str,
        birth_time: DateTime<Utc>,
        active_ticket: Option<&str>,
    ) -> Result<(), WorkerError> {
        sqlx::query(
            "INSERT INTO workers (name, birth_time, last_check_in, active_ticket) VALUES ($1, $2, now(), $3) \
             ON CONFLICT (name) DO UPDATE \
             SET active_ticket = EXCLUDED.active_ticket, last_check_in = EXCLUDED.last_check_in",
        )
        .bind(name)
        .bind(birth_time)
        .bind(active_ticket)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deregister(&self, name: &str) -> Result<(), WorkerError> {
        sqlx::query("DELETE FROM workers WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<WorkerRecord>, WorkerError> {
        let rows = sqlx::query_as::<_, WorkerRecord>(
            "SELECT name, birth_time, last_check_in, active_ticket FROM workers ORDER BY birth_time, name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

// ── In-memory ─────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryWorkerRegistry {
    rows: RwLock<BTreeMap<String, WorkerRecord>>,
}

impl MemoryWorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<WorkerRecord> {
        self.rows.read().unwrap().get(name).cloned()
    }

    fn upsert(&self, name: &str, birth_time: DateTime<Utc>, update: impl FnOnce(&mut WorkerRecord)) {
        let mut rows = self.rows.write().unwrap();
        let row = rows.entry(name.to_string()).or_insert_with(|| WorkerRecord {
            name: name.to_string(),
            birth_time,
            last_check_in: Utc::now(),
            active_ticket: None,
        });
        update(row);
    }
}

#[async_trait]
impl WorkerRegistry for MemoryWorkerRegistry {
    async fn register(&self, name: &str, birth_time: DateTime<Utc>) -> Result<bool, WorkerError> {
        let mut rows = self.rows.write().unwrap();
        if rows.contains_key(name) {
            return Ok(false);
        }
        rows.insert(
            name.to_string(),
            WorkerRecord {
                name: name.to_string(),
                birth_time,
                last_check_in: birth_time,
                active_ticket: None,
            },
        );
        Ok(true)
    }

    async fn check_in(
        &self,
        name: &str,
        birth_time: DateTime<Utc>,
        active_ticket: Option<&str>,
    ) -> Result<(), WorkerError> {
        let missing = self.get(name).is_none();
        self.upsert(name, birth_time, |row| {
            row.last_check_in = Utc::now();
            if missing {
                row.active_ticket = active_ticket.map(str::to_string);
            }
        });
        Ok(())
    }

    async fn set_active_ticket(
        &self,
        name: &str,
        birth_time: DateTime<Utc>,
        active_ticket: Option<&str>,
    ) -> Result<(), WorkerError> {
        self.upsert(name, birth_time, |row| {
            row.last_check_in = Utc::now();
            row.active_ticket = active_ticket.map(str::to_string);
        });
        Ok(())
    }

    async fn deregister(&self, name: &str) -> Result<(), WorkerError> {
        self.rows.write().unwrap().remove(name);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<WorkerRecord>, WorkerError> {
        let mut rows: Vec<WorkerRecord> = self.rows.read().unwrap().values().cloned().collect();
        rows.sort_by(|a, b| (a.birth_time, &a.name).cmp(&(b.birth_time, &b.name)));
        Ok(rows)
    }
}

// ── Registration ──────────────────────────────────────────────

/// A worker's registry row, held for the lifetime of its claim loop.
///
/// Call [`Registration::release`] when the loop ends. A registration dropped
/// without being released (the loop panicked or was aborted) deregisters in
/// a background task.
pub struct Registration {
    registry: Arc<dyn WorkerRegistry>,
    name: String,
    birth_time: DateTime<Utc>,
    active: Mutex<Option<TicketId>>,
    released: AtomicBool,
}

impl Registration {
    /// Register under a fresh generated name, retrying on collision.
    pub async fn acquire(registry: Arc<dyn WorkerRegistry>) -> Result<Self, WorkerError> {
        let birth_time = Utc::now();
        for _ in 0..MAX_NAME_ATTEMPTS {
            let name = generate_name();
            if registry.register(&name, birth_time).await? {
                info!(worker = %name, "Worker registered");
                return Ok(Self {
                    registry,
                    name,
                    birth_time,
                    active: Mutex::new(None),
                    released: AtomicBool::new(false),
                });
            }
            debug!(worker = %name, "Worker name taken, regenerating");
        }
        Err(WorkerError::NameExhausted(MAX_NAME_ATTEMPTS))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn birth_time(&self) -> DateTime<Utc> {
        self.birth_time
    }

    pub fn active_ticket(&self) -> Option<TicketId> {
        self.active.lock().unwrap().clone()
    }

    pub fn is_busy(&self) -> bool {
        self.active.lock().unwrap().is_some()
    }

    /// Record the ticket this worker is executing. Registry failures are
    /// logged and never fail the job.
    pub async fn claim(&self, ticket: &TicketId) {
        *self.active.lock().unwrap() = Some(ticket.clone());
        if let Err(e) = self
            .registry
            .set_active_ticket(&self.name, self.birth_time, Some(ticket.as_str()))
            .await
        {
            warn!(worker = %self.name, ticket = %ticket, error = %e, "Failed to record active ticket");
        }
    }

    pub async fn release_claim(&self) {
        let previous = self.active.lock().unwrap().take();
        if previous.is_none() {
            return;
        }
        if let Err(e) = self.registry.set_active_ticket(&self.name, self.birth_time, None).await {
            warn!(worker = %self.name, error = %e, "Failed to clear active ticket");
        }
    }

    pub async fn check_in(&self) -> Result<(), WorkerError> {
        let active = self.active_ticket();
        self.registry
            .check_in(&self.name, self.birth_time, active.as_ref().map(TicketId::as_str))
            .await
    }

    /// Remove the registry row. Safe to call more than once.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.registry.deregister(&self.name).await {
            Ok(()) => info!(worker = %self.name, "Worker deregistered"),
            Err(e) => warn!(worker = %self.name, error = %e, "Failed to deregister worker"),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.released.load(Ordering::SeqCst) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(worker = %self.name, "Registration dropped outside a runtime, row left behind");
            return;
        };
        let registry = self.registry.clone();
        let name = self.name.clone();
        handle.spawn(async move {
            if let Err(e) = registry.deregister(&name).await {
                warn!(worker = %name, error = %e, "Failed to deregister dropped worker");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn register_rejects_taken_name() {
        let registry = MemoryWorkerRegistry::new();
        let now = Utc::now();
        assert!(registry.register("calm_otter", now).await.unwrap());
        assert!(!registry.register("calm_otter", now).await.unwrap());
    }

    #[tokio::test]
    async fn check_in_recreates_removed_row() {
        let registry = MemoryWorkerRegistry::new();
        let born = Utc::now();
        registry.register("calm_otter", born).await.unwrap();
        registry.deregister("calm_otter").await.unwrap();

        registry.check_in("calm_otter", born, Some("abc")).await.unwrap();
        let row = registry.get("calm_otter").unwrap();
        assert_eq!(row.birth_time, born);
        assert_eq!(row.active_ticket.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn registration_tracks_claims() {
        let registry = Arc::new(MemoryWorkerRegistry::new());
        let registration = Registration::acquire(registry.clone()).await.unwrap();
        let ticket = TicketId::generate();

        registration.claim(&ticket).await;
        assert!(registration.is_busy());
        let row = registry.get(registration.name()).unwrap();
        assert_eq!(row.active_ticket.as_deref(), Some(ticket.as_str()));

        registration.release_claim().await;
        assert!(!registration.is_busy());
        assert!(registry.get(registration.name()).unwrap().active_ticket.is_none());

        registration.release().await;
        registration.release().await;
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropped_registration_is_cleaned_up() {
        let registry = Arc::new(MemoryWorkerRegistry::new());
        let registration = Registration::acquire(registry.clone()).await.unwrap();
        assert_eq!(registry.list().await.unwrap().len(), 1);

        drop(registration);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.list().await.unwrap().is_empty());
    }
}
