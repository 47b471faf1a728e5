//! Dispatch Table: endpoint name to operation.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use plenum_core::config::{EtlConfig, WorkerConfig};
use plenum_etl::meta::UPDATE_FREQUENCIES;
use plenum_etl::{ColumnRoles, EtlError, NewDataset, SyncEngine, SyncReport};
use plenum_tickets::{JobClient, JobRequest, TicketStore};

use crate::error::WorkerError;
use crate::outcome::Outcome;

/// The seam between the claim loop and the operations it runs.
///
/// Implementations must tolerate being invoked more than once for the same
/// request: delivery is at-least-once.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, request: &JobRequest) -> Result<Outcome, WorkerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Ping,
    Meta,
    Fields,
    AddDataset,
    UpdateDataset,
    DeleteDataset,
    FrequencyUpdate,
}

impl Endpoint {
    pub const ALL: [Endpoint; 7] = [
        Endpoint::Ping,
        Endpoint::Meta,
        Endpoint::Fields,
        Endpoint::AddDataset,
        Endpoint::UpdateDataset,
        Endpoint::DeleteDataset,
        Endpoint::FrequencyUpdate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Endpoint::Ping => "ping",
            Endpoint::Meta => "meta",
            Endpoint::Fields => "fields",
            Endpoint::AddDataset => "add_dataset",
            Endpoint::UpdateDataset => "update_dataset",
            Endpoint::DeleteDataset => "delete_dataset",
            Endpoint::FrequencyUpdate => "frequency_update",
        }
    }
}

impl FromStr for Endpoint {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| WorkerError::UnknownEndpoint(s.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Parameters ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DatasetParams {
    dataset_name: String,
}

#[derive(Debug, Deserialize)]
struct MetaParams {
    dataset_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddParams {
    dataset_name: Option<String>,
    url: Option<String>,
    name: Option<String>,
    observed_date: Option<String>,
    latitude: Option<String>,
    longitude: Option<String>,
    location: Option<String>,
    business_key: Option<String>,
    update_freq: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FrequencyParams {
    frequency: String,
}

fn params<T: DeserializeOwned>(endpoint: Endpoint, query: &BTreeMap<String, String>) -> Result<T, WorkerError> {
    serde_json::to_value(query)
        .and_then(serde_json::from_value)
        .map_err(|e| WorkerError::InvalidParams {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
}

/// Human name for a dataset added by URL alone: the file name without extension.
fn name_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file = path.rsplit('/').find(|s| !s.is_empty()).unwrap_or(path);
    match file.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => file.to_string(),
    }
}

// ── Table ─────────────────────────────────────────────────────

/// The production Dispatch Table.
pub struct DispatchTable {
    engine: SyncEngine,
    locks: Arc<dyn TicketStore>,
    jobs: JobClient,
    lock_ttl_secs: u64,
    defer_timeout_secs: u32,
}

impl DispatchTable {
    pub fn new(
        engine: SyncEngine,
        locks: Arc<dyn TicketStore>,
        jobs: JobClient,
        etl: &EtlConfig,
        worker: &WorkerConfig,
    ) -> Self {
        Self {
            engine,
            locks,
            jobs,
            lock_ttl_secs: etl.lock_ttl_secs,
            defer_timeout_secs: worker.defer_timeout_secs,
        }
    }

    async fn meta(&self, p: MetaParams) -> Result<Outcome, WorkerError> {
        let payload = match p.dataset_name {
            Some(name) => {
                let meta = self
                    .engine
                    .meta()
                    .get(&name)
                    .await?
                    .ok_or(EtlError::DatasetNotFound(name))?;
                serde_json::to_value(meta)?
            }
            None => serde_json::to_value(self.engine.meta().list().await?)?,
        };
        Ok(Outcome::done(payload))
    }

    async fn fields(&self, p: DatasetParams) -> Result<Outcome, WorkerError> {
        let meta = self
            .engine
            .meta()
            .get(&p.dataset_name)
            .await?
            .ok_or_else(|| EtlError::DatasetNotFound(p.dataset_name.clone()))?;
        let columns = meta
            .column_names
            .ok_or_else(|| WorkerError::NotIngested(p.dataset_name.clone()))?;
        let fields: Vec<_> = columns
            .iter()
            .map(|(name, ty)| json!({ "name": name, "type": ty }))
            .collect();
        Ok(Outcome::done(json!({
            "dataset_name": p.dataset_name,
            "fields": fields,
        })))
    }

    async fn add_dataset(&self, p: AddParams) -> Result<Outcome, WorkerError> {
        if let Some(name) = p.dataset_name {
            return self.locked(&name, || self.engine.add(&name)).await;
        }
        let Some(url) = p.url else {
            return Err(WorkerError::InvalidParams {
                endpoint: Endpoint::AddDataset.to_string(),
                reason: "either dataset_name or url is required".into(),
            });
        };
        let dataset = NewDataset {
            human_name: p.name.unwrap_or_else(|| name_from_url(&url)),
            source_url: url,
            roles: ColumnRoles {
                observed_date: p.observed_date,
                latitude: p.latitude,
                longitude: p.longitude,
                location: p.location,
                business_key: p.business_key,
            },
            update_freq: p.update_freq,
        };
        let name = dataset.dataset_name();
        self.locked(&name, || self.engine.add_source(dataset)).await
    }

    async fn frequency_update(&self, p: FrequencyParams) -> Result<Outcome, WorkerError> {
        if !UPDATE_FREQUENCIES.contains(&p.frequency.as_str()) {
            return Err(EtlError::InvalidFrequency(p.frequency).into());
        }
        let due = self.engine.meta().list_due(&p.frequency).await?;
        let mut submitted = Vec::with_capacity(due.len());
        for meta in due {
            let request =
                JobRequest::new(Endpoint::UpdateDataset.as_str()).with("dataset_name", meta.dataset_name.as_str());
            let ticket = self.jobs.submit_request(&request).await?;
            submitted.push(json!({ "dataset_name": meta.dataset_name, "ticket": ticket }));
        }
        info!(frequency = %p.frequency, count = submitted.len(), "Scheduled dataset updates submitted");
        Ok(Outcome::done(json!({
            "frequency": p.frequency,
            "submitted": submitted,
        })))
    }

    /// Run `op` holding the dataset's lock, or defer when another job holds it.
    async fn locked<F, Fut>(&self, dataset: &str, op: F) -> Result<Outcome, WorkerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SyncReport, EtlError>>,
    {
        let flag = format!("etl:{dataset}");
        if !self.locks.try_set_flag(&flag, self.lock_ttl_secs).await? {
            info!(dataset, "Dataset busy with another job, deferring");
            return Ok(Outcome::defer().with_timeout(self.defer_timeout_secs));
        }

        let result = op().await;
        if let Err(e) = self.locks.clear_flag(&flag).await {
            warn!(dataset, error = %e, "Failed to release dataset lock");
        }
        Ok(Outcome::done(serde_json::to_value(result?)?))
    }
}

#[async_trait]
impl Dispatch for DispatchTable {
    async fn dispatch(&self, request: &JobRequest) -> Result<Outcome, WorkerError> {
        let endpoint: Endpoint = request.endpoint.parse()?;
        let query = &request.query;
        match endpoint {
            Endpoint::Ping => Ok(Outcome::done(json!({ "pong": Utc::now() }))),
            Endpoint::Meta => self.meta(params(endpoint, query)?).await,
            Endpoint::Fields => self.fields(params(endpoint, query)?).await,
            Endpoint::AddDataset => self.add_dataset(params(endpoint, query)?).await,
            Endpoint::UpdateDataset => {
                let p: DatasetParams = params(endpoint, query)?;
                self.locked(&p.dataset_name, || self.engine.update(&p.dataset_name))
                    .await
            }
            Endpoint::DeleteDataset => {
                let p: DatasetParams = params(endpoint, query)?;
                self.locked(&p.dataset_name, || self.engine.delete(&p.dataset_name))
                    .await
            }
            Endpoint::FrequencyUpdate => self.frequency_update(params(endpoint, query)?).await,
        }
    }
}
