//! Dataset add / update / delete.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{info, warn};

use plenum_core::config::EtlConfig;

use crate::columns::ColumnDef;
use crate::error::EtlError;
use crate::meta::{DatasetMeta, MetaStore, NewDataset};
use crate::source::SourceFile;
use crate::staging::{read_headers, StagingTable};
use crate::store::{validate_dataset_name, DatasetStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub dataset: String,
    /// The dataset table did not exist before this run.
    pub created: bool,
    pub rows_read: u64,
    pub rows_staged: u64,
    pub inserted: u64,
    pub deleted: u64,
    pub total_rows: u64,
}

/// Reconciles dataset tables with their sources.
///
/// Add and update share one path: whatever the table holds, a run leaves it
/// with exactly the hash set of the current source snapshot. A failed run is
/// repaired by running again.
#[derive(Clone)]
pub struct SyncEngine {
    datasets: Arc<dyn DatasetStore>,
    meta: Arc<dyn MetaStore>,
    download_timeout: Duration,
}

impl SyncEngine {
    pub fn new(datasets: Arc<dyn DatasetStore>, meta: Arc<dyn MetaStore>, config: &EtlConfig) -> Self {
        Self {
            datasets,
            meta,
            download_timeout: Duration::from_secs(config.download_timeout_secs),
        }
    }

    pub fn meta(&self) -> &Arc<dyn MetaStore> {
        &self.meta
    }

    /// Register a dataset, detecting any column roles the caller left out
    /// from the source's header row.
    pub async fn register(&self, dataset: NewDataset) -> Result<DatasetMeta, EtlError> {
        let source = SourceFile::open(&dataset.source_url, self.download_timeout).await?;
        self.register_from(dataset, &source).await
    }

    async fn register_from(&self, mut dataset: NewDataset, source: &SourceFile) -> Result<DatasetMeta, EtlError> {
        let headers = read_headers(source.reader()?)?;
        if headers.is_empty() {
            return Err(EtlError::EmptySource(dataset.source_url));
        }
        dataset.roles = dataset.roles.slugged().resolve(&headers);
        let meta = self.meta.register(dataset).await?;
        info!(
            dataset = %meta.dataset_name,
            roles = ?meta.roles.assigned(),
            "Dataset registered"
        );
        Ok(meta)
    }

    /// First ingestion of a registered dataset. On a dataset that already has
    /// a table this converges like [`SyncEngine::update`], so redelivered add
    /// jobs are harmless.
    pub async fn add(&self, dataset_name: &str) -> Result<SyncReport, EtlError> {
        let meta = self.require(dataset_name).await?;
        let source = SourceFile::open(&meta.source_url, self.download_timeout).await?;
        self.sync(meta, &source).await
    }

    /// Register (when no dataset has this name or URL yet) and ingest in one
    /// pass over a single download.
    pub async fn add_source(&self, dataset: NewDataset) -> Result<SyncReport, EtlError> {
        let source = SourceFile::open(&dataset.source_url, self.download_timeout).await?;
        let existing = match self.meta.get(&dataset.dataset_name()).await? {
            Some(meta) => Some(meta),
            None => self.meta.find_by_url(&dataset.source_url).await?,
        };
        let meta = match existing {
            Some(meta) => meta,
            None => self.register_from(dataset, &source).await?,
        };
        self.sync(meta, &source).await
    }

    pub async fn update(&self, dataset_name: &str) -> Result<SyncReport, EtlError> {
        let meta = self.require(dataset_name).await?;
        let source = SourceFile::open(&meta.source_url, self.download_timeout).await?;
        self.sync(meta, &source).await
    }

    /// Drop the dataset table and its metadata row. Only registered datasets
    /// are touched.
    pub async fn delete(&self, dataset_name: &str) -> Result<SyncReport, EtlError> {
        validate_dataset_name(dataset_name)?;
        self.require(dataset_name).await?;
        let table_exists = self.datasets.table_columns(dataset_name).await?.is_some();
        let deleted = if table_exists {
            self.datasets.row_count(dataset_name).await?
        } else {
            0
        };

        self.datasets.drop_table(dataset_name).await?;
        self.meta.remove(dataset_name).await?;

        info!(dataset = dataset_name, rows = deleted, "Dataset deleted");
        Ok(SyncReport {
            dataset: dataset_name.to_string(),
            created: false,
            rows_read: 0,
            rows_staged: 0,
            inserted: 0,
            deleted,
            total_rows: 0,
        })
    }

    async fn require(&self, dataset_name: &str) -> Result<DatasetMeta, EtlError> {
        self.meta
            .get(dataset_name)
            .await?
            .ok_or_else(|| EtlError::DatasetNotFound(dataset_name.to_string()))
    }

    async fn sync(&self, meta: DatasetMeta, source: &SourceFile) -> Result<SyncReport, EtlError> {
        let name = meta.dataset_name.clone();
        validate_dataset_name(&name)?;

        let existing = self.datasets.table_columns(&name).await?;
        if meta.last_update.is_none() && existing.is_some() {
            warn!(dataset = %name, "Table exists for a never-ingested dataset, reconciling it");
        }

        let staging = self.stage(&meta, existing.clone(), source).await?;

        let result = self.apply(&meta, &staging, existing.is_none()).await;
        if let Err(e) = self.datasets.drop_table(&staging.name).await {
            warn!(dataset = %name, error = %e, "Failed to drop staging table");
        }
        let report = result?;

        info!(
            dataset = %name,
            created = report.created,
            rows_read = report.rows_read,
            inserted = report.inserted,
            deleted = report.deleted,
            total_rows = report.total_rows,
            "Dataset synchronized"
        );
        Ok(report)
    }

    /// Parse the source off the async runtime. Fails without touching any table.
    async fn stage(
        &self,
        meta: &DatasetMeta,
        existing: Option<Vec<ColumnDef>>,
        source: &SourceFile,
    ) -> Result<StagingTable, EtlError> {
        let path = source.path().to_path_buf();
        let name = meta.dataset_name.clone();
        let roles = meta.roles.clone();

        tokio::task::spawn_blocking(move || -> Result<StagingTable, EtlError> {
            // Detect roles only among columns the table will actually have.
            let known = match &existing {
                Some(columns) => columns.iter().map(|c| c.name.clone()).collect(),
                None => read_headers(BufReader::new(File::open(&path)?))?,
            };
            let roles = roles.resolve(&known);
            StagingTable::build(&name, existing.as_deref(), &roles, BufReader::new(File::open(&path)?))
        })
        .await
        .map_err(|e| EtlError::Task(e.to_string()))?
    }

    async fn apply(&self, meta: &DatasetMeta, staging: &StagingTable, create: bool) -> Result<SyncReport, EtlError> {
        let name = meta.dataset_name.as_str();

        self.datasets.create_staging(staging).await?;
        if create {
            self.datasets.create_dataset_table(name, &staging.columns).await?;
        }

        // From here on the dataset table is being mutated.
        let deleted = if create {
            0
        } else {
            self.datasets.delete_absent(name, &staging.name).await?
        };
        let inserted = self
            .datasets
            .insert_missing(name, &staging.name, &staging.columns)
            .await?;

        let extent = self.datasets.extent(name).await?;
        let column_names: IndexMap<String, String> = staging
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.ty.to_string()))
            .collect();
        self.meta.record_ingest(name, &extent, &column_names).await?;

        Ok(SyncReport {
            dataset: name.to_string(),
            created: create,
            rows_read: staging.rows_read as u64,
            rows_staged: staging.rows.len() as u64,
            inserted,
            deleted,
            total_rows: self.datasets.row_count(name).await?,
        })
    }
}
