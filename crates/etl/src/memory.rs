//! In-memory dataset and metadata stores for tests and `--memory` mode.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;

use crate::columns::ColumnDef;
use crate::error::EtlError;
use crate::meta::{BBox, DatasetMeta, IngestExtent, MetaStore, NewDataset};
use crate::staging::{StagedRow, StagingTable};
use crate::store::{validate_table_name, DatasetStore};

#[derive(Debug, Clone)]
struct Table {
    columns: Vec<ColumnDef>,
    rows: BTreeMap<String, StagedRow>,
}

#[derive(Default)]
pub struct MemoryDatasetStore {
    tables: RwLock<HashMap<String, Table>>,
    fail_next_insert: AtomicBool,
}

impl MemoryDatasetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table_names(&self) -> BTreeSet<String> {
        self.tables.read().unwrap().keys().cloned().collect()
    }

    /// Rows of `table` ordered by hash.
    pub fn rows(&self, table: &str) -> Vec<StagedRow> {
        self.tables
            .read()
            .unwrap()
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Make the next `insert_missing` fail after deleting, as a lost
    /// connection would midway through an update.
    pub fn fail_next_insert(&self) {
        self.fail_next_insert.store(true, Ordering::SeqCst);
    }

    fn missing(table: &str) -> EtlError {
        EtlError::Database(sqlx::Error::Protocol(format!("relation \"{table}\" does not exist")))
    }
}

#[async_trait]
impl DatasetStore for MemoryDatasetStore {
    async fn table_columns(&self, table: &str) -> Result<Option<Vec<ColumnDef>>, EtlError> {
        Ok(self.tables.read().unwrap().get(table).map(|t| t.columns.clone()))
    }

    async fn create_staging(&self, staging: &StagingTable) -> Result<(), EtlError> {
        validate_table_name(&staging.name)?;
        let rows = staging
            .rows
            .iter()
            .map(|r| (r.hash.clone(), r.clone()))
            .collect();
        self.tables.write().unwrap().insert(
            staging.name.clone(),
            Table {
                columns: staging.columns.clone(),
                rows,
            },
        );
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<(), EtlError> {
        self.tables.write().unwrap().remove(table);
        Ok(())
    }

    async fn create_dataset_table(&self, table: &str, columns: &[ColumnDef]) -> Result<(), EtlError> {
        validate_table_name(table)?;
        let mut tables = self.tables.write().unwrap();
        if tables.contains_key(table) {
            return Err(EtlError::Database(sqlx::Error::Protocol(format!(
                "relation \"{table}\" already exists"
            ))));
        }
        tables.insert(
            table.to_string(),
            Table {
                columns: columns.to_vec(),
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_absent(&self, table: &str, staging: &str) -> Result<u64, EtlError> {
        let mut tables = self.tables.write().unwrap();
        let keep: BTreeSet<String> = tables
            .get(staging)
            .ok_or_else(|| Self::missing(staging))?
            .rows
            .keys()
            .cloned()
            .collect();
        let target = tables.get_mut(table).ok_or_else(|| Self::missing(table))?;
        let before = target.rows.len();
        target.rows.retain(|hash, _| keep.contains(hash));
        Ok((before - target.rows.len()) as u64)
    }

    async fn insert_missing(&self, table: &str, staging: &str, _columns: &[ColumnDef]) -> Result<u64, EtlError> {
        if self.fail_next_insert.swap(false, Ordering::SeqCst) {
            return Err(EtlError::Database(sqlx::Error::PoolTimedOut));
        }
        let mut tables = self.tables.write().unwrap();
        let staged: Vec<StagedRow> = tables
            .get(staging)
            .ok_or_else(|| Self::missing(staging))?
            .rows
            .values()
            .cloned()
            .collect();
        let target = tables.get_mut(table).ok_or_else(|| Self::missing(table))?;
        let mut inserted = 0;
        for row in staged {
            if !target.rows.contains_key(&row.hash) {
                target.rows.insert(row.hash.clone(), row);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn hashes(&self, table: &str) -> Result<BTreeSet<String>, EtlError> {
        let tables = self.tables.read().unwrap();
        let t = tables.get(table).ok_or_else(|| Self::missing(table))?;
        Ok(t.rows.keys().cloned().collect())
    }

    async fn row_count(&self, table: &str) -> Result<u64, EtlError> {
        let tables = self.tables.read().unwrap();
        let t = tables.get(table).ok_or_else(|| Self::missing(table))?;
        Ok(t.rows.len() as u64)
    }

    async fn extent(&self, table: &str) -> Result<IngestExtent, EtlError> {
        let tables = self.tables.read().unwrap();
        let t = tables.get(table).ok_or_else(|| Self::missing(table))?;

        let dates = t.rows.values().filter_map(|r| r.point_date);
        let obs_from = dates.clone().min();
        let obs_to = dates.max();

        let bbox = t.rows.values().filter_map(|r| r.geom).fold(None, |acc: Option<BBox>, p| {
            Some(match acc {
                None => BBox {
                    min_lon: p.lon,
                    min_lat: p.lat,
                    max_lon: p.lon,
                    max_lat: p.lat,
                },
                Some(b) => BBox {
                    min_lon: b.min_lon.min(p.lon),
                    min_lat: b.min_lat.min(p.lat),
                    max_lon: b.max_lon.max(p.lon),
                    max_lat: b.max_lat.max(p.lat),
                },
            })
        });

        Ok(IngestExtent { obs_from, obs_to, bbox })
    }
}

#[derive(Default)]
pub struct MemoryMetaStore {
    datasets: RwLock<BTreeMap<String, DatasetMeta>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn register(&self, dataset: NewDataset) -> Result<DatasetMeta, EtlError> {
        let meta = DatasetMeta::from_new(dataset, Utc::now())?;
        let mut datasets = self.datasets.write().unwrap();
        if datasets.contains_key(&meta.dataset_name) {
            return Err(EtlError::DatasetExists(meta.dataset_name));
        }
        datasets.insert(meta.dataset_name.clone(), meta.clone());
        Ok(meta)
    }

    async fn get(&self, dataset_name: &str) -> Result<Option<DatasetMeta>, EtlError> {
        Ok(self.datasets.read().unwrap().get(dataset_name).cloned())
    }

    async fn find_by_url(&self, source_url: &str) -> Result<Option<DatasetMeta>, EtlError> {
        let hash = crate::meta::url_hash(source_url);
        Ok(self
            .datasets
            .read()
            .unwrap()
            .values()
            .find(|m| m.source_url_hash == hash)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<DatasetMeta>, EtlError> {
        Ok(self.datasets.read().unwrap().values().cloned().collect())
    }

    async fn list_due(&self, update_freq: &str) -> Result<Vec<DatasetMeta>, EtlError> {
        Ok(self
            .datasets
            .read()
            .unwrap()
            .values()
            .filter(|m| m.is_ingested() && m.update_freq.as_deref() == Some(update_freq))
            .cloned()
            .collect())
    }

    async fn record_ingest(
        &self,
        dataset_name: &str,
        extent: &IngestExtent,
        column_names: &IndexMap<String, String>,
    ) -> Result<(), EtlError> {
        let mut datasets = self.datasets.write().unwrap();
        let meta = datasets
            .get_mut(dataset_name)
            .ok_or_else(|| EtlError::DatasetNotFound(dataset_name.to_string()))?;
        meta.obs_from = extent.obs_from;
        meta.obs_to = extent.obs_to;
        meta.bbox = extent.bbox;
        meta.column_names = Some(column_names.clone());
        meta.last_update = Some(Utc::now());
        Ok(())
    }

    async fn remove(&self, dataset_name: &str) -> Result<bool, EtlError> {
        Ok(self.datasets.write().unwrap().remove(dataset_name).is_some())
    }
}
