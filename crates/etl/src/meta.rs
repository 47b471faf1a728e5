//! Master index of managed datasets.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use plenum_core::slugify;

use crate::error::EtlError;
use crate::roles::ColumnRoles;
use crate::store::validate_dataset_name;

pub const MAX_DATASET_NAME_LEN: usize = 50;
pub const UPDATE_FREQUENCIES: &[&str] = &["yearly", "monthly", "weekly", "daily"];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

/// Observed date range and spatial envelope of a dataset table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestExtent {
    pub obs_from: Option<NaiveDateTime>,
    pub obs_to: Option<NaiveDateTime>,
    pub bbox: Option<BBox>,
}

/// A dataset about to be registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDataset {
    pub human_name: String,
    pub source_url: String,
    #[serde(flatten)]
    pub roles: ColumnRoles,
    pub update_freq: Option<String>,
}

impl NewDataset {
    pub fn dataset_name(&self) -> String {
        slugify(&self.human_name, MAX_DATASET_NAME_LEN)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMeta {
    pub dataset_name: String,
    pub human_name: String,
    pub source_url: String,
    pub source_url_hash: String,
    #[serde(flatten)]
    pub roles: ColumnRoles,
    pub update_freq: Option<String>,
    pub obs_from: Option<NaiveDateTime>,
    pub obs_to: Option<NaiveDateTime>,
    pub bbox: Option<BBox>,
    /// Source column name to SQL type, in table order.
    pub column_names: Option<IndexMap<String, String>>,
    pub date_added: DateTime<Utc>,
    pub last_update: Option<DateTime<Utc>>,
}

impl DatasetMeta {
    pub fn from_new(new: NewDataset, now: DateTime<Utc>) -> Result<Self, EtlError> {
        let dataset_name = new.dataset_name();
        if dataset_name.is_empty() || !dataset_name.starts_with(|c: char| c.is_ascii_lowercase()) {
            return Err(EtlError::InvalidName(new.human_name));
        }
        validate_dataset_name(&dataset_name)?;
        if let Some(freq) = &new.update_freq {
            if !UPDATE_FREQUENCIES.contains(&freq.as_str()) {
                return Err(EtlError::InvalidFrequency(freq.clone()));
            }
        }
        Ok(Self {
            dataset_name,
            source_url_hash: url_hash(&new.source_url),
            human_name: new.human_name,
            source_url: new.source_url,
            roles: new.roles.slugged(),
            update_freq: new.update_freq,
            obs_from: None,
            obs_to: None,
            bbox: None,
            column_names: None,
            date_added: now,
            last_update: None,
        })
    }

    pub fn is_ingested(&self) -> bool {
        self.last_update.is_some()
    }
}

pub fn url_hash(url: &str) -> String {
    format!("{:x}", Sha256::digest(url.trim().as_bytes()))
}

/// Persistence for [`DatasetMeta`] rows.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Fails with [`EtlError::DatasetExists`] when the name is taken.
    async fn register(&self, dataset: NewDataset) -> Result<DatasetMeta, EtlError>;

    async fn get(&self, dataset_name: &str) -> Result<Option<DatasetMeta>, EtlError>;

    async fn find_by_url(&self, source_url: &str) -> Result<Option<DatasetMeta>, EtlError>;

    async fn list(&self) -> Result<Vec<DatasetMeta>, EtlError>;

    /// Ingested datasets refreshed at `update_freq`.
    async fn list_due(&self, update_freq: &str) -> Result<Vec<DatasetMeta>, EtlError>;

    async fn record_ingest(
        &self,
        dataset_name: &str,
        extent: &IngestExtent,
        column_names: &IndexMap<String, String>,
    ) -> Result<(), EtlError>;

    /// Returns whether a row was removed.
    async fn remove(&self, dataset_name: &str) -> Result<bool, EtlError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_dataset(name: &str) -> NewDataset {
        NewDataset {
            human_name: name.into(),
            source_url: "https://data.example.org/crimes.csv".into(),
            roles: ColumnRoles {
                observed_date: Some("Date".into()),
                ..Default::default()
            },
            update_freq: Some("daily".into()),
        }
    }

    #[test]
    fn names_are_slugged_and_capped() {
        let meta = DatasetMeta::from_new(new_dataset("Crimes - 2001 to Present"), Utc::now()).unwrap();
        assert_eq!(meta.dataset_name, "crimes_2001_to_present");
        assert_eq!(meta.roles.observed_date.as_deref(), Some("date"));
        assert_eq!(meta.source_url_hash.len(), 64);
        assert!(!meta.is_ingested());

        let long = "x".repeat(80);
        let meta = DatasetMeta::from_new(new_dataset(&long), Utc::now()).unwrap();
        assert_eq!(meta.dataset_name.len(), MAX_DATASET_NAME_LEN);
    }

    #[test]
    fn rejects_unusable_names() {
        assert!(matches!(
            DatasetMeta::from_new(new_dataset("!!!"), Utc::now()),
            Err(EtlError::InvalidName(_))
        ));
        assert!(DatasetMeta::from_new(new_dataset("311 calls"), Utc::now()).is_err());
    }

    #[test]
    fn rejects_names_of_staging_and_system_tables() {
        for name in ["S Crimes", "Meta Master", "workers"] {
            assert!(
                matches!(DatasetMeta::from_new(new_dataset(name), Utc::now()), Err(EtlError::ReservedName(_))),
                "{name:?}"
            );
        }
    }

    #[test]
    fn rejects_unknown_frequency() {
        let mut new = new_dataset("crimes");
        new.update_freq = Some("hourly".into());
        assert!(matches!(
            DatasetMeta::from_new(new, Utc::now()),
            Err(EtlError::InvalidFrequency(_))
        ));
    }
}
