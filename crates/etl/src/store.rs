//! Dataset table storage.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::columns::ColumnDef;
use crate::error::EtlError;
use crate::meta::IngestExtent;
use crate::staging::StagingTable;

/// Physical tables behind the sync engine.
///
/// A dataset table holds its source columns plus `hash` (primary key),
/// `point_date` and `geom`. Staging tables have the same shape.
#[async_trait]
pub trait DatasetStore: Send + Sync {
    /// Source columns of an existing table, or `None` if it does not exist.
    async fn table_columns(&self, table: &str) -> Result<Option<Vec<ColumnDef>>, EtlError>;

    /// (Re)create the staging table and load every staged row into it.
    async fn create_staging(&self, staging: &StagingTable) -> Result<(), EtlError>;

    async fn drop_table(&self, table: &str) -> Result<(), EtlError>;

    async fn create_dataset_table(&self, table: &str, columns: &[ColumnDef]) -> Result<(), EtlError>;

    /// Delete rows of `table` whose hash is not in `staging`. Returns rows deleted.
    async fn delete_absent(&self, table: &str, staging: &str) -> Result<u64, EtlError>;

    /// Insert staging rows whose hash is not yet in `table`. Returns rows inserted.
    async fn insert_missing(&self, table: &str, staging: &str, columns: &[ColumnDef]) -> Result<u64, EtlError>;

    async fn hashes(&self, table: &str) -> Result<BTreeSet<String>, EtlError>;

    async fn row_count(&self, table: &str) -> Result<u64, EtlError>;

    async fn extent(&self, table: &str) -> Result<IngestExtent, EtlError>;
}

/// Prefix of every staging table. No dataset may use it.
pub const STAGING_PREFIX: &str = "s_";

/// Tables that share the database with dataset tables.
pub const RESERVED_TABLES: &[&str] = &["meta_master", "workers", "spatial_ref_sys", "_sqlx_migrations"];

/// Dataset and staging names end up in SQL as identifiers.
pub fn validate_table_name(name: &str) -> Result<(), EtlError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(EtlError::InvalidName(name.to_string()))
    }
}

/// A name a dataset table may take: a plain identifier that collides with
/// neither a staging table nor a system table.
pub fn validate_dataset_name(name: &str) -> Result<(), EtlError> {
    validate_table_name(name)?;
    if name.starts_with(STAGING_PREFIX) || RESERVED_TABLES.contains(&name) {
        return Err(EtlError::ReservedName(name.to_string()));
    }
    Ok(())
}
