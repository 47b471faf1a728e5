//! PostgreSQL + PostGIS backends for dataset tables and `meta_master`.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use indexmap::IndexMap;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, error};

use crate::columns::{ColumnDef, ColumnType, DERIVED_COLUMNS};
use crate::error::EtlError;
use crate::meta::{BBox, DatasetMeta, IngestExtent, MetaStore, NewDataset};
use crate::roles::ColumnRoles;
use crate::staging::StagingTable;
use crate::store::{validate_table_name, DatasetStore};

/// Postgres caps a statement at 65535 bind parameters.
const BIND_LIMIT: usize = 65_535;

fn ident(name: &str) -> Result<String, EtlError> {
    validate_table_name(name)?;
    Ok(format!("\"{name}\""))
}

fn column_list(columns: &[ColumnDef], alias: &str) -> String {
    columns
        .iter()
        .map(|c| format!("{alias}\"{}\"", c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn table_ddl(table: &str, columns: &[ColumnDef]) -> String {
    let mut defs = vec!["hash TEXT PRIMARY KEY".to_string()];
    defs.extend(columns.iter().map(|c| format!("\"{}\" {}", c.name, c.ty.pg_type())));
    defs.push("point_date TIMESTAMP".to_string());
    defs.push("geom geometry(Point, 4326)".to_string());
    format!("CREATE TABLE {table} ({})", defs.join(", "))
}

// ── Dataset tables ───────────────────────────────────────────────────

pub struct PgDatasetStore {
    pool: PgPool,
    batch_rows: usize,
}

impl PgDatasetStore {
    pub fn new(pool: PgPool, batch_rows: usize) -> Self {
        Self {
            pool,
            batch_rows: batch_rows.max(1),
        }
    }
}

#[async_trait]
impl DatasetStore for PgDatasetStore {
    async fn table_columns(&self, table: &str) -> Result<Option<Vec<ColumnDef>>, EtlError> {
        validate_table_name(table)?;
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT column_name::text, data_type::text
             FROM information_schema.columns
             WHERE table_schema = current_schema() AND table_name = $1
             ORDER BY ordinal_position",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            rows.into_iter()
                .filter(|(name, _)| !DERIVED_COLUMNS.contains(&name.as_str()))
                .map(|(name, data_type)| ColumnDef::new(name, ColumnType::from_pg(&data_type)))
                .collect(),
        ))
    }

    async fn create_staging(&self, staging: &StagingTable) -> Result<(), EtlError> {
        let table = ident(&staging.name)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&table_ddl(&table, &staging.columns))
            .execute(&mut *tx)
            .await?;

        let per_row = staging.columns.len() + 4;
        let chunk_rows = self.batch_rows.min(BIND_LIMIT / per_row).max(1);
        let insert_head = format!(
            "INSERT INTO {table} (hash, {}, point_date, geom) ",
            column_list(&staging.columns, "")
        );

        for chunk in staging.rows.chunks(chunk_rows) {
            let mut builder = QueryBuilder::<Postgres>::new(&insert_head);
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.hash.clone());
                for (value, column) in row.values.iter().zip(&staging.columns) {
                    b.push_bind(value.clone())
                        .push_unseparated(format!("::{}", column.ty.pg_type()));
                }
                b.push_bind(row.point_date);
                match row.geom {
                    Some(p) => {
                        b.push("ST_SetSRID(ST_MakePoint(")
                            .push_bind_unseparated(p.lon)
                            .push_unseparated(", ")
                            .push_bind_unseparated(p.lat)
                            .push_unseparated("), 4326)");
                    }
                    None => {
                        b.push("NULL");
                    }
                }
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        debug!(table = %staging.name, rows = staging.rows.len(), chunk_rows, "Staging table loaded");
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<(), EtlError> {
        let table = ident(table)?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_dataset_table(&self, table: &str, columns: &[ColumnDef]) -> Result<(), EtlError> {
        let quoted = ident(table)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(&table_ddl(&quoted, columns)).execute(&mut *tx).await?;
        sqlx::query(&format!(
            "CREATE INDEX \"{table}_point_date_idx\" ON {quoted} (point_date)"
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX \"{table}_geom_idx\" ON {quoted} USING GIST (geom)"
        ))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_absent(&self, table: &str, staging: &str) -> Result<u64, EtlError> {
        let (table, staging) = (ident(table)?, ident(staging)?);
        let result = sqlx::query(&format!(
            "DELETE FROM {table} AS d
             WHERE NOT EXISTS (SELECT 1 FROM {staging} AS s WHERE s.hash = d.hash)"
        ))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_missing(&self, table: &str, staging: &str, columns: &[ColumnDef]) -> Result<u64, EtlError> {
        let (table, staging) = (ident(table)?, ident(staging)?);
        let result = sqlx::query(&format!(
            "INSERT INTO {table} (hash, {cols}, point_date, geom)
             SELECT s.hash, {scols}, s.point_date, s.geom
             FROM {staging} AS s
             WHERE NOT EXISTS (SELECT 1 FROM {table} AS d WHERE d.hash = s.hash)
             ON CONFLICT (hash) DO NOTHING",
            cols = column_list(columns, ""),
            scols = column_list(columns, "s."),
        ))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn hashes(&self, table: &str) -> Result<BTreeSet<String>, EtlError> {
        let table = ident(table)?;
        let hashes = sqlx::query_scalar::<_, String>(&format!("SELECT hash FROM {table}"))
            .fetch_all(&self.pool)
            .await?;
        Ok(hashes.into_iter().collect())
    }

    async fn row_count(&self, table: &str) -> Result<u64, EtlError> {
        let table = ident(table)?;
        let count = sqlx::query_scalar::<_, i64>(&format!("SELECT count(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn extent(&self, table: &str) -> Result<IngestExtent, EtlError> {
        let table = ident(table)?;
        type ExtentRow = (
            Option<NaiveDateTime>,
            Option<NaiveDateTime>,
            Option<f64>,
            Option<f64>,
            Option<f64>,
            Option<f64>,
        );
        let (obs_from, obs_to, min_lon, min_lat, max_lon, max_lat) = sqlx::query_as::<_, ExtentRow>(&format!(
            "SELECT obs_from, obs_to, ST_XMin(e), ST_YMin(e), ST_XMax(e), ST_YMax(e)
             FROM (SELECT min(point_date) AS obs_from,
                          max(point_date) AS obs_to,
                          ST_Extent(geom)::box3d AS e
                   FROM {table}) AS agg"
        ))
        .fetch_one(&self.pool)
        .await?;

        let bbox = match (min_lon, min_lat, max_lon, max_lat) {
            (Some(min_lon), Some(min_lat), Some(max_lon), Some(max_lat)) => Some(BBox {
                min_lon,
                min_lat,
                max_lon,
                max_lat,
            }),
            _ => None,
        };
        Ok(IngestExtent { obs_from, obs_to, bbox })
    }
}

// ── meta_master ──────────────────────────────────────────────────────

const META_COLUMNS: &str = "dataset_name, human_name, source_url, source_url_hash,
    observed_date, latitude, longitude, location, business_key, update_freq,
    obs_from, obs_to,
    ST_XMin(bbox) AS min_lon, ST_YMin(bbox) AS min_lat,
    ST_XMax(bbox) AS max_lon, ST_YMax(bbox) AS max_lat,
    column_names, date_added, last_update";

#[derive(Debug, sqlx::FromRow)]
struct MetaRow {
    dataset_name: String,
    human_name: String,
    source_url: String,
    source_url_hash: String,
    observed_date: Option<String>,
    latitude: Option<String>,
    longitude: Option<String>,
    location: Option<String>,
    business_key: Option<String>,
    update_freq: Option<String>,
    obs_from: Option<NaiveDateTime>,
    obs_to: Option<NaiveDateTime>,
    min_lon: Option<f64>,
    min_lat: Option<f64>,
    max_lon: Option<f64>,
    max_lat: Option<f64>,
    column_names: Option<Json<IndexMap<String, String>>>,
    date_added: DateTime<Utc>,
    last_update: Option<DateTime<Utc>>,
}

impl From<MetaRow> for DatasetMeta {
    fn from(row: MetaRow) -> Self {
        let bbox = match (row.min_lon, row.min_lat, row.max_lon, row.max_lat) {
            (Some(min_lon), Some(min_lat), Some(max_lon), Some(max_lat)) => Some(BBox {
                min_lon,
                min_lat,
                max_lon,
                max_lat,
            }),
            _ => None,
        };
        Self {
            dataset_name: row.dataset_name,
            human_name: row.human_name,
            source_url: row.source_url,
            source_url_hash: row.source_url_hash,
            roles: ColumnRoles {
                observed_date: row.observed_date,
                latitude: row.latitude,
                longitude: row.longitude,
                location: row.location,
                business_key: row.business_key,
            },
            update_freq: row.update_freq,
            obs_from: row.obs_from,
            obs_to: row.obs_to,
            bbox,
            column_names: row.column_names.map(|j| j.0),
            date_added: row.date_added,
            last_update: row.last_update,
        }
    }
}

/// `meta_master` store. Stateless apart from the pool.
pub struct PgMetaStore {
    pool: PgPool,
}

impl PgMetaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_one_where(&self, clause: &str, value: &str) -> Result<Option<DatasetMeta>, EtlError> {
        let row = sqlx::query_as::<_, MetaRow>(&format!(
            "SELECT {META_COLUMNS} FROM meta_master WHERE {clause} = $1"
        ))
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(DatasetMeta::from))
    }
}

#[async_trait]
impl MetaStore for PgMetaStore {
    async fn register(&self, dataset: NewDataset) -> Result<DatasetMeta, EtlError> {
        let meta = DatasetMeta::from_new(dataset, Utc::now())?;

        let result = sqlx::query_as::<_, MetaRow>(&format!(
            "INSERT INTO meta_master (dataset_name, human_name, source_url, source_url_hash,
                 observed_date, latitude, longitude, location, business_key, update_freq, date_added)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             RETURNING {META_COLUMNS}"
        ))
        .bind(&meta.dataset_name)
        .bind(&meta.human_name)
        .bind(&meta.source_url)
        .bind(&meta.source_url_hash)
        .bind(&meta.roles.observed_date)
        .bind(&meta.roles.latitude)
        .bind(&meta.roles.longitude)
        .bind(&meta.roles.location)
        .bind(&meta.roles.business_key)
        .bind(&meta.update_freq)
        .bind(meta.date_added)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(row.into()),
            Err(e) => Err(map_unique_violation(e, &meta.dataset_name)),
        }
    }

    async fn get(&self, dataset_name: &str) -> Result<Option<DatasetMeta>, EtlError> {
        self.fetch_one_where("dataset_name", dataset_name).await
    }

    async fn find_by_url(&self, source_url: &str) -> Result<Option<DatasetMeta>, EtlError> {
        self.fetch_one_where("source_url_hash", &crate::meta::url_hash(source_url))
            .await
    }

    async fn list(&self) -> Result<Vec<DatasetMeta>, EtlError> {
        let rows = sqlx::query_as::<_, MetaRow>(&format!(
            "SELECT {META_COLUMNS} FROM meta_master ORDER BY dataset_name"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(DatasetMeta::from).collect())
    }

    async fn list_due(&self, update_freq: &str) -> Result<Vec<DatasetMeta>, EtlError> {
        let rows = sqlx::query_as::<_, MetaRow>(&format!(
            "SELECT {META_COLUMNS} FROM meta_master
             WHERE update_freq = $1 AND last_update IS NOT NULL
             ORDER BY dataset_name"
        ))
        .bind(update_freq)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(DatasetMeta::from).collect())
    }

    async fn record_ingest(
        &self,
        dataset_name: &str,
        extent: &IngestExtent,
        column_names: &IndexMap<String, String>,
    ) -> Result<(), EtlError> {
        let bbox = extent.bbox;
        let result = sqlx::query(
            "UPDATE meta_master SET
                 obs_from = $2,
                 obs_to = $3,
                 bbox = CASE WHEN $4::float8 IS NULL THEN NULL
                             ELSE ST_MakeEnvelope($4, $5, $6, $7, 4326) END,
                 column_names = $8,
                 last_update = now()
             WHERE dataset_name = $1",
        )
        .bind(dataset_name)
        .bind(extent.obs_from)
        .bind(extent.obs_to)
        .bind(bbox.map(|b| b.min_lon))
        .bind(bbox.map(|b| b.min_lat))
        .bind(bbox.map(|b| b.max_lon))
        .bind(bbox.map(|b| b.max_lat))
        .bind(Json(column_names))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EtlError::DatasetNotFound(dataset_name.to_string()));
        }
        Ok(())
    }

    async fn remove(&self, dataset_name: &str) -> Result<bool, EtlError> {
        let result = sqlx::query("DELETE FROM meta_master WHERE dataset_name = $1")
            .bind(dataset_name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn map_unique_violation(e: sqlx::Error, name: &str) -> EtlError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.code().as_deref() == Some("23505") {
            return EtlError::DatasetExists(name.to_string());
        }
    }
    error!("meta_master database error: {}", e);
    EtlError::Database(e)
}
