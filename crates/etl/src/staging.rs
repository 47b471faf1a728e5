//! Staging: a parsed, hashed and de-duplicated snapshot of a source.

use std::collections::{BTreeSet, HashSet};
use std::io::Read;

use chrono::NaiveDateTime;
use tracing::{debug, warn};

use plenum_core::slugify;

use crate::columns::{infer_columns, normalize, ColumnDef, DERIVED_COLUMNS};
use crate::derive::{Derivation, Point};
use crate::error::EtlError;
use crate::hashing::row_hash;
use crate::roles::ColumnRoles;
use crate::store::STAGING_PREFIX;

/// Postgres identifiers are at most 63 bytes.
const MAX_IDENT_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq)]
pub struct StagedRow {
    pub hash: String,
    /// Canonical values, one per staging column.
    pub values: Vec<Option<String>>,
    pub point_date: Option<NaiveDateTime>,
    pub geom: Option<Point>,
}

#[derive(Debug, Clone)]
pub struct StagingTable {
    pub dataset: String,
    /// Physical table name, `s_<dataset>`.
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Unique rows, first occurrence of each hash.
    pub rows: Vec<StagedRow>,
    /// Data rows read from the source, duplicates included.
    pub rows_read: usize,
}

impl StagingTable {
    pub fn table_name(dataset: &str) -> String {
        format!("{STAGING_PREFIX}{dataset}")
    }

    /// Parse `reader` as CSV with a header row.
    ///
    /// With `existing` columns (a resync), the source must still provide every
    /// one of them and their types are reused; otherwise types are inferred.
    /// Every role column must be present. Nothing outside this value is touched.
    pub fn build<R: Read>(
        dataset: &str,
        existing: Option<&[ColumnDef]>,
        roles: &ColumnRoles,
        reader: R,
    ) -> Result<Self, EtlError> {
        let mut csv = csv::ReaderBuilder::new().flexible(true).from_reader(reader);

        let headers = header_names(csv.headers()?.iter());
        if headers.is_empty() {
            return Err(EtlError::EmptySource(dataset.to_string()));
        }

        let mut raw_rows = Vec::new();
        let mut lines = Vec::new();
        for record in csv.records() {
            let record = record?;
            let values: Vec<Option<String>> = (0..headers.len())
                .map(|i| record.get(i).and_then(normalize))
                .collect();
            if values.iter().all(Option::is_none) {
                continue;
            }
            lines.push(record.position().map_or(0, |p| p.line()));
            raw_rows.push(values);
        }
        let rows_read = raw_rows.len();

        let (columns, projection) = match existing {
            Some(existing) => project_existing(dataset, &headers, existing)?,
            None => (infer_columns(&headers, &raw_rows), (0..headers.len()).collect()),
        };

        for (_, column) in roles.assigned() {
            if !columns.iter().any(|c| c.name == column) {
                return Err(EtlError::MissingColumn {
                    dataset: dataset.to_string(),
                    column: column.to_string(),
                });
            }
        }

        let derivation = Derivation::new(&columns, roles);
        let mut seen = HashSet::with_capacity(raw_rows.len());
        let mut rows = Vec::with_capacity(raw_rows.len());

        for (raw, line) in raw_rows.into_iter().zip(lines) {
            let mut values = Vec::with_capacity(columns.len());
            for (column, &idx) in columns.iter().zip(&projection) {
                let value = match &raw[idx] {
                    Some(v) => Some(column.ty.canonicalize(v).ok_or_else(|| EtlError::BadValue {
                        line,
                        column: column.name.clone(),
                        value: v.clone(),
                        expected: column.ty.pg_type(),
                    })?),
                    None => None,
                };
                values.push(value);
            }

            let hash = row_hash(&values);
            if !seen.insert(hash.clone()) {
                continue;
            }
            rows.push(StagedRow {
                point_date: derivation.point_date(&values),
                geom: derivation.geom(&values),
                hash,
                values,
            });
        }

        debug!(
            dataset,
            rows_read,
            rows_staged = rows.len(),
            columns = columns.len(),
            "Staging table built"
        );

        Ok(Self {
            dataset: dataset.to_string(),
            name: Self::table_name(dataset),
            columns,
            rows,
            rows_read,
        })
    }

    pub fn hashes(&self) -> BTreeSet<String> {
        self.rows.iter().map(|r| r.hash.clone()).collect()
    }
}

/// Column names a source would stage to, without reading its rows.
pub fn read_headers<R: Read>(reader: R) -> Result<Vec<String>, EtlError> {
    let mut csv = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    Ok(header_names(csv.headers()?.iter()))
}

/// Slugified, non-empty, unique header names that never shadow a derived column.
fn header_names<'a>(raw: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for (i, header) in raw.enumerate() {
        let mut name = slugify(header, MAX_IDENT_LEN - 4);
        if name.is_empty() {
            name = format!("column_{}", i + 1);
        }
        if name.starts_with(|c: char| c.is_ascii_digit()) {
            name = format!("c_{name}");
        }
        if DERIVED_COLUMNS.contains(&name.as_str()) {
            name = format!("{name}_src");
        }
        let base = name.clone();
        let mut n = 2;
        while names.contains(&name) {
            name = format!("{base}_{n}");
            n += 1;
        }
        names.push(name);
    }
    names
}

fn project_existing(
    dataset: &str,
    headers: &[String],
    existing: &[ColumnDef],
) -> Result<(Vec<ColumnDef>, Vec<usize>), EtlError> {
    let mut projection = Vec::with_capacity(existing.len());
    for column in existing {
        let idx = headers
            .iter()
            .position(|h| *h == column.name)
            .ok_or_else(|| EtlError::MissingColumn {
                dataset: dataset.to_string(),
                column: column.name.clone(),
            })?;
        projection.push(idx);
    }
    let extra: Vec<&String> = headers
        .iter()
        .filter(|h| !existing.iter().any(|c| c.name == **h))
        .collect();
    if !extra.is_empty() {
        warn!(dataset, ?extra, "Ignoring source columns not present in the dataset table");
    }
    Ok((existing.to_vec(), projection))
}
