//! Column types, value normalization and type inference.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dates::{format_date, format_timestamp, parse_date, parse_timestamp};

/// Integers beyond this magnitude are stored as BIGINT.
const BIGINT_THRESHOLD: i64 = 1_000_000_000;

const NULL_TOKENS: &[&str] = &["na", "n/a", "none", "null", "."];
const TRUE_TOKENS: &[&str] = &["yes", "y", "true", "t"];
const FALSE_TOKENS: &[&str] = &["no", "n", "false", "f"];

/// Names the sync engine owns on every dataset table.
pub const DERIVED_COLUMNS: &[&str] = &["hash", "point_date", "geom"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Boolean,
    Integer,
    BigInt,
    Float,
    Date,
    Timestamp,
    Text,
}

impl ColumnType {
    pub fn pg_type(self) -> &'static str {
        match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Integer => "INTEGER",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Float => "DOUBLE PRECISION",
            ColumnType::Date => "DATE",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Text => "TEXT",
        }
    }

    /// Map an `information_schema.columns.data_type` back to a column type.
    pub fn from_pg(data_type: &str) -> ColumnType {
        match data_type.to_ascii_lowercase().as_str() {
            "boolean" => ColumnType::Boolean,
            "integer" | "smallint" => ColumnType::Integer,
            "bigint" => ColumnType::BigInt,
            "double precision" | "real" | "numeric" => ColumnType::Float,
            "date" => ColumnType::Date,
            t if t.starts_with("timestamp") => ColumnType::Timestamp,
            _ => ColumnType::Text,
        }
    }

    /// Canonical text for a normalized value, or `None` when it does not fit
    /// this type. Canonical forms are what get hashed and stored.
    pub fn canonicalize(self, value: &str) -> Option<String> {
        match self {
            ColumnType::Boolean => parse_bool(value).map(|b| b.to_string()),
            ColumnType::Integer | ColumnType::BigInt => parse_int(value).map(|i| i.to_string()),
            ColumnType::Float => parse_float(value).map(|f| f.to_string()),
            ColumnType::Date => parse_date(value).map(format_date),
            ColumnType::Timestamp => parse_timestamp(value)
                .or_else(|| parse_date(value).and_then(|d| d.and_hms_opt(0, 0, 0)))
                .map(format_timestamp),
            ColumnType::Text => Some(value.to_string()),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pg_type().to_ascii_lowercase())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self { name: name.into(), ty }
    }
}

/// Trim a raw cell and map the null tokens to `None`.
pub fn normalize(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    if NULL_TOKENS.contains(&lower.as_str()) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    let lower = value.to_ascii_lowercase();
    if TRUE_TOKENS.contains(&lower.as_str()) {
        Some(true)
    } else if FALSE_TOKENS.contains(&lower.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Integers may carry thousands separators. Zero-padded values such as
/// ZIP codes are identifiers, not numbers.
fn parse_int(value: &str) -> Option<i64> {
    let cleaned = value.replace(',', "");
    let digits = cleaned.strip_prefix('-').unwrap_or(&cleaned);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    cleaned.parse().ok()
}

fn parse_float(value: &str) -> Option<f64> {
    let cleaned = value.replace(',', "");
    let unsigned = cleaned.trim_start_matches(['-', '+']);
    if unsigned.len() > 1 && unsigned.starts_with('0') && !unsigned.starts_with("0.") {
        return None;
    }
    if !cleaned.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|f| f.is_finite())
}

/// Narrows the candidate types of one column as values stream past.
#[derive(Debug, Clone)]
struct Candidates {
    boolean: bool,
    integer: bool,
    big: bool,
    float: bool,
    date: bool,
    timestamp: bool,
    seen: bool,
}

impl Default for Candidates {
    fn default() -> Self {
        Self {
            boolean: true,
            integer: true,
            big: false,
            float: true,
            date: true,
            timestamp: true,
            seen: false,
        }
    }
}

impl Candidates {
    fn observe(&mut self, value: &str) {
        self.seen = true;
        if self.boolean && parse_bool(value).is_none() {
            self.boolean = false;
        }
        if self.integer {
            match parse_int(value) {
                Some(i) if i.unsigned_abs() > BIGINT_THRESHOLD.unsigned_abs() => self.big = true,
                Some(_) => {}
                None => self.integer = false,
            }
        }
        if self.float && parse_float(value).is_none() {
            self.float = false;
        }
        let is_date = parse_date(value).is_some();
        if self.date && !is_date {
            self.date = false;
        }
        if self.timestamp && !is_date && parse_timestamp(value).is_none() {
            self.timestamp = false;
        }
    }

    fn resolve(&self) -> ColumnType {
        if !self.seen {
            ColumnType::Text
        } else if self.boolean {
            ColumnType::Boolean
        } else if self.integer {
            if self.big { ColumnType::BigInt } else { ColumnType::Integer }
        } else if self.float {
            ColumnType::Float
        } else if self.date {
            ColumnType::Date
        } else if self.timestamp {
            ColumnType::Timestamp
        } else {
            ColumnType::Text
        }
    }
}

/// Infer one type per column from every normalized value in it.
/// A column with no non-null values is text.
pub fn infer_columns(headers: &[String], rows: &[Vec<Option<String>>]) -> Vec<ColumnDef> {
    let mut candidates = vec![Candidates::default(); headers.len()];
    for row in rows {
        for (candidate, value) in candidates.iter_mut().zip(row) {
            if let Some(v) = value {
                candidate.observe(v);
            }
        }
    }
    headers
        .iter()
        .zip(candidates)
        .map(|(name, c)| ColumnDef::new(name.clone(), c.resolve()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn infer_one(values: &[&str]) -> ColumnType {
        let rows: Vec<Vec<Option<String>>> = values.iter().map(|v| vec![normalize(v)]).collect();
        infer_columns(&["c".to_string()], &rows)[0].ty
    }

    #[test]
    fn null_tokens_normalize_to_none() {
        for token in ["", "  ", "NA", "n/a", "None", "NULL", "."] {
            assert_eq!(normalize(token), None, "{token:?}");
        }
        assert_eq!(normalize("  x "), Some("x".to_string()));
    }

    #[test]
    fn infers_scalar_types() {
        assert_eq!(infer_one(&["yes", "N", "true"]), ColumnType::Boolean);
        assert_eq!(infer_one(&["1", "-20", "1,234"]), ColumnType::Integer);
        assert_eq!(infer_one(&["1", "2000000000"]), ColumnType::BigInt);
        assert_eq!(infer_one(&["1", "2.5"]), ColumnType::Float);
        assert_eq!(infer_one(&["2015-01-01", "01/02/2015"]), ColumnType::Date);
        assert_eq!(infer_one(&["2015-01-01", "2015-01-02 10:00:00"]), ColumnType::Timestamp);
        assert_eq!(infer_one(&["1", "abc"]), ColumnType::Text);
    }

    #[test]
    fn extreme_integers_are_bigint() {
        assert_eq!(infer_one(&["-9223372036854775808"]), ColumnType::BigInt);
        assert_eq!(infer_one(&["9223372036854775807", "-1"]), ColumnType::BigInt);
        assert_eq!(infer_one(&["-1000000000"]), ColumnType::Integer);
    }

    #[test]
    fn zero_padded_numbers_stay_text() {
        assert_eq!(infer_one(&["60601", "02134"]), ColumnType::Text);
        assert_eq!(infer_one(&["0", "0.5"]), ColumnType::Float);
    }

    #[test]
    fn nulls_do_not_affect_inference() {
        assert_eq!(infer_one(&["1", "", "n/a", "3"]), ColumnType::Integer);
        assert_eq!(infer_one(&["", "null"]), ColumnType::Text);
    }

    #[test]
    fn canonical_forms() {
        assert_eq!(ColumnType::Integer.canonicalize("1,234"), Some("1234".to_string()));
        assert_eq!(ColumnType::Boolean.canonicalize("Y"), Some("true".to_string()));
        assert_eq!(ColumnType::Date.canonicalize("01/02/2015"), Some("2015-01-02".to_string()));
        assert_eq!(
            ColumnType::Timestamp.canonicalize("2015-01-02"),
            Some("2015-01-02 00:00:00".to_string())
        );
        assert_eq!(ColumnType::Integer.canonicalize("abc"), None);
    }

    #[test]
    fn pg_type_round_trips_through_information_schema_names() {
        assert_eq!(ColumnType::from_pg("timestamp without time zone"), ColumnType::Timestamp);
        assert_eq!(ColumnType::from_pg("double precision"), ColumnType::Float);
        assert_eq!(ColumnType::from_pg("character varying"), ColumnType::Text);
        assert_eq!(ColumnType::from_pg(&ColumnType::BigInt.pg_type().to_lowercase()), ColumnType::BigInt);
    }
}
