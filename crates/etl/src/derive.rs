//! Derived `point_date` and `geom` values.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::columns::ColumnDef;
use crate::dates::parse_any;
use crate::roles::ColumnRoles;

/// WGS 84 point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub lon: f64,
    pub lat: f64,
}

impl Point {
    /// A point from raw coordinates, or `None` when they are out of range or
    /// exactly (0, 0), which is what failed geocoders emit.
    pub fn checked(lat: f64, lon: f64) -> Option<Point> {
        if !lat.is_finite() || !lon.is_finite() {
            return None;
        }
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return None;
        }
        if lat == 0.0 && lon == 0.0 {
            return None;
        }
        Some(Point { lon, lat })
    }
}

/// Parse a combined location such as `(41.88, -87.63)` or `41.88,-87.63`
/// (latitude first).
pub fn parse_location(s: &str) -> Option<(f64, f64)> {
    let inner = s.trim().trim_start_matches('(').trim_end_matches(')');
    let (lat, lon) = inner.split_once(',')?;
    Some((lat.trim().parse().ok()?, lon.trim().parse().ok()?))
}

/// Column positions for the derived values, resolved once per staging build.
#[derive(Debug, Clone, Default)]
pub struct Derivation {
    date: Option<usize>,
    lat: Option<usize>,
    lon: Option<usize>,
    location: Option<usize>,
}

impl Derivation {
    /// Roles must already be validated against `columns`.
    pub fn new(columns: &[ColumnDef], roles: &ColumnRoles) -> Self {
        let find = |name: &Option<String>| {
            name.as_deref()
                .and_then(|n| columns.iter().position(|c| c.name == n))
        };
        Self {
            date: find(&roles.observed_date),
            lat: find(&roles.latitude),
            lon: find(&roles.longitude),
            location: find(&roles.location),
        }
    }

    pub fn point_date(&self, values: &[Option<String>]) -> Option<NaiveDateTime> {
        let raw = values.get(self.date?)?.as_deref()?;
        parse_any(raw)
    }

    /// Lat/lon columns take precedence over a combined location column.
    pub fn geom(&self, values: &[Option<String>]) -> Option<Point> {
        if let (Some(lat), Some(lon)) = (self.lat, self.lon) {
            let lat = values.get(lat)?.as_deref()?.parse::<f64>().ok()?;
            let lon = values.get(lon)?.as_deref()?.parse::<f64>().ok()?;
            return Point::checked(lat, lon);
        }
        let raw = values.get(self.location?)?.as_deref()?;
        let (lat, lon) = parse_location(raw)?;
        Point::checked(lat, lon)
    }
}
