//! Which source columns carry the observation date and the location.

use serde::{Deserialize, Serialize};

use plenum_core::slugify;

const DATE_NAMES: &[&str] = &[
    "observed_date",
    "obs_date",
    "date",
    "datetime",
    "date_time",
    "timestamp",
    "date_of_occurrence",
    "occurred_on",
    "created_date",
];
const LATITUDE_NAMES: &[&str] = &["latitude", "lat"];
const LONGITUDE_NAMES: &[&str] = &["longitude", "lon", "lng", "long"];
const LOCATION_NAMES: &[&str] = &["location", "loc", "coordinates", "geocode"];
const KEY_NAMES: &[&str] = &["id", "record_id", "case_number", "unique_key"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRoles {
    pub observed_date: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub location: Option<String>,
    pub business_key: Option<String>,
}

impl ColumnRoles {
    /// Guess roles from slugified header names.
    pub fn detect(headers: &[String]) -> Self {
        let pick = |names: &[&str]| {
            names
                .iter()
                .find(|n| headers.iter().any(|h| h == *n))
                .map(|n| n.to_string())
        };
        let observed_date = pick(DATE_NAMES)
            .or_else(|| headers.iter().find(|h| h.contains("date")).cloned());
        Self {
            observed_date,
            latitude: pick(LATITUDE_NAMES),
            longitude: pick(LONGITUDE_NAMES),
            location: pick(LOCATION_NAMES),
            business_key: pick(KEY_NAMES),
        }
    }

    /// Keep explicit hints and fill the gaps by detection over `headers`.
    /// Geometry roles are detected only when none was given, so an explicit
    /// location column is not overridden by a detected lat/lon pair.
    pub fn resolve(self, headers: &[String]) -> Self {
        let detected = Self::detect(headers);
        let explicit_geo = self.latitude.is_some() || self.longitude.is_some() || self.location.is_some();
        let (latitude, longitude, location) = if explicit_geo {
            (self.latitude, self.longitude, self.location)
        } else {
            (detected.latitude, detected.longitude, detected.location)
        };
        Self {
            observed_date: self.observed_date.or(detected.observed_date),
            latitude,
            longitude,
            location,
            business_key: self.business_key.or(detected.business_key),
        }
    }

    /// Hints are user-typed header names; compare them in slug form.
    pub fn slugged(self) -> Self {
        let slug = |v: Option<String>| v.map(|s| slugify(&s, 63)).filter(|s| !s.is_empty());
        Self {
            observed_date: slug(self.observed_date),
            latitude: slug(self.latitude),
            longitude: slug(self.longitude),
            location: slug(self.location),
            business_key: slug(self.business_key),
        }
    }

    /// `(role, column)` pairs for every role that is set.
    pub fn assigned(&self) -> Vec<(&'static str, &str)> {
        [
            ("observed_date", &self.observed_date),
            ("latitude", &self.latitude),
            ("longitude", &self.longitude),
            ("location", &self.location),
            ("business_key", &self.business_key),
        ]
        .into_iter()
        .filter_map(|(role, col)| col.as_deref().map(|c| (role, c)))
        .collect()
    }
}
