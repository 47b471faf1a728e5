use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TicketError;

/// Opaque ticket handle: 32 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TicketId(String);

impl TicketId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for TicketId {
    type Err = TicketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let valid = s.len() == 32
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(TicketError::MalformedId(s.to_string()))
        }
    }
}

impl TryFrom<String> for TicketId {
    type Error = TicketError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TicketId> for String {
    fn from(id: TicketId) -> Self {
        id.0
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Queued,
    Processing,
    Success,
    Error,
}

impl StatusKind {
    pub fn is_terminal(self) -> bool {
        matches!(self, StatusKind::Success | StatusKind::Error)
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusKind::Queued => "queued",
            StatusKind::Processing => "processing",
            StatusKind::Success => "success",
            StatusKind::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketMeta {
    pub queue_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_deferred_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_resume_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Every worker that has claimed this ticket, in claim order. Append-only.
    #[serde(default)]
    pub workers: Vec<String>,
    /// Number of claims so far.
    #[serde(default)]
    pub tries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resubmitted_as: Option<TicketId>,
}

/// The status record of a ticket.
///
/// `version` increases on every transition and is what compare-and-swap
/// claims are checked against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketStatus {
    pub status: StatusKind,
    #[serde(default)]
    pub version: u64,
    pub meta: TicketMeta,
}

impl TicketStatus {
    pub fn queued(now: DateTime<Utc>) -> Self {
        Self {
            status: StatusKind::Queued,
            version: 0,
            meta: TicketMeta {
                queue_time: now,
                start_time: None,
                last_deferred_time: None,
                last_resume_time: None,
                end_time: None,
                workers: Vec::new(),
                tries: 0,
                resubmitted_as: None,
            },
        }
    }

    /// Most recent moment a worker started working on this ticket.
    pub fn last_active(&self) -> Option<DateTime<Utc>> {
        self.meta.last_resume_time.or(self.meta.start_time)
    }
}

/// The operation a ticket asks a worker to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub endpoint: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
}

impl JobRequest {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            query: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }
}

/// Everything a poller can see about a ticket.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub ticket: TicketId,
    #[serde(flatten)]
    pub status: TicketStatus,
    pub request: JobRequest,
    pub result: serde_json::Value,
}
