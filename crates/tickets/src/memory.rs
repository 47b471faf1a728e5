//! In-memory ticket store with the same key layout and expiry rules as Redis.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::TicketError;
use crate::store::{decode, Keys, TicketStore};
use crate::types::{JobRequest, TicketId, TicketStatus};

struct Slot {
    value: String,
    expires_at: Instant,
}

pub struct MemoryTicketStore {
    records: RwLock<HashMap<String, Slot>>,
    keys: Keys,
    ttl: Duration,
}

impl Default for MemoryTicketStore {
    fn default() -> Self {
        Self::new(3600)
    }
}

impl MemoryTicketStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            keys: Keys::new("plenum"),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    /// Store a raw record under `key`, bypassing serialization.
    pub fn put_raw(&self, key: &str, value: &str) {
        self.records.write().unwrap().insert(
            key.to_string(),
            Slot {
                value: value.to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// Number of live records (all kinds, flags included).
    pub fn record_count(&self) -> usize {
        let now = Instant::now();
        self.records
            .read()
            .unwrap()
            .values()
            .filter(|s| s.expires_at > now)
            .count()
    }

    fn get_raw(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.records
            .read()
            .unwrap()
            .get(key)
            .filter(|s| s.expires_at > now)
            .map(|s| s.value.clone())
    }

    fn write_record(&self, ticket: &TicketId, key: String, value: String) {
        let now = Instant::now();
        let expires_at = now + self.ttl;
        let mut records = self.records.write().unwrap();
        purge_expired(&mut records, now);
        for sibling in [self.keys.status(ticket), self.keys.request(ticket), self.keys.result(ticket)] {
            if let Some(slot) = records.get_mut(&sibling) {
                slot.expires_at = expires_at;
            }
        }
        records.insert(key, Slot { value, expires_at });
    }

    fn read<T: serde::de::DeserializeOwned>(
        &self,
        ticket: &TicketId,
        record: &'static str,
        key: String,
    ) -> Result<T, TicketError> {
        let raw = self
            .get_raw(&key)
            .ok_or_else(|| TicketError::NotFound(ticket.clone()))?;
        decode(ticket, record, &raw)
    }
}

/// Expired records are dropped on write, so the map stays bounded by the
/// records live within one TTL.
fn purge_expired(records: &mut HashMap<String, Slot>, now: Instant) {
    records.retain(|_, slot| slot.expires_at > now);
}

#[async_trait]
impl TicketStore for MemoryTicketStore {
    async fn get_status(&self, ticket: &TicketId) -> Result<TicketStatus, TicketError> {
        self.read(ticket, "status", self.keys.status(ticket))
    }

    async fn set_status(&self, ticket: &TicketId, status: &TicketStatus) -> Result<(), TicketError> {
        let value = serde_json::to_string(status)?;
        self.write_record(ticket, self.keys.status(ticket), value);
        Ok(())
    }

    async fn swap_status(
        &self,
        ticket: &TicketId,
        expected_version: u64,
        next: &TicketStatus,
    ) -> Result<bool, TicketError> {
        let value = serde_json::to_string(next)?;
        let key = self.keys.status(ticket);
        let now = Instant::now();

        // Hold the write lock across compare and set.
        let mut records = self.records.write().unwrap();
        let current = records
            .get(&key)
            .filter(|s| s.expires_at > now)
            .ok_or_else(|| TicketError::NotFound(ticket.clone()))?;
        let stored: TicketStatus = decode(ticket, "status", &current.value)?;
        if stored.version != expected_version {
            return Ok(false);
        }

        let expires_at = now + self.ttl;
        for sibling in [self.keys.request(ticket), self.keys.result(ticket)] {
            if let Some(slot) = records.get_mut(&sibling) {
                slot.expires_at = expires_at;
            }
        }
        records.insert(key, Slot { value, expires_at });
        Ok(true)
    }

    async fn get_request(&self, ticket: &TicketId) -> Result<JobRequest, TicketError> {
        self.read(ticket, "request", self.keys.request(ticket))
    }

    async fn put_request(&self, ticket: &TicketId, request: &JobRequest) -> Result<(), TicketError> {
        let value = serde_json::to_string(request)?;
        self.write_record(ticket, self.keys.request(ticket), value);
        Ok(())
    }

    async fn get_result(&self, ticket: &TicketId) -> Result<serde_json::Value, TicketError> {
        self.read(ticket, "result", self.keys.result(ticket))
    }

    async fn set_result(&self, ticket: &TicketId, result: &serde_json::Value) -> Result<(), TicketError> {
        let value = serde_json::to_string(result)?;
        self.write_record(ticket, self.keys.result(ticket), value);
        Ok(())
    }

    async fn try_set_flag(&self, name: &str, ttl_secs: u64) -> Result<bool, TicketError> {
        let key = self.keys.flag(name);
        let now = Instant::now();
        let mut records = self.records.write().unwrap();
        purge_expired(&mut records, now);
        if records.contains_key(&key) {
            return Ok(false);
        }
        records.insert(
            key,
            Slot {
                value: "1".to_string(),
                expires_at: now + Duration::from_secs(ttl_secs),
            },
        );
        Ok(true)
    }

    async fn clear_flag(&self, name: &str) -> Result<(), TicketError> {
        self.records.write().unwrap().remove(&self.keys.flag(name));
        Ok(())
    }
}
