//! Redis-backed ticket store.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use plenum_core::config::TicketConfig;

use crate::error::TicketError;
use crate::store::{decode, Keys, TicketStore};
use crate::types::{JobRequest, TicketId, TicketStatus};

/// Replace the status record only when its `version` matches.
/// Returns 1 on swap, 0 on version mismatch, -1 when missing, -2 when unreadable.
const SWAP_STATUS_LUA: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return -1
end
local ok, decoded = pcall(cjson.decode, current)
if not ok or type(decoded) ~= 'table' then
  return -2
end
local version = decoded['version'] or 0
if tostring(version) ~= ARGV[1] then
  return 0
end
local ttl = tonumber(ARGV[3])
redis.call('SET', KEYS[1], ARGV[2], 'EX', ttl)
redis.call('EXPIRE', KEYS[2], ttl)
redis.call('EXPIRE', KEYS[3], ttl)
return 1
"#;

pub struct RedisTicketStore {
    conn: MultiplexedConnection,
    keys: Keys,
    ttl_secs: u64,
    swap_script: Script,
}

impl RedisTicketStore {
    pub async fn connect(config: &TicketConfig) -> Result<Self, TicketError> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;

        info!(prefix = %config.key_prefix, ttl_secs = config.ttl_secs, "Redis ticket store connected");

        Ok(Self {
            conn,
            keys: Keys::new(config.key_prefix.clone()),
            ttl_secs: config.ttl_secs.max(1),
            swap_script: Script::new(SWAP_STATUS_LUA),
        })
    }

    async fn get_raw(&self, key: &str) -> Result<Option<String>, TicketError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    /// Write one record and refresh the TTL of its two siblings.
    async fn write_record(&self, ticket: &TicketId, key: String, value: String) -> Result<(), TicketError> {
        let siblings = [self.keys.status(ticket), self.keys.request(ticket), self.keys.result(ticket)];
        let mut pipe = redis::pipe();
        pipe.atomic().set_ex(&key, value, self.ttl_secs).ignore();
        for sibling in siblings.iter().filter(|k| **k != key) {
            pipe.expire(sibling, self.ttl_secs as i64).ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl TicketStore for RedisTicketStore {
    async fn get_status(&self, ticket: &TicketId) -> Result<TicketStatus, TicketError> {
        let raw = self
            .get_raw(&self.keys.status(ticket))
            .await?
            .ok_or_else(|| TicketError::NotFound(ticket.clone()))?;
        decode(ticket, "status", &raw)
    }

    async fn set_status(&self, ticket: &TicketId, status: &TicketStatus) -> Result<(), TicketError> {
        let value = serde_json::to_string(status)?;
        debug!(ticket = %ticket, status = %status.status, version = status.version, "Writing ticket status");
        self.write_record(ticket, self.keys.status(ticket), value).await
    }

    async fn swap_status(
        &self,
        ticket: &TicketId,
        expected_version: u64,
        next: &TicketStatus,
    ) -> Result<bool, TicketError> {
        let value = serde_json::to_string(next)?;
        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .swap_script
            .key(self.keys.status(ticket))
            .key(self.keys.request(ticket))
            .key(self.keys.result(ticket))
            .arg(expected_version.to_string())
            .arg(value)
            .arg(self.ttl_secs)
            .invoke_async(&mut conn)
            .await?;

        match outcome {
            1 => Ok(true),
            0 => Ok(false),
            -1 => Err(TicketError::NotFound(ticket.clone())),
            _ => Err(TicketError::Corrupt {
                ticket: ticket.clone(),
                record: "status",
                reason: "stored status is not a JSON object".into(),
            }),
        }
    }

    async fn get_request(&self, ticket: &TicketId) -> Result<JobRequest, TicketError> {
        let raw = self
            .get_raw(&self.keys.request(ticket))
            .await?
            .ok_or_else(|| TicketError::NotFound(ticket.clone()))?;
        decode(ticket, "request", &raw)
    }

    async fn put_request(&self, ticket: &TicketId, request: &JobRequest) -> Result<(), TicketError> {
        let value = serde_json::to_string(request)?;
        self.write_record(ticket, self.keys.request(ticket), value).await
    }

    async fn get_result(&self, ticket: &TicketId) -> Result<serde_json::Value, TicketError> {
        let raw = self
            .get_raw(&self.keys.result(ticket))
            .await?
            .ok_or_else(|| TicketError::NotFound(ticket.clone()))?;
        decode(ticket, "result", &raw)
    }

    async fn set_result(&self, ticket: &TicketId, result: &serde_json::Value) -> Result<(), TicketError> {
        let value = serde_json::to_string(result)?;
        self.write_record(ticket, self.keys.result(ticket), value).await
    }

    async fn try_set_flag(&self, name: &str, ttl_secs: u64) -> Result<bool, TicketError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.keys.flag(name))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs.max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn clear_flag(&self, name: &str) -> Result<(), TicketError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(self.keys.flag(name)).await?;
        Ok(())
    }
}
