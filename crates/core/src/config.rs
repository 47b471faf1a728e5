use std::env;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub postgres: PostgresConfig,
    pub aws: AwsConfig,
    pub queue: QueueConfig,
    pub tickets: TicketConfig,
    pub worker: WorkerConfig,
    pub etl: EtlConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `PLENUM_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("PLENUM_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            postgres: PostgresConfig::from_env_profiled(p),
            aws: AwsConfig::from_env_profiled(p),
            queue: QueueConfig::from_env_profiled(p),
            tickets: TicketConfig::from_env_profiled(p),
            worker: WorkerConfig::from_env_profiled(p),
            etl: EtlConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Fail fast on settings the worker cannot run without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.queue_url.is_empty() {
            return Err(ConfigError::Missing("JOBS_QUEUE_URL"));
        }
        if self.worker.workers == 0 {
            return Err(ConfigError::Invalid {
                key: "WORKER_COUNT",
                reason: "must be at least 1".into(),
            });
        }
        if u64::from(self.queue.visibility_timeout_secs) >= self.worker.job_timeout_secs {
            return Err(ConfigError::Invalid {
                key: "WORKER_JOB_TIMEOUT_SECS",
                reason: "must exceed JOBS_VISIBILITY_TIMEOUT_SECS".into(),
            });
        }
        Ok(())
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  postgres:  host={}, db={}", self.postgres.host, self.postgres.database);
        tracing::info!("  aws:       region={}", self.aws.region);
        tracing::info!(
            "  queue:     url={}, visibility={}s, wait={}s",
            self.queue.queue_url, self.queue.visibility_timeout_secs, self.queue.wait_time_secs
        );
        tracing::info!(
            "  tickets:   prefix={}, ttl={}s",
            self.tickets.key_prefix, self.tickets.ttl_secs
        );
        tracing::info!(
            "  worker:    count={}, idle={}s, heartbeat={}s, job_timeout={}s",
            self.worker.workers,
            self.worker.idle_wait_secs,
            self.worker.heartbeat_secs,
            self.worker.job_timeout_secs
        );
        tracing::info!("  etl:       batch_rows={}", self.etl.insert_batch_rows);
    }

    /// Return a redacted view safe for diagnostics output (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "postgres": {
                "host": self.postgres.host,
                "port": self.postgres.port,
                "database": self.postgres.database,
                "configured": self.postgres.is_configured(),
            },
            "aws": {
                "region": self.aws.region,
                "static_credentials": self.aws.access_key_id.is_some(),
            },
            "queue": {
                "queue_url": self.queue.queue_url,
                "visibility_timeout_secs": self.queue.visibility_timeout_secs,
            },
            "tickets": {
                "key_prefix": self.tickets.key_prefix,
                "ttl_secs": self.tickets.ttl_secs,
            },
            "worker": {
                "workers": self.worker.workers,
                "job_timeout_secs": self.worker.job_timeout_secs,
            },
        })
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "PG_HOST", "localhost"),
            port: profiled_env_u16(p, "PG_PORT", 5432),
            database: profiled_env_or(p, "PG_DATABASE", "plenum"),
            username: profiled_env_opt(p, "PG_USERNAME"),
            password: profiled_env_opt(p, "PG_PASSWORD"),
            ssl_mode: profiled_env_or(p, "PG_SSL_MODE", "prefer"),
            max_connections: profiled_env_u32(p, "PG_MAX_CONNECTIONS", 10),
        }
    }

    pub fn connection_string(&self) -> String {
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            user, pass, self.host, self.port, self.database, self.ssl_mode
        )
    }

    pub fn is_configured(&self) -> bool {
        self.username.is_some()
    }
}

// ── AWS ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub endpoint_url: Option<String>,
}

impl AwsConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            region: profiled_env_or(p, "AWS_REGION", "us-east-1"),
            access_key_id: profiled_env_opt(p, "AWS_ACCESS_KEY_ID"),
            secret_access_key: profiled_env_opt(p, "AWS_SECRET_ACCESS_KEY"),
            session_token: profiled_env_opt(p, "AWS_SESSION_TOKEN"),
            // Queue-specific so a general AWS_ENDPOINT_URL (e.g. for S3) is never picked up.
            endpoint_url: profiled_env_opt(p, "QUEUE_AWS_ENDPOINT_URL"),
        }
    }
}

// ── Jobs queue ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub queue_url: String,
    /// How long a received message stays invisible to other workers.
    pub visibility_timeout_secs: u32,
    /// 0 = short poll.
    pub wait_time_secs: u32,
}

impl QueueConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            queue_url: profiled_env_or(p, "JOBS_QUEUE_URL", ""),
            visibility_timeout_secs: profiled_env_u32(p, "JOBS_VISIBILITY_TIMEOUT_SECS", 300),
            wait_time_secs: profiled_env_u32(p, "JOBS_WAIT_TIME_SECS", 0).min(20),
        }
    }
}

// ── Ticket store (Redis) ──────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketConfig {
    pub redis_url: String,
    pub key_prefix: String,
    /// Retention for every ticket record; refreshed on each write.
    pub ttl_secs: u64,
}

impl TicketConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            redis_url: profiled_env_or(p, "REDIS_URL", "redis://127.0.0.1:6379/0"),
            key_prefix: profiled_env_or(p, "TICKET_KEY_PREFIX", "plenum"),
            ttl_secs: profiled_env_u64(p, "TICKET_TTL_SECS", 3600),
        }
    }
}

// ── Worker pool ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub workers: u32,
    pub idle_wait_secs: u64,
    pub heartbeat_secs: u64,
    /// A `processing` ticket untouched for longer than this is treated as orphaned.
    pub job_timeout_secs: u64,
    pub defer_timeout_secs: u32,
    pub shutdown_timeout_secs: u64,
}

impl WorkerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            workers: profiled_env_u32(p, "WORKER_COUNT", 4),
            idle_wait_secs: profiled_env_u64(p, "WORKER_IDLE_WAIT_SECS", 10),
            heartbeat_secs: profiled_env_u64(p, "WORKER_HEARTBEAT_SECS", 30),
            job_timeout_secs: profiled_env_u64(p, "WORKER_JOB_TIMEOUT_SECS", 3600),
            defer_timeout_secs: profiled_env_u32(p, "WORKER_DEFER_TIMEOUT_SECS", 60),
            shutdown_timeout_secs: profiled_env_u64(p, "WORKER_SHUTDOWN_TIMEOUT_SECS", 30),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            idle_wait_secs: 10,
            heartbeat_secs: 30,
            job_timeout_secs: 3600,
            defer_timeout_secs: 60,
            shutdown_timeout_secs: 30,
        }
    }
}

// ── ETL ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlConfig {
    pub insert_batch_rows: usize,
    pub download_timeout_secs: u64,
    /// TTL of the per-dataset lock, so a crashed worker cannot wedge a dataset forever.
    pub lock_ttl_secs: u64,
}

impl EtlConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            insert_batch_rows: profiled_env_u64(p, "ETL_INSERT_BATCH_ROWS", 1000) as usize,
            download_timeout_secs: profiled_env_u64(p, "ETL_DOWNLOAD_TIMEOUT_SECS", 600),
            lock_ttl_secs: profiled_env_u64(p, "ETL_LOCK_TTL_SECS", 3600),
        }
    }
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            insert_batch_rows: 1000,
            download_timeout_secs: 600,
            lock_ttl_secs: 3600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own profile prefix so parallel tests don't race on env vars.

    #[test]
    fn profiled_key_wins_over_plain_key() {
        env::set_var("CFGTEST1_WORKER_COUNT", "9");
        env::set_var("WORKER_IDLE_WAIT_SECS", "3");
        let config = Config::for_profile("cfgtest1");
        assert_eq!(config.profile, "CFGTEST1");
        assert_eq!(config.worker.workers, 9);
        assert_eq!(config.worker.idle_wait_secs, 3);
        env::remove_var("CFGTEST1_WORKER_COUNT");
        env::remove_var("WORKER_IDLE_WAIT_SECS");
    }

    #[test]
    fn wait_time_is_capped_at_sqs_maximum() {
        env::set_var("CFGTEST2_JOBS_WAIT_TIME_SECS", "45");
        let config = Config::for_profile("CFGTEST2");
        assert_eq!(config.queue.wait_time_secs, 20);
        env::remove_var("CFGTEST2_JOBS_WAIT_TIME_SECS");
    }

    #[test]
    fn validate_rejects_missing_queue_url() {
        let mut config = Config::for_profile("CFGTEST3");
        config.queue.queue_url = String::new();
        assert!(matches!(config.validate(), Err(ConfigError::Missing("JOBS_QUEUE_URL"))));
    }

    #[test]
    fn validate_requires_job_timeout_above_visibility() {
        let mut config = Config::for_profile("CFGTEST4");
        config.queue.queue_url = "https://sqs.example/q".into();
        config.queue.visibility_timeout_secs = 600;
        config.worker.job_timeout_secs = 300;
        assert!(config.validate().is_err());
        config.worker.job_timeout_secs = 3600;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn connection_string_defaults_user() {
        let pg = PostgresConfig {
            host: "db".into(),
            port: 5433,
            database: "plenum".into(),
            username: None,
            password: None,
            ssl_mode: "disable".into(),
            max_connections: 5,
        };
        assert_eq!(
            pg.connection_string(),
            "postgres://postgres:@db:5433/plenum?sslmode=disable"
        );
        assert!(!pg.is_configured());
    }

    #[test]
    fn redacted_summary_hides_secrets() {
        let mut config = Config::for_profile("CFGTEST5");
        config.aws.secret_access_key = Some("hunter2".into());
        let summary = config.redacted_summary().to_string();
        assert!(!summary.contains("hunter2"));
        assert!(summary.contains("key_prefix"));
    }
}
