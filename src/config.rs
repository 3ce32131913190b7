use clap::Parser;
use rand::Rng;
use std::time::Duration;

use crate::error::{SyncError, SyncResult};
use crate::sync::{LockConfig, SyncSettings};

/// Live score poller: keeps the shared game cache in step with the upstream feed
#[derive(Parser, Debug, Clone)]
#[command(name = "scoreboard-sync", version, about)]
pub struct Config {
    /// SQLite database holding the game cache and leader lock tables
    #[arg(long, env = "DATABASE_PATH")]
    pub database_path: Option<String>,

    /// Upstream scoreboard URL
    #[arg(long, env = "UPSTREAM_URL")]
    pub upstream_url: Option<String>,

    /// Bearer token sent to the upstream provider
    #[arg(long, env = "UPSTREAM_TOKEN", hide_env_values = true)]
    pub upstream_token: Option<String>,

    /// Seconds between polls
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value = "30")]
    pub poll_interval_secs: u64,

    /// Upstream request timeout in seconds
    #[arg(long, env = "FETCH_TIMEOUT_SECS", default_value = "10")]
    pub fetch_timeout_secs: u64,

    /// Name of the leader lock shared by all poller instances
    #[arg(long, env = "LOCK_KEY", default_value = "score-sync")]
    pub lock_key: String,

    /// Leader lock time-to-live in seconds (renewed at half this)
    #[arg(long, env = "LOCK_TTL_SECS", default_value = "60")]
    pub lock_ttl_secs: u64,

    /// Fixed delay between lock acquisition attempts, in milliseconds
    #[arg(long, env = "LOCK_RETRY_DELAY_MS", default_value = "5000")]
    pub lock_retry_delay_ms: u64,

    /// Acquisition attempts after the lock is lost before giving up
    #[arg(long, env = "LOCK_REACQUIRE_ATTEMPTS", default_value = "3")]
    pub lock_reacquire_attempts: u32,

    /// Lock owner id for this process (generated when unset)
    #[arg(long, env = "INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// First backoff delay after an upstream failure, in milliseconds
    #[arg(long, env = "BACKOFF_BASE_MS", default_value = "2000")]
    pub backoff_base_ms: u64,

    /// Upper bound for the upstream backoff delay, in seconds
    #[arg(long, env = "BACKOFF_MAX_SECS", default_value = "300")]
    pub backoff_max_secs: u64,
}

impl Config {
    pub fn validate(&self) -> SyncResult<()> {
        if self.database_path.as_deref().map_or(true, |p| p.trim().is_empty()) {
            return Err(SyncError::Config("DATABASE_PATH is required".into()));
        }
        let raw_url = self
            .upstream_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| SyncError::Config("UPSTREAM_URL is required".into()))?;
        let url = url::Url::parse(raw_url)
            .map_err(|e| SyncError::Config(format!("UPSTREAM_URL is not a valid URL: {}", e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SyncError::Config(format!(
                "UPSTREAM_URL must be http(s), got '{}'",
                url.scheme()
            )));
        }
        if self.poll_interval_secs == 0 {
            return Err(SyncError::Config("poll_interval_secs must be positive".into()));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(SyncError::Config("fetch_timeout_secs must be positive".into()));
        }
        if self.lock_ttl_secs < 2 {
            return Err(SyncError::Config("lock_ttl_secs must be at least 2".into()));
        }
        if self.backoff_base_ms == 0 {
            return Err(SyncError::Config("backoff_base_ms must be positive".into()));
        }
        if Duration::from_secs(self.backoff_max_secs) < Duration::from_millis(self.backoff_base_ms)
        {
            return Err(SyncError::Config(
                "backoff_max_secs must not be below backoff_base_ms".into(),
            ));
        }
        Ok(())
    }

    /// Owner id recorded in the lock table.
    pub fn owner_id(&self) -> String {
        match self.instance_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => generated_instance_id(),
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_secs(self.backoff_max_secs),
            reacquire_attempts: self.lock_reacquire_attempts.max(1),
        }
    }

    pub fn lock_config(&self, owner: String) -> LockConfig {
        let retry_delay = Duration::from_millis(self.lock_retry_delay_ms);
        LockConfig {
            key: self.lock_key.clone(),
            owner,
            ttl: Duration::from_secs(self.lock_ttl_secs),
            retry_delay,
            retry_jitter: retry_delay / 4,
        }
    }
}

/// `<host>-<pid>-<random>`, unique enough to tell instances apart.
fn generated_instance_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "poller".to_string());
    let suffix: u32 = rand::thread_rng().gen();
    format!("{}-{}-{:08x}", host, std::process::id(), suffix)
}
