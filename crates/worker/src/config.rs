//! Worker process configuration, read from `CROPWATCH_*` environment variables.

use std::time::Duration;

use anyhow::Context;

use cropwatch_infra::jobs::ManagerConfig;

pub const DATABASE_URL_ENV: &str = "CROPWATCH_DATABASE_URL";
pub const IMAGERY_URL_ENV: &str = "CROPWATCH_IMAGERY_URL";
pub const IMAGERY_TIMEOUT_ENV: &str = "CROPWATCH_IMAGERY_TIMEOUT_SECS";
pub const NOTIFY_WEBHOOK_ENV: &str = "CROPWATCH_NOTIFY_WEBHOOK_URL";
pub const POOL_CAPACITY_ENV: &str = "CROPWATCH_POOL_CAPACITY";
pub const TICK_ENV: &str = "CROPWATCH_TICK_SECS";
pub const HANDLER_TIMEOUT_ENV: &str = "CROPWATCH_HANDLER_TIMEOUT_SECS";
pub const DAILY_QUOTA_ENV: &str = "CROPWATCH_DAILY_QUOTA";

const DEFAULT_IMAGERY_URL: &str = "http://satellite-data-service:8000";
const DEFAULT_IMAGERY_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Postgres connection string; the in-memory store is used when unset.
    pub database_url: Option<String>,
    pub imagery_url: String,
    pub imagery_timeout: Duration,
    /// Owner notifications are logged when unset.
    pub notify_webhook_url: Option<String>,
    pub manager: ManagerConfig,
}

impl WorkerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let non_empty = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mut manager = ManagerConfig::default();
        if let Some(capacity) = parse::<usize>(non_empty(POOL_CAPACITY_ENV), POOL_CAPACITY_ENV)? {
            anyhow::ensure!(capacity > 0, "{POOL_CAPACITY_ENV} must be at least 1");
            manager = manager.with_pool_capacity(capacity);
        }
        if let Some(secs) = parse::<u64>(non_empty(TICK_ENV), TICK_ENV)? {
            manager = manager.with_tick(Duration::from_secs(secs.max(1)));
        }
        if let Some(secs) = parse::<u64>(non_empty(HANDLER_TIMEOUT_ENV), HANDLER_TIMEOUT_ENV)? {
            manager = manager.with_handler_timeout(Duration::from_secs(secs));
        }
        if let Some(limit) = parse::<u32>(non_empty(DAILY_QUOTA_ENV), DAILY_QUOTA_ENV)? {
            anyhow::ensure!(limit > 0, "{DAILY_QUOTA_ENV} must be at least 1");
            manager = manager.with_daily_quota(limit);
        }

        let imagery_timeout = parse::<u64>(non_empty(IMAGERY_TIMEOUT_ENV), IMAGERY_TIMEOUT_ENV)?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_IMAGERY_TIMEOUT);

        Ok(Self {
            database_url: non_empty(DATABASE_URL_ENV),
            imagery_url: non_empty(IMAGERY_URL_ENV).unwrap_or_else(|| DEFAULT_IMAGERY_URL.to_string()),
            imagery_timeout,
            notify_webhook_url: non_empty(NOTIFY_WEBHOOK_ENV),
            manager,
        })
    }
}

fn parse<T>(value: Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .map(|v| v.parse::<T>().with_context(|| format!("{key}={v:?} is not a valid number")))
        .transpose()
}
