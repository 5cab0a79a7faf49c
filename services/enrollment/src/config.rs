use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::db::DbConfig;
use crate::scheduling::{EngineConfig, RepairConfig};

/// Where sessions and sagas are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    /// Process memory; only allowed in dev mode.
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub dev_mode: bool,
    pub store: StoreBackend,
    pub database: DbConfig,
    pub engine: EngineConfig,
    pub repair: RepairConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let log_level = std::env::var("HERMES_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("HERMES_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let store = match std::env::var("HERMES_STORE")
            .unwrap_or_else(|_| "postgres".to_string())
            .to_lowercase()
            .as_str()
        {
            "postgres" => StoreBackend::Postgres,
            "memory" if dev_mode => StoreBackend::Memory,
            "memory" => bail!("HERMES_STORE=memory requires HERMES_DEV=1"),
            other => bail!("unknown HERMES_STORE backend: {other}"),
        };

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            repo_timeout: Duration::from_millis(env_or(
                "HERMES_REPO_TIMEOUT_MS",
                defaults.repo_timeout.as_millis() as u64,
            )?),
            max_adjust_retries: env_or("HERMES_MAX_ADJUST_RETRIES", defaults.max_adjust_retries)?,
            max_cascade_depth: env_or("HERMES_MAX_CASCADE_DEPTH", defaults.max_cascade_depth)?,
        };

        let defaults = RepairConfig::default();
        let repair = RepairConfig {
            interval: Duration::from_secs(env_or(
                "HERMES_REPAIR_INTERVAL_SECS",
                defaults.interval.as_secs(),
            )?),
            stale_after: Duration::from_secs(env_or(
                "HERMES_REPAIR_STALE_SECS",
                defaults.stale_after.as_secs(),
            )?),
            max_attempts: env_or("HERMES_REPAIR_MAX_ATTEMPTS", defaults.max_attempts)?,
            ..defaults
        };

        Ok(Self {
            log_level,
            dev_mode,
            store,
            database: DbConfig::from_env(),
            engine,
            repair,
        })
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw}")),
        Err(_) => Ok(default),
    }
}
