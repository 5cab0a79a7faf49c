//! Postgres persistence: the pool, its migrations, and the two stores built
//! on it. [`PgSessionRepository`] owns courses and sessions and performs the
//! single-row conditional update behind every seat change. [`PgSagaStore`]
//! keeps cascade sagas.

mod error;
mod sagas;
mod sessions;

pub use error::DbError;
pub use sagas::PgSagaStore;
pub use sessions::PgSessionRepository;

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

/// Pool settings for the enrollment database.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,

    /// Upper bound on pooled connections. Every cascade step holds one
    /// connection only for the duration of a single statement.
    pub max_connections: u32,

    /// Connections kept open while idle.
    pub min_connections: u32,

    /// How long a statement may wait for a free connection.
    pub acquire_timeout: Duration,

    pub idle_timeout: Duration,

    /// Connections are recycled after this long.
    pub max_lifetime: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/hermes".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl DbConfig {
    /// `DATABASE_URL`, `DB_MAX_CONNECTIONS`, `DB_MIN_CONNECTIONS` and
    /// `DB_ACQUIRE_TIMEOUT_SECS` override the defaults; unparsable values
    /// are ignored.
    pub fn from_env() -> Self {
        fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|s| s.parse().ok())
        }

        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| defaults.database_url.clone()),
            max_connections: parsed("DB_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            min_connections: parsed("DB_MIN_CONNECTIONS").unwrap_or(defaults.min_connections),
            acquire_timeout: parsed("DB_ACQUIRE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.acquire_timeout),
            ..defaults
        }
    }
}

/// Handle to the pool; cheap to clone.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Open the pool. Fails if no connection can be made within
    /// `acquire_timeout`.
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        info!("Database pool ready");

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Round-trip a trivial query.
    pub async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    /// Apply pending migrations. The directory is looked up relative to the
    /// working directory first, then next to this crate's manifest.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        info!("Running database migrations");

        let candidates = vec![
            std::path::PathBuf::from("./migrations"),
            std::path::PathBuf::from("services/enrollment/migrations"),
            std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];
        let mut last_error: Option<sqlx::migrate::MigrateError> = None;

        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Loaded migrations");
                    migrator.run(&self.pool).await.map_err(DbError::Migration)?;
                    info!("Database migrations complete");
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e);
                }
            }
        }

        let tried = candidates
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");

        Err(DbError::MigrationDirNotFound {
            tried,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    pub fn session_repository(&self) -> PgSessionRepository {
        PgSessionRepository::new(self.pool.clone())
    }

    pub fn saga_store(&self) -> PgSagaStore {
        PgSagaStore::new(self.pool.clone())
    }
}
