//! Cascade saga records in Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hermes_id::SagaId;
use sqlx::{postgres::PgPool, postgres::PgRow, Row};

use super::DbError;
use crate::repository::{RepoError, RepoResult, SagaStore};
use crate::scheduling::saga::{CascadeSaga, SagaState};

/// A row from the cascade_sagas table.
#[derive(Debug, Clone)]
struct SagaRow {
    saga_id: String,
    user_id: String,
    kind: serde_json::Value,
    state: String,
    touched: serde_json::Value,
    attempts: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for SagaRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            saga_id: row.try_get("saga_id")?,
            user_id: row.try_get("user_id")?,
            kind: row.try_get("kind")?,
            state: row.try_get("state")?,
            touched: row.try_get("touched")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<SagaRow> for CascadeSaga {
    type Error = RepoError;

    fn try_from(row: SagaRow) -> Result<Self, Self::Error> {
        let invalid = |e: hermes_id::IdError| RepoError::InvalidData(e.to_string());
        let json = |e: serde_json::Error| RepoError::Db(DbError::Serialization(e));

        Ok(CascadeSaga {
            id: row.saga_id.parse().map_err(invalid)?,
            user: row.user_id.parse().map_err(invalid)?,
            kind: serde_json::from_value(row.kind).map_err(json)?,
            state: SagaState::from_db(&row.state).ok_or_else(|| {
                RepoError::InvalidData(format!("unknown saga state {}", row.state))
            })?,
            touched: serde_json::from_value(row.touched).map_err(json)?,
            attempts: row.attempts.max(0) as u32,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SAGA_COLUMNS: &str =
    "saga_id, user_id, kind, state, touched, attempts, last_error, created_at, updated_at";

/// [`SagaStore`] over Postgres.
#[derive(Clone)]
pub struct PgSagaStore {
    pool: PgPool,
}

impl PgSagaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SagaStore for PgSagaStore {
    async fn save_saga(&self, saga: &CascadeSaga) -> RepoResult<()> {
        let kind = serde_json::to_value(&saga.kind).map_err(DbError::Serialization)?;
        let touched = serde_json::to_value(&saga.touched).map_err(DbError::Serialization)?;

        sqlx::query(
            r#"
            INSERT INTO cascade_sagas (
                saga_id, user_id, kind, state, touched, attempts, last_error, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (saga_id) DO UPDATE SET
                state = EXCLUDED.state,
                touched = EXCLUDED.touched,
                attempts = EXCLUDED.attempts,
                last_error = EXCLUDED.last_error,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(saga.id.to_string())
        .bind(saga.user.to_string())
        .bind(kind)
        .bind(saga.state.as_str())
        .bind(touched)
        .bind(saga.attempts as i32)
        .bind(&saga.last_error)
        .bind(saga.created_at)
        .bind(saga.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(())
    }

    async fn get_saga(&self, id: SagaId) -> RepoResult<CascadeSaga> {
        let row = sqlx::query_as::<_, SagaRow>(&format!(
            "SELECT {SAGA_COLUMNS} FROM cascade_sagas WHERE saga_id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;

        row.ok_or_else(|| RepoError::not_found("saga", id))?
            .try_into()
    }

    async fn list_open_sagas(&self, updated_before: DateTime<Utc>) -> RepoResult<Vec<CascadeSaga>> {
        let rows = sqlx::query_as::<_, SagaRow>(&format!(
            "SELECT {SAGA_COLUMNS} FROM cascade_sagas \
             WHERE state NOT IN ('completed', 'compensated', 'aborted') \
               AND updated_at < $1 \
             ORDER BY created_at"
        ))
        .bind(updated_before)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        rows.into_iter().map(CascadeSaga::try_from).collect()
    }
}
