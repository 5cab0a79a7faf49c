//! Repository contracts consumed by the scheduling engine.
//!
//! The store guarantees read-after-write on a single document and an atomic
//! conditional update on a single session document. It does not offer
//! cross-document transactions; the engine never relies on them.
//!
//! Two implementations exist:
//! - [`crate::db::PgSessionRepository`] / [`crate::db::PgSagaStore`] (Postgres)
//! - [`InMemoryRepository`] (tests and local development)

mod memory;

pub use memory::InMemoryRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hermes_id::{CourseId, SagaId, SessionId, UserId};
use thiserror::Error;

use crate::db::DbError;
use crate::model::{Course, MembershipChange, Session};
use crate::scheduling::saga::CascadeSaga;

/// Result type for repository operations.
pub type RepoResult<T> = Result<T, RepoError>;

/// Repository errors.
#[derive(Debug, Error)]
pub enum RepoError {
    /// The requested document does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A document with the same id already exists.
    #[error("{entity} already exists: {id}")]
    Duplicate { entity: &'static str, id: String },

    /// Stored data could not be decoded into the domain model.
    #[error("invalid persisted data: {0}")]
    InvalidData(String),

    /// Underlying database failure.
    #[error(transparent)]
    Db(#[from] DbError),
}

impl RepoError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Outcome of a conditional session update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalUpdate {
    /// The update was applied; carries the new enrolled count.
    Applied { enrolled: i32 },

    /// The document no longer matched the expected state; nothing changed.
    Stale,
}

/// Access to courses and sessions.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Load one session.
    async fn get_session(&self, id: SessionId) -> RepoResult<Session>;

    /// All sections of a course, in creation order.
    async fn get_course_sections(&self, course: CourseId) -> RepoResult<Vec<Session>>;

    /// Atomically apply `change` for `user` to one session document.
    ///
    /// Applies only when the stored `enrolled` still equals
    /// `expected_enrolled`, the result stays inside `[0, capacity]`, and the
    /// membership precondition holds (absent for `Add`, present for
    /// `Remove`). Returns [`ConditionalUpdate::Stale`] otherwise and
    /// [`RepoError::NotFound`] if the session is gone.
    async fn conditional_update_session(
        &self,
        id: SessionId,
        expected_enrolled: i32,
        user: UserId,
        change: MembershipChange,
    ) -> RepoResult<ConditionalUpdate>;

    /// Every lecture and section the user belongs to, in id order.
    async fn find_sessions_for_user(&self, user: UserId) -> RepoResult<Vec<Session>>;

    async fn insert_course(&self, course: &Course) -> RepoResult<()>;

    async fn get_course(&self, id: CourseId) -> RepoResult<Course>;

    /// Insert a new session; it must start with no members.
    async fn insert_session(&self, session: &Session) -> RepoResult<()>;

    /// Delete a session, returning the document as it was at deletion.
    async fn delete_session(&self, id: SessionId) -> RepoResult<Session>;
}

/// Durable storage for cascade saga records.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Insert or overwrite a saga record.
    async fn save_saga(&self, saga: &CascadeSaga) -> RepoResult<()>;

    async fn get_saga(&self, id: SagaId) -> RepoResult<CascadeSaga>;

    /// Non-terminal sagas last updated before `updated_before`, oldest first.
    async fn list_open_sagas(&self, updated_before: DateTime<Utc>) -> RepoResult<Vec<CascadeSaga>>;
}
