//! Deadline-enforcing view over the repositories.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hermes_id::{CourseId, SagaId, SessionId, UserId};
use tracing::warn;

use super::error::{SchedulingError, SchedulingResult};
use super::saga::CascadeSaga;
use crate::model::{Course, MembershipChange, Session};
use crate::repository::{ConditionalUpdate, RepoResult, SagaStore, SessionRepository};

/// Every repository call the engine makes goes through here and is bounded
/// by `timeout`.
#[derive(Clone)]
pub(crate) struct TimedStore {
    sessions: Arc<dyn SessionRepository>,
    sagas: Arc<dyn SagaStore>,
    timeout: Duration,
}

impl TimedStore {
    pub(crate) fn new(
        sessions: Arc<dyn SessionRepository>,
        sagas: Arc<dyn SagaStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            sagas,
            timeout,
        }
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = RepoResult<T>>,
    ) -> SchedulingResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(SchedulingError::from),
            Err(_) => {
                warn!(
                    operation,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Repository call exceeded its deadline"
                );
                Err(SchedulingError::Timeout { operation })
            }
        }
    }

    pub(crate) async fn get_session(&self, id: SessionId) -> SchedulingResult<Session> {
        self.call("get_session", self.sessions.get_session(id)).await
    }

    pub(crate) async fn get_course_sections(
        &self,
        course: CourseId,
    ) -> SchedulingResult<Vec<Session>> {
        self.call(
            "get_course_sections",
            self.sessions.get_course_sections(course),
        )
        .await
    }

    pub(crate) async fn conditional_update_session(
        &self,
        id: SessionId,
        expected_enrolled: i32,
        user: UserId,
        change: MembershipChange,
    ) -> SchedulingResult<ConditionalUpdate> {
        self.call(
            "conditional_update_session",
            self.sessions
                .conditional_update_session(id, expected_enrolled, user, change),
        )
        .await
    }

    pub(crate) async fn find_sessions_for_user(
        &self,
        user: UserId,
    ) -> SchedulingResult<Vec<Session>> {
        self.call(
            "find_sessions_for_user",
            self.sessions.find_sessions_for_user(user),
        )
        .await
    }

    pub(crate) async fn insert_course(&self, course: &Course) -> SchedulingResult<()> {
        self.call("insert_course", self.sessions.insert_course(course))
            .await
    }

    pub(crate) async fn get_course(&self, id: CourseId) -> SchedulingResult<Course> {
        self.call("get_course", self.sessions.get_course(id)).await
    }

    pub(crate) async fn insert_session(&self, session: &Session) -> SchedulingResult<()> {
        self.call("insert_session", self.sessions.insert_session(session))
            .await
    }

    pub(crate) async fn delete_session(&self, id: SessionId) -> SchedulingResult<Session> {
        self.call("delete_session", self.sessions.delete_session(id))
            .await
    }

    pub(crate) async fn save_saga(&self, saga: &CascadeSaga) -> SchedulingResult<()> {
        self.call("save_saga", self.sagas.save_saga(saga)).await
    }

    pub(crate) async fn get_saga(&self, id: SagaId) -> SchedulingResult<CascadeSaga> {
        self.call("get_saga", self.sagas.get_saga(id)).await
    }

    pub(crate) async fn list_open_sagas(
        &self,
        updated_before: DateTime<Utc>,
    ) -> SchedulingResult<Vec<CascadeSaga>> {
        self.call(
            "list_open_sagas",
            self.sagas.list_open_sagas(updated_before),
        )
        .await
    }
}
