//! In-memory repository.
//!
//! Every call takes the state lock for exactly one read-modify-write and
//! releases it before returning, so no lock is ever held across an await or
//! across a cascade. This is the per-document mutual exclusion fallback for
//! stores without a native conditional write.
//!
//! Test hooks can inject lost compare-and-swap races, per-call latency and
//! latency on one user's schedule lookups.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hermes_id::{CourseId, SagaId, SessionId, UserId};
use tracing::debug;

use super::{ConditionalUpdate, RepoError, RepoResult, SagaStore, SessionRepository};
use crate::model::{Course, MembershipChange, Session};
use crate::scheduling::saga::CascadeSaga;

#[derive(Default)]
struct MemoryState {
    courses: BTreeMap<CourseId, Course>,
    sessions: BTreeMap<SessionId, Session>,
    /// Session ids in insertion order; sections are listed in this order.
    created: Vec<SessionId>,
    sagas: BTreeMap<SagaId, CascadeSaga>,
    user_latency: BTreeMap<UserId, Duration>,
}

/// Repository backed by process memory.
#[derive(Default)]
pub struct InMemoryRepository {
    state: Mutex<MemoryState>,
    stale_injections: AtomicU32,
    latency_ms: AtomicU64,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` conditional updates report `Stale` without
    /// applying, as if another writer had won the race.
    pub fn inject_stale_updates(&self, count: u32) {
        self.stale_injections.store(count, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay schedule lookups for `user` only. `Duration::ZERO` clears it.
    pub fn set_user_latency(&self, user: UserId, latency: Duration) {
        let mut state = self.lock();
        if latency.is_zero() {
            state.user_latency.remove(&user);
        } else {
            state.user_latency.insert(user, latency);
        }
    }

    /// Snapshot of every stored session.
    pub fn all_sessions(&self) -> Vec<Session> {
        self.lock().sessions.values().cloned().collect()
    }

    /// Snapshot of every stored saga.
    pub fn all_sagas(&self) -> Vec<CascadeSaga> {
        self.lock().sagas.values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock cannot leave a half-applied edit:
        // every mutation below is a single assignment after validation.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn take_stale_injection(&self) -> bool {
        self.stale_injections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SessionRepository for InMemoryRepository {
    async fn get_session(&self, id: SessionId) -> RepoResult<Session> {
        self.simulate_latency().await;
        self.lock()
            .sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| RepoError::not_found("session", id))
    }

    async fn get_course_sections(&self, course: CourseId) -> RepoResult<Vec<Session>> {
        self.simulate_latency().await;
        let state = self.lock();
        Ok(state
            .created
            .iter()
            .filter_map(|id| state.sessions.get(id))
            .filter(|s| s.is_section() && s.course == course)
            .cloned()
            .collect())
    }

    async fn conditional_update_session(
        &self,
        id: SessionId,
        expected_enrolled: i32,
        user: UserId,
        change: MembershipChange,
    ) -> RepoResult<ConditionalUpdate> {
        self.simulate_latency().await;
        let mut state = self.lock();
        let session = state
            .sessions
            .get_mut(&id)
            .ok_or_else(|| RepoError::not_found("session", id))?;

        if self.take_stale_injection() {
            debug!(session_id = %id, "injected stale conditional update");
            return Ok(ConditionalUpdate::Stale);
        }

        let next = session.enrolled + change.delta();
        let membership_ok = match change {
            MembershipChange::Add => !session.has_member(user),
            MembershipChange::Remove => session.has_member(user),
        };
        if session.enrolled != expected_enrolled
            || next < 0
            || next > session.capacity
            || !membership_ok
        {
            return Ok(ConditionalUpdate::Stale);
        }

        match change {
            MembershipChange::Add => session.users.insert(user),
            MembershipChange::Remove => session.users.remove(&user),
        };
        session.enrolled = next;
        Ok(ConditionalUpdate::Applied { enrolled: next })
    }

    async fn find_sessions_for_user(&self, user: UserId) -> RepoResult<Vec<Session>> {
        self.simulate_latency().await;
        let delay = self.lock().user_latency.get(&user).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .lock()
            .sessions
            .values()
            .filter(|s| s.has_member(user))
            .cloned()
            .collect())
    }

    async fn insert_course(&self, course: &Course) -> RepoResult<()> {
        self.simulate_latency().await;
        let mut state = self.lock();
        if state.courses.contains_key(&course.id) {
            return Err(RepoError::Duplicate {
                entity: "course",
                id: course.id.to_string(),
            });
        }
        state.courses.insert(course.id, course.clone());
        Ok(())
    }

    async fn get_course(&self, id: CourseId) -> RepoResult<Course> {
        self.simulate_latency().await;
        self.lock()
            .courses
            .get(&id)
            .cloned()
            .ok_or_else(|| RepoError::not_found("course", id))
    }

    async fn insert_session(&self, session: &Session) -> RepoResult<()> {
        self.simulate_latency().await;
        let mut state = self.lock();
        if !state.courses.contains_key(&session.course) {
            return Err(RepoError::not_found("course", session.course));
        }
        if state.sessions.contains_key(&session.id) {
            return Err(RepoError::Duplicate {
                entity: "session",
                id: session.id.to_string(),
            });
        }
        if !session.users.is_empty() || session.enrolled != 0 {
            return Err(RepoError::InvalidData(format!(
                "new session {} must start empty",
                session.id
            )));
        }
        state.sessions.insert(session.id, session.clone());
        state.created.push(session.id);
        Ok(())
    }

    async fn delete_session(&self, id: SessionId) -> RepoResult<Session> {
        self.simulate_latency().await;
        let mut state = self.lock();
        let removed = state
            .sessions
            .remove(&id)
            .ok_or_else(|| RepoError::not_found("session", id))?;
        state.created.retain(|s| *s != id);
        Ok(removed)
    }
}

#[async_trait]
impl SagaStore for InMemoryRepository {
    async fn save_saga(&self, saga: &CascadeSaga) -> RepoResult<()> {
        self.simulate_latency().await;
        self.lock().sagas.insert(saga.id, saga.clone());
        Ok(())
    }

    async fn get_saga(&self, id: SagaId) -> RepoResult<CascadeSaga> {
        self.simulate_latency().await;
        self.lock()
            .sagas
            .get(&id)
            .cloned()
            .ok_or_else(|| RepoError::not_found("saga", id))
    }

    async fn list_open_sagas(&self, updated_before: DateTime<Utc>) -> RepoResult<Vec<CascadeSaga>> {
        self.simulate_latency().await;
        let mut open: Vec<CascadeSaga> = self
            .lock()
            .sagas
            .values()
            .filter(|s| !s.state.is_terminal() && s.updated_at < updated_before)
            .cloned()
            .collect();
        open.sort_by_key(|s| s.created_at);
        Ok(open)
    }
}
