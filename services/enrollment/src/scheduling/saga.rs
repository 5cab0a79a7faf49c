//! Cascade saga records.
//!
//! Each multi-document cascade (lecture admission plus section placement,
//! a relocation, re-placement after a deletion) is recorded as a
//! [`CascadeSaga`]. A touch is written *before* the session is adjusted and
//! confirmed after, so the record always over-approximates what the cascade
//! did. Compensation and repair read it back.

use chrono::{DateTime, Utc};
use hermes_id::{CourseId, LectureId, SagaId, SectionId, SessionId, UserId};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::error::SchedulingResult;
use super::store::TimedStore;

/// What the cascade was trying to achieve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SagaKind {
    LectureEnrollment { lecture: LectureId, course: CourseId },
    SectionPlacement { course: CourseId },
    SectionReassignment { from: SectionId, course: CourseId },
    SessionDeletion { session: SessionId, course: CourseId },
}

impl SagaKind {
    /// The course whose section obligation the cascade serves.
    pub fn course(&self) -> CourseId {
        match self {
            Self::LectureEnrollment { course, .. }
            | Self::SectionPlacement { course }
            | Self::SectionReassignment { course, .. }
            | Self::SessionDeletion { course, .. } => *course,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::LectureEnrollment { .. } => "lecture_enrollment",
            Self::SectionPlacement { .. } => "section_placement",
            Self::SectionReassignment { .. } => "section_reassignment",
            Self::SessionDeletion { .. } => "session_deletion",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaState {
    Started,
    InProgress,
    Completed,
    Compensated,
    /// Failed before touching anything.
    Aborted,
    /// Compensation failed or a repair gave up; an operator or the repair
    /// worker must finish it.
    NeedsRepair,
}

impl SagaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Compensated => "compensated",
            Self::Aborted => "aborted",
            Self::NeedsRepair => "needs_repair",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "started" => Some(Self::Started),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "compensated" => Some(Self::Compensated),
            "aborted" => Some(Self::Aborted),
            "needs_repair" => Some(Self::NeedsRepair),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Compensated | Self::Aborted)
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TouchOp {
    /// The user was added to the session.
    Admitted,
    /// The user was removed from the session.
    Released,
}

/// One membership edit made (or about to be made) by a cascade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Touch {
    pub session: SessionId,
    pub course: CourseId,
    pub op: TouchOp,
    /// False until the edit is known to have applied.
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeSaga {
    pub id: SagaId,
    pub user: UserId,
    pub kind: SagaKind,
    pub state: SagaState,
    pub touched: Vec<Touch>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CascadeSaga {
    pub fn new(user: UserId, kind: SagaKind) -> Self {
        let now = Utc::now();
        Self {
            id: SagaId::new(),
            user,
            kind,
            state: SagaState::Started,
            touched: Vec::new(),
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Admissions to release when undoing, newest first. Unconfirmed
    /// touches are included only when `include_unconfirmed` is set (after a
    /// crash nothing is known about them).
    pub fn admissions_to_undo(&self, include_unconfirmed: bool) -> Vec<Touch> {
        self.touched
            .iter()
            .rev()
            .filter(|t| t.op == TouchOp::Admitted && (include_unconfirmed || t.confirmed))
            .cloned()
            .collect()
    }

    /// Seats the user held before the cascade and lost during it, at most
    /// one per course. A release of a session this same cascade admitted is
    /// not a seat to give back.
    pub fn releases_to_restore(&self, include_unconfirmed: bool) -> Vec<Touch> {
        let mut admitted: Vec<SessionId> = Vec::new();
        let mut restore: Vec<Touch> = Vec::new();
        for touch in &self.touched {
            match touch.op {
                TouchOp::Admitted if touch.confirmed => admitted.push(touch.session),
                TouchOp::Admitted => {}
                TouchOp::Released => {
                    if (include_unconfirmed || touch.confirmed)
                        && !admitted.contains(&touch.session)
                        && !restore.iter().any(|r| r.course == touch.course)
                    {
                        restore.push(touch.clone());
                    }
                }
            }
        }
        restore
    }

    /// Courses whose section was released at some point in the cascade.
    pub fn released_courses(&self) -> Vec<CourseId> {
        let mut courses: Vec<CourseId> = self
            .touched
            .iter()
            .filter(|t| t.op == TouchOp::Released)
            .map(|t| t.course)
            .collect();
        courses.sort();
        courses.dedup();
        courses
    }
}

/// Write-ahead handle the engine threads through one cascade.
///
/// A lazy log is only persisted once it records its first touch, so
/// cascades that turn out to be no-ops leave nothing behind.
pub(crate) struct SagaLog {
    store: TimedStore,
    saga: CascadeSaga,
    persisted: bool,
}

impl SagaLog {
    /// Start and persist a saga.
    pub(crate) async fn begin(
        store: TimedStore,
        user: UserId,
        kind: SagaKind,
    ) -> SchedulingResult<Self> {
        let mut log = Self::lazy(store, user, kind);
        log.save().await?;
        info!(
            saga_id = %log.saga.id,
            user_id = %user,
            kind = log.saga.kind.name(),
            "Cascade started"
        );
        Ok(log)
    }

    /// Start a saga that is written on its first touch.
    pub(crate) fn lazy(store: TimedStore, user: UserId, kind: SagaKind) -> Self {
        Self {
            store,
            saga: CascadeSaga::new(user, kind),
            persisted: false,
        }
    }

    /// Pick up a stored saga for repair.
    pub(crate) fn resume(store: TimedStore, saga: CascadeSaga) -> Self {
        Self {
            store,
            saga,
            persisted: true,
        }
    }

    pub(crate) fn saga(&self) -> &CascadeSaga {
        &self.saga
    }

    pub(crate) fn id(&self) -> SagaId {
        self.saga.id
    }

    async fn save(&mut self) -> SchedulingResult<()> {
        self.saga.updated_at = Utc::now();
        self.store.save_saga(&self.saga).await?;
        self.persisted = true;
        Ok(())
    }

    /// Append an unconfirmed touch and persist it before the edit happens.
    pub(crate) async fn record(
        &mut self,
        session: SessionId,
        course: CourseId,
        op: TouchOp,
    ) -> SchedulingResult<usize> {
        self.saga.touched.push(Touch {
            session,
            course,
            op,
            confirmed: false,
        });
        self.saga.state = SagaState::InProgress;
        self.save().await?;
        Ok(self.saga.touched.len() - 1)
    }

    /// Mark a recorded touch as applied.
    pub(crate) async fn confirm(&mut self, index: usize) -> SchedulingResult<()> {
        if let Some(touch) = self.saga.touched.get_mut(index) {
            touch.confirmed = true;
        }
        self.save().await
    }

    /// Count a repair attempt.
    pub(crate) async fn begin_attempt(&mut self) -> SchedulingResult<u32> {
        self.saga.attempts += 1;
        self.save().await?;
        Ok(self.saga.attempts)
    }

    /// Persist a failure without changing the state.
    pub(crate) async fn note_error(&mut self, error: &str) {
        self.saga.last_error = Some(error.to_string());
        if let Err(e) = self.save().await {
            warn!(saga_id = %self.saga.id, error = %e, "Failed to record saga error");
        }
    }

    /// Move the saga to a final (or operator-owned) state.
    ///
    /// Failing to persist the outcome is logged, not returned: the saga then
    /// stays open and the repair worker settles it later.
    pub(crate) async fn finish(mut self, state: SagaState, error: Option<String>) {
        if !self.persisted && state != SagaState::NeedsRepair {
            return;
        }
        self.saga.state = state;
        if error.is_some() {
            self.saga.last_error = error;
        }
        match self.save().await {
            Ok(()) => info!(
                saga_id = %self.saga.id,
                user_id = %self.saga.user,
                state = %state,
                "Cascade settled"
            ),
            Err(e) => warn!(
                saga_id = %self.saga.id,
                state = %state,
                error = %e,
                "Failed to persist saga outcome"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(op: TouchOp, confirmed: bool) -> Touch {
        Touch {
            session: SessionId::Section(SectionId::new()),
            course: CourseId::new(),
            op,
            confirmed,
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(SagaState::Completed.is_terminal());
        assert!(SagaState::Compensated.is_terminal());
        assert!(SagaState::Aborted.is_terminal());
        assert!(!SagaState::InProgress.is_terminal());
        assert!(!SagaState::NeedsRepair.is_terminal());
    }

    #[test]
    fn test_state_db_names_roundtrip() {
        for state in [
            SagaState::Started,
            SagaState::InProgress,
            SagaState::Completed,
            SagaState::Compensated,
            SagaState::Aborted,
            SagaState::NeedsRepair,
        ] {
            assert_eq!(SagaState::from_db(state.as_str()), Some(state));
        }
        assert_eq!(SagaState::from_db("paused"), None);
    }

    #[test]
    fn test_admissions_to_undo_reverses_and_filters() {
        let mut saga = CascadeSaga::new(
            UserId::new(),
            SagaKind::SectionPlacement {
                course: CourseId::new(),
            },
        );
        let first = touch(TouchOp::Admitted, true);
        let second = touch(TouchOp::Admitted, false);
        let third = touch(TouchOp::Released, true);
        let fourth = touch(TouchOp::Admitted, true);
        saga.touched = vec![first.clone(), second.clone(), third, fourth.clone()];

        assert_eq!(saga.admissions_to_undo(false), vec![fourth.clone(), first.clone()]);
        assert_eq!(saga.admissions_to_undo(true), vec![fourth, second, first]);
    }

    #[test]
    fn test_releases_to_restore_skips_own_admissions() {
        let mut saga = CascadeSaga::new(
            UserId::new(),
            SagaKind::SectionPlacement {
                course: CourseId::new(),
            },
        );
        let original = touch(TouchOp::Released, true);
        let admitted = Touch {
            course: original.course,
            ..touch(TouchOp::Admitted, true)
        };
        let released_again = Touch {
            op: TouchOp::Released,
            ..admitted.clone()
        };
        let second_original = Touch {
            course: original.course,
            ..touch(TouchOp::Released, true)
        };
        let unconfirmed = touch(TouchOp::Released, false);
        saga.touched = vec![
            original.clone(),
            admitted,
            released_again,
            second_original,
            unconfirmed.clone(),
        ];

        assert_eq!(saga.releases_to_restore(false), vec![original.clone()]);
        assert_eq!(saga.releases_to_restore(true), vec![original, unconfirmed]);
    }

    #[test]
    fn test_kind_json_shape() {
        let course = CourseId::new();
        let kind = SagaKind::SectionPlacement { course };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "section_placement");
        assert_eq!(json["course"], course.to_string());
        assert_eq!(kind.course(), course);
    }
}
