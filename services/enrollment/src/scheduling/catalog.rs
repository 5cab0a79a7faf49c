//! Course and session lifecycle.

use hermes_id::{CourseId, SectionId, SessionId, UserId};
use tracing::{error, info, instrument, warn};

use super::engine::SchedulingEngine;
use super::error::{SchedulingError, SchedulingResult};
use super::saga::{SagaKind, SagaLog, SagaState, TouchOp};
use crate::model::{Course, NewCourse, NewLecture, NewSection, Session};

/// What happened to the members of a deleted session.
#[derive(Debug, Clone)]
pub struct DeletionOutcome {
    /// The session as it was when deleted.
    pub session: Session,

    /// Members moved into another section of the course.
    pub replaced: Vec<UserId>,

    /// Members whose re-placement failed; their sagas stay open for repair.
    pub unplaced: Vec<UserId>,
}

impl SchedulingEngine {
    #[instrument(skip(self, input), fields(code = %input.code))]
    pub async fn create_course(&self, input: NewCourse) -> SchedulingResult<Course> {
        if input.code.trim().is_empty() {
            return Err(SchedulingError::InvalidInput(
                "course code must not be empty".to_string(),
            ));
        }
        let course = input.into_course();
        self.store.insert_course(&course).await?;
        info!(course_id = %course.id, "Course created");
        Ok(course)
    }

    #[instrument(skip(self, input), fields(course_id = %input.course))]
    pub async fn create_lecture(&self, input: NewLecture) -> SchedulingResult<Session> {
        self.validate_new_session(input.capacity, &input).await?;
        let lecture = input.into_session();
        self.store.insert_session(&lecture).await?;
        info!(session_id = %lecture.id, slot = %lecture.slot, "Lecture created");
        Ok(lecture)
    }

    #[instrument(skip(self, input), fields(course_id = %input.course))]
    pub async fn create_section(&self, input: NewSection) -> SchedulingResult<Session> {
        self.validate_new_session(input.capacity, &input).await?;
        let section = input.into_session();
        self.store.insert_session(&section).await?;
        info!(session_id = %section.id, slot = %section.slot, "Section created");
        Ok(section)
    }

    async fn validate_new_session(
        &self,
        capacity: i32,
        input: &impl HasCourse,
    ) -> SchedulingResult<()> {
        if capacity < 0 {
            return Err(SchedulingError::InvalidInput(format!(
                "capacity must not be negative, got {capacity}"
            )));
        }
        self.store.get_course(input.course()).await?;
        Ok(())
    }

    /// Delete a lecture or section.
    ///
    /// Every member of a section gets a deletion saga before the section is
    /// removed. Members who still hold a lecture of its course are then placed
    /// in another section; a failed placement leaves that member's saga in
    /// `NeedsRepair` and moves on to the next member.
    #[instrument(skip(self, session), fields(session_id = %session))]
    pub async fn delete_session(&self, session: SessionId) -> SchedulingResult<DeletionOutcome> {
        let current = self.store.get_session(session).await?;
        if current.is_lecture() {
            let deleted = self.store.delete_session(session).await?;
            info!(members = deleted.enrolled, "Lecture deleted");
            return Ok(DeletionOutcome {
                session: deleted,
                replaced: Vec::new(),
                unplaced: Vec::new(),
            });
        }

        let mut logs = Vec::with_capacity(current.users.len());
        for &user in &current.users {
            match self.open_deletion_saga(user, &current).await {
                Ok(log) => logs.push((user, log)),
                Err(err) => {
                    abandon(logs, &err).await;
                    return Err(err);
                }
            }
        }

        let deleted = match self.store.delete_session(session).await {
            Ok(deleted) => deleted,
            Err(err) => {
                abandon(logs, &err).await;
                return Err(err);
            }
        };
        info!(members = deleted.enrolled, "Section deleted");

        let mut outcome = DeletionOutcome {
            session: deleted.clone(),
            replaced: Vec::new(),
            unplaced: Vec::new(),
        };

        for &user in deleted.users.difference(&current.users) {
            match self.open_deletion_saga(user, &deleted).await {
                Ok(log) => logs.push((user, log)),
                Err(err) => {
                    error!(
                        user_id = %user,
                        error = %err,
                        "No saga for late member of deleted section"
                    );
                    outcome.unplaced.push(user);
                }
            }
        }

        for (user, mut log) in logs {
            if !deleted.has_member(user) {
                log.finish(SagaState::Aborted, None).await;
                continue;
            }
            match self.replace_member(user, &deleted, &mut log).await {
                Ok(Some(section)) => {
                    info!(user_id = %user, section_id = %section, "Member re-placed");
                    log.finish(SagaState::Completed, None).await;
                    outcome.replaced.push(user);
                }
                Ok(None) => log.finish(SagaState::Completed, None).await,
                Err(err) => {
                    warn!(user_id = %user, error = %err, "Member could not be re-placed");
                    log.finish(SagaState::NeedsRepair, Some(err.to_string()))
                        .await;
                    outcome.unplaced.push(user);
                }
            }
        }
        Ok(outcome)
    }

    async fn open_deletion_saga(
        &self,
        user: UserId,
        section: &Session,
    ) -> SchedulingResult<SagaLog> {
        let mut log = SagaLog::begin(
            self.store.clone(),
            user,
            SagaKind::SessionDeletion {
                session: section.id,
                course: section.course,
            },
        )
        .await?;
        let recorded = log
            .record(section.id, section.course, TouchOp::Released)
            .await;
        if let Err(err) = recorded {
            log.finish(SagaState::Aborted, Some(err.to_string())).await;
            return Err(err);
        }
        Ok(log)
    }

    /// Confirm the member's release and, if they still hold a lecture of the
    /// course, place them in another section.
    async fn replace_member(
        &self,
        user: UserId,
        deleted: &Session,
        log: &mut SagaLog,
    ) -> SchedulingResult<Option<SectionId>> {
        // The release is always the first touch.
        log.confirm(0).await?;

        let held = self.store.find_sessions_for_user(user).await?;
        let needs_section = held
            .iter()
            .any(|s| s.is_lecture() && s.course == deleted.course);
        if !needs_section {
            return Ok(None);
        }
        self.ensure_inner(user, deleted.course, None, log, 0)
            .await
            .map(Some)
    }
}

/// Close the sagas of a deletion that never happened.
async fn abandon(logs: Vec<(UserId, SagaLog)>, cause: &SchedulingError) {
    for (_, log) in logs {
        log.finish(SagaState::Aborted, Some(cause.to_string())).await;
    }
}

trait HasCourse {
    fn course(&self) -> CourseId;
}

impl HasCourse for NewLecture {
    fn course(&self) -> CourseId {
        self.course
    }
}

impl HasCourse for NewSection {
    fn course(&self) -> CourseId {
        self.course
    }
}
