//! Enrollment cascades.
//!
//! Admitting a user to a lecture may force a section relocation, which may
//! force another one in a different course. No lock spans a cascade: every
//! step is one compare-and-swap on one session, and the steps are recorded in
//! a [`SagaLog`] so a failed cascade can be undone and a crashed one
//! repaired.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use hermes_id::{CourseId, LectureId, SagaId, SectionId, SessionId, UserId};
use hermes_reconcile::{RepairStatus, RetryBudget};
use tracing::{debug, error, info, instrument, warn};

use super::capacity::CapacityController;
use super::conflict::SlotConflictIndex;
use super::error::{SchedulingError, SchedulingResult};
use super::placement::PlacementSelector;
use super::saga::{CascadeSaga, SagaKind, SagaLog, SagaState, TouchOp};
use super::store::TimedStore;
use super::EngineConfig;
use crate::model::{MembershipChange, Session};
use crate::repository::{SagaStore, SessionRepository};

/// A user's lecture together with the section that satisfies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LectureEnrollment {
    pub lecture: LectureId,
    pub section: SectionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionPlacement {
    pub section: SectionId,
}

pub struct SchedulingEngine {
    pub(super) store: TimedStore,
    capacity: CapacityController,
    placement: PlacementSelector,
    conflicts: SlotConflictIndex,
    config: EngineConfig,
}

impl SchedulingEngine {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        sagas: Arc<dyn SagaStore>,
        config: EngineConfig,
    ) -> Self {
        let store = TimedStore::new(sessions, sagas, config.repo_timeout);
        Self {
            capacity: CapacityController::new(store.clone(), config.max_adjust_retries),
            placement: PlacementSelector::new(store.clone()),
            conflicts: SlotConflictIndex::new(store.clone()),
            store,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn capacity(&self) -> &CapacityController {
        &self.capacity
    }

    pub fn placement(&self) -> &PlacementSelector {
        &self.placement
    }

    pub fn conflicts(&self) -> &SlotConflictIndex {
        &self.conflicts
    }

    /// Admit `user` to `lecture` and make sure they hold a compatible section
    /// of the lecture's course.
    ///
    /// If anything after the admission fails, the admission is released and
    /// any section the cascade evicted the user from is restored before the
    /// error is returned.
    #[instrument(skip(self, user, lecture), fields(user_id = %user, lecture_id = %lecture))]
    pub async fn enroll_in_lecture(
        &self,
        user: UserId,
        lecture: LectureId,
    ) -> SchedulingResult<LectureEnrollment> {
        let session_id = SessionId::Lecture(lecture);
        let target = self.store.get_session(session_id).await?;
        let course = target.course;

        if target.has_member(user) {
            debug!("Lecture already held, re-ensuring section");
            let placement = self.ensure_section_enrollment(user, course).await?;
            return Ok(LectureEnrollment {
                lecture,
                section: placement.section,
            });
        }

        if let Some(clash) = self
            .conflicts
            .find_lecture_conflict(user, target.slot, &[session_id])
            .await?
        {
            return Err(SchedulingError::TimeConflict {
                session: session_id,
                conflicting: clash.id,
                slot: target.slot,
            });
        }

        let mut log = SagaLog::begin(
            self.store.clone(),
            user,
            SagaKind::LectureEnrollment { lecture, course },
        )
        .await?;

        let touch = log.record(session_id, course, TouchOp::Admitted).await?;
        match self
            .capacity
            .try_adjust(session_id, user, MembershipChange::Add)
            .await
        {
            Ok(_) => log.confirm(touch).await?,
            Err(SchedulingError::CapacityExceeded { .. }) => {
                let err = SchedulingError::LectureFull { lecture };
                log.finish(SagaState::Aborted, Some(err.to_string())).await;
                return Err(err);
            }
            Err(SchedulingError::AlreadyEnrolled { .. }) => {
                // A concurrent request admitted the user first.
                log.finish(SagaState::Aborted, None).await;
                let placement = self.ensure_section_enrollment(user, course).await?;
                return Ok(LectureEnrollment {
                    lecture,
                    section: placement.section,
                });
            }
            Err(err) => {
                log.finish(SagaState::Aborted, Some(err.to_string())).await;
                return Err(err);
            }
        }
        info!(saga_id = %log.id(), "Lecture admitted");

        match self.place_after_lecture(user, &target, &mut log).await {
            Ok(section) => {
                log.finish(SagaState::Completed, None).await;
                Ok(LectureEnrollment { lecture, section })
            }
            Err(err) => Err(self.compensate(log, err, false).await),
        }
    }

    async fn place_after_lecture(
        &self,
        user: UserId,
        lecture: &Session,
        log: &mut SagaLog,
    ) -> SchedulingResult<SectionId> {
        if let Some(clash) = self
            .conflicts
            .find_section_conflict(user, lecture.slot, &[])
            .await?
        {
            if let SessionId::Section(section) = clash.id {
                info!(
                    section_id = %section,
                    course_id = %clash.course,
                    slot = %lecture.slot,
                    "Section collides with new lecture, relocating"
                );
                self.reenroll_inner(user, section, log, 0).await?;
            }
        }
        self.ensure_inner(user, lecture.course, None, log, 0).await
    }

    /// Make sure `user` holds exactly one section of `course` that does not
    /// collide with any lecture they hold. A no-op if that is already true.
    #[instrument(skip(self, user, course), fields(user_id = %user, course_id = %course))]
    pub async fn ensure_section_enrollment(
        &self,
        user: UserId,
        course: CourseId,
    ) -> SchedulingResult<SectionPlacement> {
        let mut log = SagaLog::lazy(
            self.store.clone(),
            user,
            SagaKind::SectionPlacement { course },
        );
        match self.ensure_inner(user, course, None, &mut log, 0).await {
            Ok(section) => {
                log.finish(SagaState::Completed, None).await;
                Ok(SectionPlacement { section })
            }
            Err(err) => Err(self.compensate(log, err, false).await),
        }
    }

    /// Evict `user` from `section` and place them in another section of the
    /// same course.
    #[instrument(skip(self, user, section), fields(user_id = %user, section_id = %section))]
    pub async fn reenroll_in_section(
        &self,
        user: UserId,
        section: SectionId,
    ) -> SchedulingResult<SectionPlacement> {
        let current = self.store.get_session(section.into()).await?;
        let mut log = SagaLog::begin(
            self.store.clone(),
            user,
            SagaKind::SectionReassignment {
                from: section,
                course: current.course,
            },
        )
        .await?;
        match self.reenroll_inner(user, section, &mut log, 0).await {
            Ok(section) => {
                log.finish(SagaState::Completed, None).await;
                Ok(SectionPlacement { section })
            }
            Err(err) => Err(self.compensate(log, err, false).await),
        }
    }

    /// `vacated` is a section of `course` the cascade just evicted the user
    /// from; it is never chosen again, so relocations cannot bounce back.
    pub(super) fn ensure_inner<'a>(
        &'a self,
        user: UserId,
        course: CourseId,
        vacated: Option<SessionId>,
        log: &'a mut SagaLog,
        depth: u32,
    ) -> BoxFuture<'a, SchedulingResult<SectionId>> {
        Box::pin(async move {
            if depth > self.config.max_cascade_depth {
                error!(
                    user_id = %user,
                    course_id = %course,
                    depth,
                    "Cascade depth exceeded"
                );
                return Err(SchedulingError::CascadeDepthExceeded {
                    user,
                    max_depth: self.config.max_cascade_depth,
                });
            }

            let held = self.store.find_sessions_for_user(user).await?;
            let lecture_slots: Vec<_> = held
                .iter()
                .filter(|s| s.is_lecture())
                .map(|s| s.slot)
                .collect();
            let existing = held
                .iter()
                .find(|s| s.is_section() && s.course == course)
                .cloned();
            if let Some(existing) = &existing {
                if !lecture_slots.contains(&existing.slot) {
                    if let SessionId::Section(id) = existing.id {
                        return Ok(id);
                    }
                }
            }

            let mut budget =
                RetryBudget::new("ensure_section_enrollment", self.config.max_adjust_retries);
            let chosen = loop {
                if budget.try_next().is_err() {
                    warn!(
                        course_id = %course,
                        attempts = budget.used(),
                        "Kept losing placement races"
                    );
                    return Err(SchedulingError::SectionFull { course });
                }

                let candidate = match self
                    .placement
                    .select_section(user, course, vacated.as_slice())
                    .await
                {
                    Ok(candidate) => candidate,
                    Err(SchedulingError::NoCapacity { .. }) if budget.is_retrying() => {
                        return Err(SchedulingError::SectionFull { course });
                    }
                    Err(err) => return Err(err),
                };

                let touch = log.record(candidate.id, course, TouchOp::Admitted).await?;
                match self
                    .capacity
                    .try_adjust(candidate.id, user, MembershipChange::Add)
                    .await
                {
                    Ok(_) => {
                        log.confirm(touch).await?;
                        break candidate;
                    }
                    Err(SchedulingError::AlreadyEnrolled { .. }) => break candidate,
                    Err(SchedulingError::CapacityExceeded { .. }) => {
                        debug!(
                            section_id = %candidate.id,
                            "Section filled before admission, re-selecting"
                        );
                    }
                    Err(err) => return Err(err),
                }
            };

            info!(
                user_id = %user,
                section_id = %chosen.id,
                course_id = %course,
                "Section placed"
            );

            if let Some(previous) = existing.filter(|s| s.id != chosen.id) {
                self.release(user, &previous, log).await?;
            }

            let clashes: Vec<Session> = held
                .iter()
                .filter(|s| {
                    s.is_section()
                        && s.id != chosen.id
                        && s.slot == chosen.slot
                        && s.course != course
                })
                .cloned()
                .collect();
            if clashes.is_empty() {
                return chosen.id.as_section().ok_or_else(|| {
                    SchedulingError::InvalidInput(format!("{} is not a section", chosen.id))
                });
            }

            for clash in clashes {
                if let SessionId::Section(section) = clash.id {
                    info!(
                        section_id = %section,
                        course_id = %clash.course,
                        "Placed section collides with another course, relocating"
                    );
                    self.reenroll_inner(user, section, log, depth + 1).await?;
                }
            }

            // A nested relocation may have moved this course's section again.
            let held = self.store.find_sessions_for_user(user).await?;
            held.iter()
                .find(|s| s.is_section() && s.course == course)
                .and_then(|s| s.id.as_section())
                .ok_or(SchedulingError::NoSectionHeld { user, course })
        })
    }

    pub(super) fn reenroll_inner<'a>(
        &'a self,
        user: UserId,
        section: SectionId,
        log: &'a mut SagaLog,
        depth: u32,
    ) -> BoxFuture<'a, SchedulingResult<SectionId>> {
        Box::pin(async move {
            let current = self.store.get_session(section.into()).await?;
            match self.release(user, &current, log).await {
                Ok(()) => {}
                Err(err @ SchedulingError::NotEnrolled { .. }) => {
                    error!(
                        user_id = %user,
                        section_id = %section,
                        "Cascade expected the user in a section they do not hold"
                    );
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
            self.ensure_inner(user, current.course, Some(current.id), log, depth)
                .await
        })
    }

    async fn release(
        &self,
        user: UserId,
        session: &Session,
        log: &mut SagaLog,
    ) -> SchedulingResult<()> {
        let touch = log
            .record(session.id, session.course, TouchOp::Released)
            .await?;
        self.capacity
            .try_adjust(session.id, user, MembershipChange::Remove)
            .await?;
        log.confirm(touch).await
    }

    /// Undo a failed cascade and settle its saga.
    ///
    /// Returns the error the caller should see: `cause` if the undo worked,
    /// otherwise [`SchedulingError::CompensationFailed`].
    pub(super) async fn compensate(
        &self,
        log: SagaLog,
        cause: SchedulingError,
        include_unconfirmed: bool,
    ) -> SchedulingError {
        if log.saga().touched.is_empty() {
            log.finish(SagaState::Aborted, Some(cause.to_string())).await;
            return cause;
        }

        warn!(
            saga_id = %log.id(),
            error = %cause,
            "Cascade failed, compensating"
        );
        let saga = log.saga().clone();
        match self.undo(&saga, include_unconfirmed).await {
            Ok(()) => {
                log.finish(SagaState::Compensated, Some(cause.to_string()))
                    .await;
                cause
            }
            Err(undo_err) => {
                error!(
                    saga_id = %saga.id,
                    user_id = %saga.user,
                    cause = %cause,
                    error = %undo_err,
                    "Compensation failed, saga needs repair"
                );
                log.finish(SagaState::NeedsRepair, Some(undo_err.to_string()))
                    .await;
                SchedulingError::CompensationFailed {
                    cause: cause.to_string(),
                    source: Box::new(undo_err),
                }
            }
        }
    }

    /// Release every admission the saga made, then give back every section
    /// it took away.
    fn undo<'a>(
        &'a self,
        saga: &'a CascadeSaga,
        include_unconfirmed: bool,
    ) -> BoxFuture<'a, SchedulingResult<()>> {
        Box::pin(async move {
            let user = saga.user;

            for touch in saga.admissions_to_undo(include_unconfirmed) {
                let session = match self.store.get_session(touch.session).await {
                    Ok(session) => session,
                    Err(SchedulingError::NotFound { .. }) => continue,
                    Err(err) => return Err(err),
                };
                if !session.has_member(user) {
                    continue;
                }
                match self
                    .capacity
                    .try_adjust(touch.session, user, MembershipChange::Remove)
                    .await
                {
                    Ok(_) | Err(SchedulingError::NotEnrolled { .. }) => {}
                    Err(err) => return Err(err),
                }
            }

            for touch in saga.releases_to_restore(include_unconfirmed) {
                let held = self.store.find_sessions_for_user(user).await?;
                if held
                    .iter()
                    .any(|s| s.is_section() && s.course == touch.course)
                {
                    continue;
                }
                match self
                    .capacity
                    .try_adjust(touch.session, user, MembershipChange::Add)
                    .await
                {
                    Ok(_) | Err(SchedulingError::AlreadyEnrolled { .. }) => {
                        debug!(session_id = %touch.session, "Original seat restored");
                    }
                    Err(SchedulingError::CapacityExceeded { .. })
                    | Err(SchedulingError::NotFound { .. }) => {
                        info!(
                            session_id = %touch.session,
                            course_id = %touch.course,
                            "Original seat gone, placing in another section"
                        );
                        self.ensure_section_enrollment(user, touch.course).await?;
                    }
                    Err(err) => return Err(err),
                }
            }
            Ok(())
        })
    }

    /// Release the user from one lecture or section. Does not cascade.
    #[instrument(skip(self, user, session), fields(user_id = %user, session_id = %session))]
    pub async fn remove_user_from_session(
        &self,
        user: UserId,
        session: SessionId,
    ) -> SchedulingResult<()> {
        match self
            .capacity
            .try_adjust(session, user, MembershipChange::Remove)
            .await
        {
            Ok(adjusted) => {
                info!(enrolled = adjusted.enrolled, "User removed from session");
                Ok(())
            }
            Err(err @ SchedulingError::NotEnrolled { .. }) => {
                warn!("Removal requested for a user who is not a member");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Release the user's section in `course`.
    #[instrument(skip(self, user, course), fields(user_id = %user, course_id = %course))]
    pub async fn remove_user_from_course_section(
        &self,
        user: UserId,
        course: CourseId,
    ) -> SchedulingResult<SectionId> {
        let held = self.store.find_sessions_for_user(user).await?;
        let Some(section) = held
            .iter()
            .find(|s| s.is_section() && s.course == course)
            .and_then(|s| s.id.as_section())
        else {
            return Err(SchedulingError::NoSectionHeld { user, course });
        };
        self.remove_user_from_session(user, section.into()).await?;
        Ok(section)
    }

    /// Whether a section placement in `course` could succeed right now.
    pub async fn can_enroll(&self, user: UserId, course: CourseId) -> SchedulingResult<bool> {
        match self.placement.select_section(user, course, &[]).await {
            Ok(_) => Ok(true),
            Err(SchedulingError::NoCapacity { .. })
            | Err(SchedulingError::NoAvailableSections { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// The user's lectures and sections ordered by time slot.
    pub async fn schedule_for_user(&self, user: UserId) -> SchedulingResult<Vec<Session>> {
        let mut sessions = self.store.find_sessions_for_user(user).await?;
        sessions.sort_by(|a, b| a.slot.cmp(&b.slot).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    /// Bring one user's schedule back in line: one section per course,
    /// no section at a lecture's slot, a section for every held lecture.
    #[instrument(skip(self, user), fields(user_id = %user))]
    pub async fn repair_user(&self, user: UserId) -> SchedulingResult<RepairStatus> {
        let held = self.store.find_sessions_for_user(user).await?;
        let lecture_slots: Vec<_> = held
            .iter()
            .filter(|s| s.is_lecture())
            .map(|s| s.slot)
            .collect();

        // Duplicate sections of one course: keep one, preferring one clear
        // of every lecture.
        let mut by_course: BTreeMap<CourseId, Vec<&Session>> = BTreeMap::new();
        for section in held.iter().filter(|s| s.is_section()) {
            by_course.entry(section.course).or_default().push(section);
        }
        for sections in by_course.values().filter(|v| v.len() > 1) {
            let keep = sections
                .iter()
                .position(|s| !lecture_slots.contains(&s.slot))
                .unwrap_or(0);
            for (i, extra) in sections.iter().enumerate() {
                if i != keep {
                    info!(section_id = %extra.id, "Releasing duplicate section");
                    match self.remove_user_from_session(user, extra.id).await {
                        Ok(()) | Err(SchedulingError::NotEnrolled { .. }) => {}
                        Err(err) => return Err(err),
                    }
                }
            }
        }

        let held = self.store.find_sessions_for_user(user).await?;
        let lecture_courses: Vec<CourseId> = held
            .iter()
            .filter(|s| s.is_lecture())
            .map(|s| s.course)
            .collect();
        for section in held.iter().filter(|s| s.is_section()) {
            if !lecture_slots.contains(&section.slot) || lecture_courses.contains(&section.course) {
                continue;
            }
            if let SessionId::Section(id) = section.id {
                self.reenroll_in_section(user, id).await?;
            }
        }

        let mut courses = lecture_courses;
        courses.sort();
        courses.dedup();
        for course in courses {
            self.ensure_section_enrollment(user, course).await?;
        }

        let held = self.store.find_sessions_for_user(user).await?;
        if schedule_is_consistent(&held) {
            Ok(RepairStatus::Converged)
        } else {
            Ok(RepairStatus::Converging)
        }
    }

    /// Settle one open saga.
    ///
    /// Forward repair re-drives the section obligations the saga served. If
    /// that fails with a non-transient error, a lecture enrollment is
    /// compensated instead. Transient failures leave the saga open for the
    /// next pass.
    #[instrument(skip(self, id), fields(saga_id = %id))]
    pub async fn repair_saga(&self, id: SagaId) -> SchedulingResult<RepairStatus> {
        let saga = self.store.get_saga(id).await?;
        if saga.state.is_terminal() {
            return Ok(RepairStatus::Converged);
        }
        let user = saga.user;
        let mut log = SagaLog::resume(self.store.clone(), saga);
        let attempt = log.begin_attempt().await?;
        info!(
            user_id = %user,
            kind = log.saga().kind.name(),
            attempt,
            "Repairing saga"
        );

        if let SagaKind::LectureEnrollment { lecture, .. } = log.saga().kind {
            let lecture_session = match self.store.get_session(lecture.into()).await {
                Ok(session) => Some(session),
                Err(SchedulingError::NotFound { .. }) => None,
                Err(err) => {
                    log.note_error(&err.to_string()).await;
                    return Err(err);
                }
            };
            if !lecture_session.is_some_and(|s| s.has_member(user)) {
                // The admission never happened or was already undone: only
                // the evictions remain to be reversed.
                let cause = SchedulingError::NotEnrolled {
                    user,
                    session: lecture.into(),
                };
                return self.settle_by_compensation(log, cause).await;
            }
        }

        match self.forward_repair(user, log.saga()).await {
            Ok(status) => {
                log.finish(SagaState::Completed, None).await;
                Ok(status)
            }
            Err(err) if err.is_transient() => {
                warn!(error = %err, "Saga repair hit a transient failure");
                log.note_error(&err.to_string()).await;
                Err(err)
            }
            Err(err) => {
                if matches!(log.saga().kind, SagaKind::LectureEnrollment { .. }) {
                    self.settle_by_compensation(log, err).await
                } else {
                    error!(error = %err, "Saga repair failed");
                    log.finish(SagaState::NeedsRepair, Some(err.to_string()))
                        .await;
                    Err(err)
                }
            }
        }
    }

    async fn settle_by_compensation(
        &self,
        log: SagaLog,
        cause: SchedulingError,
    ) -> SchedulingResult<RepairStatus> {
        let saga_id = log.id();
        match self.compensate(log, cause, true).await {
            err @ SchedulingError::CompensationFailed { .. } => Err(err),
            cause => {
                info!(%saga_id, reason = %cause, "Saga settled by compensation");
                Ok(RepairStatus::Converged)
            }
        }
    }

    async fn forward_repair(&self, user: UserId, saga: &CascadeSaga) -> SchedulingResult<RepairStatus> {
        let status = self.repair_user(user).await?;

        let mut courses = saga.released_courses();
        courses.push(saga.kind.course());
        courses.sort();
        courses.dedup();
        let held = self.store.find_sessions_for_user(user).await?;
        for course in courses {
            let has_section = held.iter().any(|s| s.is_section() && s.course == course);
            let needs_section = match saga.kind {
                SagaKind::SessionDeletion { .. } => {
                    held.iter().any(|s| s.is_lecture() && s.course == course)
                }
                _ => true,
            };
            if !has_section && needs_section {
                self.ensure_section_enrollment(user, course).await?;
            }
        }
        Ok(status)
    }

    /// Open sagas not touched for at least `older_than`.
    pub async fn pending_sagas(
        &self,
        older_than: std::time::Duration,
    ) -> SchedulingResult<Vec<CascadeSaga>> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| SchedulingError::InvalidInput(e.to_string()))?;
        self.store.list_open_sagas(Utc::now() - age).await
    }
}

/// No two held sessions share a slot, at most one section per course, and
/// every held lecture's course has a section.
pub fn schedule_is_consistent(held: &[Session]) -> bool {
    let mut slots: Vec<_> = held.iter().map(|s| s.slot).collect();
    slots.sort();
    let before = slots.len();
    slots.dedup();
    if slots.len() != before {
        return false;
    }

    let mut section_courses: Vec<CourseId> = held
        .iter()
        .filter(|s| s.is_section())
        .map(|s| s.course)
        .collect();
    section_courses.sort();
    let before = section_courses.len();
    section_courses.dedup();
    if section_courses.len() != before {
        return false;
    }

    held.iter()
        .filter(|s| s.is_lecture())
        .all(|l| section_courses.contains(&l.course))
}
