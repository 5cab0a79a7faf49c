//! Scheduling error types.

use hermes_id::{CourseId, LectureId, SessionId, UserId};
use thiserror::Error;

use crate::model::TimeSlot;
use crate::repository::RepoError;

pub type SchedulingResult<T> = Result<T, SchedulingError>;

/// Coarse classification callers use to decide what to do with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The request contradicts the user's current schedule. Not retryable.
    ConstraintViolation,

    /// No seat right now. Retry after backoff; never queued.
    ResourceExhausted,

    /// The course is not set up to accept placements.
    ConfigurationAbsent,

    /// Stored state disagrees with what the engine expected. Always logged at
    /// error level.
    ConsistencyViolation,

    /// The request itself is malformed.
    InvalidInput,

    /// Storage failure, deadline or missing document.
    Infrastructure,
}

/// Errors raised by the scheduling engine.
#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("{session} conflicts with {conflicting} at {slot}")]
    TimeConflict {
        session: SessionId,
        conflicting: SessionId,
        slot: TimeSlot,
    },

    #[error("lecture {lecture} is full")]
    LectureFull { lecture: LectureId },

    #[error("no section of course {course} could admit the user")]
    SectionFull { course: CourseId },

    #[error("least-loaded section of course {course} has no free seat")]
    NoCapacity { course: CourseId },

    #[error("course {course} has no sections")]
    NoSectionsAvailable { course: CourseId },

    #[error("every section of course {course} collides with a held lecture")]
    NoAvailableSections { course: CourseId },

    #[error("user {user} is not enrolled in {session}")]
    NotEnrolled { user: UserId, session: SessionId },

    #[error("user {user} is already enrolled in {session}")]
    AlreadyEnrolled { user: UserId, session: SessionId },

    #[error("user {user} holds no section of course {course}")]
    NoSectionHeld { user: UserId, course: CourseId },

    #[error("{session} is at capacity {capacity}")]
    CapacityExceeded { session: SessionId, capacity: i32 },

    #[error("{session} enrolled count would go negative")]
    Underflow { session: SessionId },

    #[error("gave up on {session} after {attempts} stale updates")]
    StaleRetriesExhausted { session: SessionId, attempts: u32 },

    #[error("cascade for user {user} exceeded depth {max_depth}")]
    CascadeDepthExceeded { user: UserId, max_depth: u32 },

    #[error("{session} is corrupt: {detail}")]
    CorruptSession { session: SessionId, detail: String },

    #[error("compensation after '{cause}' failed: {source}")]
    CompensationFailed {
        cause: String,
        #[source]
        source: Box<SchedulingError>,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("repository call {operation} timed out")]
    Timeout { operation: &'static str },

    #[error("repository error: {0}")]
    Repository(#[source] RepoError),
}

impl From<RepoError> for SchedulingError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound { entity, id } => Self::NotFound { entity, id },
            other => Self::Repository(other),
        }
    }
}

impl SchedulingError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::TimeConflict { .. }
            | Self::NotEnrolled { .. }
            | Self::AlreadyEnrolled { .. }
            | Self::NoSectionHeld { .. } => ErrorClass::ConstraintViolation,
            Self::LectureFull { .. }
            | Self::SectionFull { .. }
            | Self::NoCapacity { .. }
            | Self::CapacityExceeded { .. } => ErrorClass::ResourceExhausted,
            Self::NoSectionsAvailable { .. } | Self::NoAvailableSections { .. } => {
                ErrorClass::ConfigurationAbsent
            }
            Self::Underflow { .. }
            | Self::StaleRetriesExhausted { .. }
            | Self::CascadeDepthExceeded { .. }
            | Self::CorruptSession { .. }
            | Self::CompensationFailed { .. } => ErrorClass::ConsistencyViolation,
            Self::InvalidInput(_) => ErrorClass::InvalidInput,
            Self::NotFound { .. } | Self::Timeout { .. } | Self::Repository(_) => {
                ErrorClass::Infrastructure
            }
        }
    }

    /// True if the same request may succeed later without any change.
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::ResourceExhausted)
            || matches!(self, Self::Timeout { .. } | Self::Repository(_))
    }

    /// True if a repair pass should leave the saga open and try again
    /// rather than compensate.
    pub fn is_transient(&self) -> bool {
        self.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hermes_id::SectionId;

    #[test]
    fn test_classes() {
        let section = SessionId::Section(SectionId::new());
        let conflict = SchedulingError::TimeConflict {
            session: section,
            conflicting: section,
            slot: TimeSlot::new(1, 2),
        };
        assert_eq!(conflict.class(), ErrorClass::ConstraintViolation);
        assert!(!conflict.is_retryable());

        let full = SchedulingError::SectionFull {
            course: CourseId::new(),
        };
        assert_eq!(full.class(), ErrorClass::ResourceExhausted);
        assert!(full.is_retryable());

        let absent = SchedulingError::NoAvailableSections {
            course: CourseId::new(),
        };
        assert_eq!(absent.class(), ErrorClass::ConfigurationAbsent);

        let timeout = SchedulingError::Timeout {
            operation: "get_session",
        };
        assert_eq!(timeout.class(), ErrorClass::Infrastructure);
        assert!(timeout.is_transient());
    }

    #[test]
    fn test_repo_not_found_maps_to_not_found() {
        let err: SchedulingError = RepoError::not_found("session", "sec_x").into();
        assert!(matches!(err, SchedulingError::NotFound { entity: "session", .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_compensation_failure_keeps_source() {
        let inner = SchedulingError::Timeout {
            operation: "conditional_update_session",
        };
        let err = SchedulingError::CompensationFailed {
            cause: "no sections".to_string(),
            source: Box::new(inner),
        };
        assert_eq!(err.class(), ErrorClass::ConsistencyViolation);
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(
            source.as_deref(),
            Some("repository call conditional_update_session timed out")
        );
    }
}
