//! Domain model for courses and capacity-bounded sessions.
//!
//! Lectures and sections share one [`Session`] shape. The kind is carried by
//! the [`SessionId`] variant, and the kind-specific descriptive fields live in
//! [`SessionDetails`]. Placement policy differs by kind; the capacity, slot
//! and membership contract does not.

use std::collections::BTreeSet;

use hermes_id::{CourseId, LectureId, SectionId, SessionId, SessionKind, UserId};
use serde::{Deserialize, Serialize};

/// A weekly time slot. Two sessions conflict iff their slots are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeSlot {
    pub day: i32,
    pub slot: i32,
}

impl TimeSlot {
    pub const fn new(day: i32, slot: i32) -> Self {
        Self { day, slot }
    }
}

impl std::fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "day {} slot {}", self.day, self.slot)
    }
}

/// A course. Sections and lectures reference it by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub id: CourseId,
    pub name: String,
    pub code: String,
    pub description: String,
    pub credit_hours: i32,
}

/// Kind-specific descriptive fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionDetails {
    Lecture { hall: String, instructors: String },
    Section { room: String },
}

/// A capacity-bounded, time-slotted session (lecture or section).
///
/// # Invariants
/// - `0 <= enrolled <= capacity`
/// - `enrolled == users.len()`
///
/// Both are checked by [`Session::check_invariants`] and must hold after
/// every completed repository write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub course: CourseId,
    pub name: String,
    pub code: String,
    pub description: String,
    pub capacity: i32,
    pub enrolled: i32,
    pub slot: TimeSlot,
    pub users: BTreeSet<UserId>,
    pub details: SessionDetails,
}

impl Session {
    pub fn kind(&self) -> SessionKind {
        self.id.kind()
    }

    pub fn is_lecture(&self) -> bool {
        self.kind() == SessionKind::Lecture
    }

    pub fn is_section(&self) -> bool {
        self.kind() == SessionKind::Section
    }

    pub fn has_member(&self, user: UserId) -> bool {
        self.users.contains(&user)
    }

    pub fn is_full(&self) -> bool {
        self.enrolled >= self.capacity
    }

    pub fn remaining(&self) -> i32 {
        (self.capacity - self.enrolled).max(0)
    }

    /// Verifies the capacity bound and the count/membership agreement.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.enrolled < 0 {
            return Err(format!("enrolled {} is negative", self.enrolled));
        }
        if self.enrolled > self.capacity {
            return Err(format!(
                "enrolled {} exceeds capacity {}",
                self.enrolled, self.capacity
            ));
        }
        if self.enrolled as usize != self.users.len() {
            return Err(format!(
                "enrolled {} disagrees with {} members",
                self.enrolled,
                self.users.len()
            ));
        }
        match (&self.details, self.kind()) {
            (SessionDetails::Lecture { .. }, SessionKind::Lecture)
            | (SessionDetails::Section { .. }, SessionKind::Section) => Ok(()),
            _ => Err("details do not match the session kind".to_string()),
        }
    }
}

/// Input for creating a course.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewCourse {
    pub name: String,
    pub code: String,
    pub description: String,
    pub credit_hours: i32,
}

impl NewCourse {
    pub fn into_course(self) -> Course {
        Course {
            id: CourseId::new(),
            name: self.name,
            code: self.code,
            description: self.description,
            credit_hours: self.credit_hours,
        }
    }
}

/// Input for creating a lecture.
#[derive(Debug, Clone, Deserialize)]
pub struct NewLecture {
    pub course: CourseId,
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub description: String,
    pub capacity: i32,
    pub slot: TimeSlot,
    #[serde(default)]
    pub hall: String,
    #[serde(default)]
    pub instructors: String,
}

impl NewLecture {
    pub fn into_session(self) -> Session {
        Session {
            id: SessionId::Lecture(LectureId::new()),
            course: self.course,
            name: self.name,
            code: self.code,
            description: self.description,
            capacity: self.capacity,
            enrolled: 0,
            slot: self.slot,
            users: BTreeSet::new(),
            details: SessionDetails::Lecture {
                hall: self.hall,
                instructors: self.instructors,
            },
        }
    }
}

/// Input for creating a section.
#[derive(Debug, Clone, Deserialize)]
pub struct NewSection {
    pub course: CourseId,
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub description: String,
    pub capacity: i32,
    pub slot: TimeSlot,
    #[serde(default)]
    pub room: String,
}

impl NewSection {
    pub fn into_session(self) -> Session {
        Session {
            id: SessionId::Section(SectionId::new()),
            course: self.course,
            name: self.name,
            code: self.code,
            description: self.description,
            capacity: self.capacity,
            enrolled: 0,
            slot: self.slot,
            users: BTreeSet::new(),
            details: SessionDetails::Section { room: self.room },
        }
    }
}

/// Direction of a single membership edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipChange {
    Add,
    Remove,
}

impl MembershipChange {
    /// Change applied to `enrolled`.
    pub fn delta(&self) -> i32 {
        match self {
            Self::Add => 1,
            Self::Remove => -1,
        }
    }
}
