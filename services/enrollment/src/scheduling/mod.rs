//! Scheduling engine.
//!
//! Places users into capacity-bounded lectures and sections so that no two
//! sessions a user holds share a time slot and no session exceeds its
//! capacity. The pieces, bottom-up:
//!
//! - [`SlotConflictIndex`] answers "does this user already hold something at
//!   this slot?"
//! - [`CapacityController`] applies one membership change to one session with
//!   a compare-and-swap on `enrolled`
//! - [`PlacementSelector`] picks the least-loaded eligible section
//! - [`SchedulingEngine`] composes them into enrollment cascades, each one
//!   recorded as a [`CascadeSaga`] so a partial cascade can be compensated or
//!   repaired
//! - [`RepairWorker`] re-drives sagas left open by a crash or a failed
//!   compensation

pub mod capacity;
mod catalog;
pub mod conflict;
mod engine;
pub mod error;
pub mod placement;
pub mod repair;
pub mod saga;
mod store;

pub use capacity::{Adjusted, CapacityController};
pub use catalog::DeletionOutcome;
pub use conflict::SlotConflictIndex;
pub use engine::{schedule_is_consistent, LectureEnrollment, SchedulingEngine, SectionPlacement};
pub use error::{ErrorClass, SchedulingError, SchedulingResult};
pub use placement::PlacementSelector;
pub use repair::{RepairConfig, RepairStats, RepairWorker};
pub use saga::{CascadeSaga, SagaKind, SagaState, Touch, TouchOp};

use std::time::Duration;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline applied to every repository call.
    pub repo_timeout: Duration,

    /// Attempts for one compare-and-swap loop, and for re-selecting a
    /// section after losing a placement race.
    pub max_adjust_retries: u32,

    /// Maximum number of nested section relocations in one cascade.
    pub max_cascade_depth: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            repo_timeout: Duration::from_secs(5),
            max_adjust_retries: 3,
            max_cascade_depth: 4,
        }
    }
}
