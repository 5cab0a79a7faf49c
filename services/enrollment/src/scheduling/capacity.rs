//! Capacity controller: one membership change on one session, atomically.

use hermes_id::{SessionId, UserId};
use hermes_reconcile::RetryBudget;
use tracing::{debug, error};

use super::error::{SchedulingError, SchedulingResult};
use super::store::TimedStore;
use crate::model::{MembershipChange, Session};
use crate::repository::ConditionalUpdate;

/// Result of a successful adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adjusted {
    pub session: SessionId,
    pub enrolled: i32,
}

/// Applies `+1`/`-1` membership changes with a compare-and-swap on the
/// session's `enrolled` count.
///
/// Two concurrent adjustments whose combined effect would break
/// `0 <= enrolled <= capacity` can never both succeed: each one is a single
/// conditional write guarded by the count it read.
#[derive(Clone)]
pub struct CapacityController {
    store: TimedStore,
    max_attempts: u32,
}

impl CapacityController {
    pub(crate) fn new(store: TimedStore, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts,
        }
    }

    pub async fn try_adjust(
        &self,
        session: SessionId,
        user: UserId,
        change: MembershipChange,
    ) -> SchedulingResult<Adjusted> {
        let mut budget = RetryBudget::new("try_adjust", self.max_attempts);

        loop {
            let attempt = match budget.try_next() {
                Ok(attempt) => attempt,
                Err(e) => {
                    error!(
                        session_id = %session,
                        user_id = %user,
                        error = %e,
                        "Conditional update kept losing races"
                    );
                    return Err(SchedulingError::StaleRetriesExhausted {
                        session,
                        attempts: budget.used(),
                    });
                }
            };

            let current = self.store.get_session(session).await?;
            if let Err(detail) = current.check_invariants() {
                error!(session_id = %session, %detail, "Stored session violates its invariants");
                return Err(SchedulingError::CorruptSession { session, detail });
            }
            validate(&current, user, change)?;

            match self
                .store
                .conditional_update_session(session, current.enrolled, user, change)
                .await?
            {
                ConditionalUpdate::Applied { enrolled } => {
                    debug!(
                        session_id = %session,
                        user_id = %user,
                        ?change,
                        enrolled,
                        attempt,
                        "Membership adjusted"
                    );
                    return Ok(Adjusted { session, enrolled });
                }
                ConditionalUpdate::Stale => {
                    debug!(
                        session_id = %session,
                        user_id = %user,
                        expected = current.enrolled,
                        attempt,
                        "Lost compare-and-swap race, re-reading"
                    );
                }
            }
        }
    }
}

fn validate(session: &Session, user: UserId, change: MembershipChange) -> SchedulingResult<()> {
    let next = session.enrolled + change.delta();
    match change {
        MembershipChange::Add => {
            if session.has_member(user) {
                return Err(SchedulingError::AlreadyEnrolled {
                    user,
                    session: session.id,
                });
            }
            if next > session.capacity {
                return Err(SchedulingError::CapacityExceeded {
                    session: session.id,
                    capacity: session.capacity,
                });
            }
        }
        MembershipChange::Remove => {
            if !session.has_member(user) {
                return Err(SchedulingError::NotEnrolled {
                    user,
                    session: session.id,
                });
            }
            if next < 0 {
                return Err(SchedulingError::Underflow {
                    session: session.id,
                });
            }
        }
    }
    Ok(())
}
