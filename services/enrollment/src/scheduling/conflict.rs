//! Slot conflict detection over a user's current memberships.

use hermes_id::{SessionId, SessionKind, UserId};

use super::error::SchedulingResult;
use super::store::TimedStore;
use crate::model::{Session, TimeSlot};

/// First session in `held` at `slot` that is not excluded, optionally
/// restricted to one kind.
pub fn first_conflict<'a>(
    held: &'a [Session],
    slot: TimeSlot,
    excluding: &[SessionId],
    kind: Option<SessionKind>,
) -> Option<&'a Session> {
    held.iter().find(|s| {
        s.slot == slot
            && !excluding.contains(&s.id)
            && kind.map_or(true, |k| s.kind() == k)
    })
}

/// Looks up slot collisions for a user against the store.
#[derive(Clone)]
pub struct SlotConflictIndex {
    store: TimedStore,
}

impl SlotConflictIndex {
    pub(crate) fn new(store: TimedStore) -> Self {
        Self { store }
    }

    /// Any lecture or section the user holds at `slot`.
    pub async fn find_conflict(
        &self,
        user: UserId,
        slot: TimeSlot,
        excluding: &[SessionId],
    ) -> SchedulingResult<Option<Session>> {
        self.find(user, slot, excluding, None).await
    }

    pub async fn find_lecture_conflict(
        &self,
        user: UserId,
        slot: TimeSlot,
        excluding: &[SessionId],
    ) -> SchedulingResult<Option<Session>> {
        self.find(user, slot, excluding, Some(SessionKind::Lecture))
            .await
    }

    pub async fn find_section_conflict(
        &self,
        user: UserId,
        slot: TimeSlot,
        excluding: &[SessionId],
    ) -> SchedulingResult<Option<Session>> {
        self.find(user, slot, excluding, Some(SessionKind::Section))
            .await
    }

    async fn find(
        &self,
        user: UserId,
        slot: TimeSlot,
        excluding: &[SessionId],
        kind: Option<SessionKind>,
    ) -> SchedulingResult<Option<Session>> {
        let held = self.store.find_sessions_for_user(user).await?;
        Ok(first_conflict(&held, slot, excluding, kind).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewLecture, NewSection};
    use hermes_id::CourseId;

    fn lecture(slot: TimeSlot) -> Session {
        NewLecture {
            course: CourseId::new(),
            name: "L".to_string(),
            code: "L1".to_string(),
            description: String::new(),
            capacity: 10,
            slot,
            hall: String::new(),
            instructors: String::new(),
        }
        .into_session()
    }

    fn section(slot: TimeSlot) -> Session {
        NewSection {
            course: CourseId::new(),
            name: "S".to_string(),
            code: "S1".to_string(),
            description: String::new(),
            capacity: 10,
            slot,
            room: String::new(),
        }
        .into_session()
    }

    #[test]
    fn test_conflict_requires_equal_slot() {
        let held = vec![lecture(TimeSlot::new(1, 2)), section(TimeSlot::new(2, 1))];
        assert!(first_conflict(&held, TimeSlot::new(1, 3), &[], None).is_none());
        let hit = first_conflict(&held, TimeSlot::new(2, 1), &[], None).unwrap();
        assert_eq!(hit.id, held[1].id);
    }

    #[test]
    fn test_conflict_respects_exclusions_and_kind() {
        let slot = TimeSlot::new(4, 4);
        let held = vec![lecture(slot), section(slot)];

        let only_sections = first_conflict(&held, slot, &[], Some(SessionKind::Section)).unwrap();
        assert_eq!(only_sections.id, held[1].id);

        assert!(first_conflict(&held, slot, &[held[0].id], Some(SessionKind::Lecture)).is_none());
        let any = first_conflict(&held, slot, &[held[0].id], None).unwrap();
        assert_eq!(any.id, held[1].id);
    }
}
