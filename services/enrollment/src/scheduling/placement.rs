//! Section placement policy.

use hermes_id::{CourseId, SessionId, UserId};

use super::error::{SchedulingError, SchedulingResult};
use super::store::TimedStore;
use crate::model::Session;

/// Picks the section of `course` a user should be placed in.
///
/// Sections at the slot of a lecture in `held` are skipped, as are the ids in
/// `excluding` (a section the user was just evicted from). Among the rest the
/// lowest `enrolled` wins, and the earliest section wins a tie. Clashes with
/// other sections are left to the caller.
pub fn choose<'a>(
    course: CourseId,
    sections: &'a [Session],
    held: &[Session],
    excluding: &[SessionId],
) -> SchedulingResult<&'a Session> {
    if sections.is_empty() {
        return Err(SchedulingError::NoSectionsAvailable { course });
    }

    let mut best: Option<&Session> = None;
    for section in sections.iter().filter(|s| !excluding.contains(&s.id)) {
        let blocked = held
            .iter()
            .any(|h| h.is_lecture() && h.slot == section.slot);
        if blocked {
            continue;
        }
        match best {
            Some(current) if section.enrolled >= current.enrolled => {}
            _ => best = Some(section),
        }
    }

    let Some(best) = best else {
        return Err(SchedulingError::NoAvailableSections { course });
    };
    if best.is_full() {
        return Err(SchedulingError::NoCapacity { course });
    }
    Ok(best)
}

/// Reads sections and memberships and applies [`choose`]. Never writes.
#[derive(Clone)]
pub struct PlacementSelector {
    store: TimedStore,
}

impl PlacementSelector {
    pub(crate) fn new(store: TimedStore) -> Self {
        Self { store }
    }

    pub async fn select_section(
        &self,
        user: UserId,
        course: CourseId,
        excluding: &[SessionId],
    ) -> SchedulingResult<Session> {
        let sections = self.store.get_course_sections(course).await?;
        if sections.is_empty() {
            return Err(SchedulingError::NoSectionsAvailable { course });
        }
        let held = self.store.find_sessions_for_user(user).await?;
        choose(course, &sections, &held, excluding).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewLecture, NewSection, TimeSlot};
    use rstest::rstest;

    fn section(course: CourseId, enrolled: i32, capacity: i32, slot: TimeSlot) -> Session {
        let mut s = NewSection {
            course,
            name: "S".to_string(),
            code: "S".to_string(),
            description: String::new(),
            capacity,
            slot,
            room: String::new(),
        }
        .into_session();
        for _ in 0..enrolled {
            s.users.insert(UserId::new());
        }
        s.enrolled = enrolled;
        s
    }

    fn held_lecture(course: CourseId, slot: TimeSlot) -> Session {
        NewLecture {
            course,
            name: "L".to_string(),
            code: "L".to_string(),
            description: String::new(),
            capacity: 100,
            slot,
            hall: String::new(),
            instructors: String::new(),
        }
        .into_session()
    }

    #[rstest]
    #[case::least_loaded(vec![2, 2, 5], 0)]
    #[case::tie_goes_to_first(vec![3, 1, 1], 1)]
    #[case::last_is_emptiest(vec![4, 4, 0], 2)]
    fn test_least_loaded_wins(#[case] loads: Vec<i32>, #[case] expected: usize) {
        let course = CourseId::new();
        let sections: Vec<Session> = loads
            .iter()
            .enumerate()
            .map(|(i, &n)| section(course, n, 10, TimeSlot::new(i as i32, 0)))
            .collect();
        let chosen = choose(course, &sections, &[], &[]).unwrap();
        assert_eq!(chosen.id, sections[expected].id);
    }

    #[test]
    fn test_sections_at_lecture_slot_are_skipped() {
        let course = CourseId::new();
        let clash = TimeSlot::new(1, 2);
        let sections = vec![
            section(course, 0, 10, clash),
            section(course, 5, 10, TimeSlot::new(3, 3)),
        ];
        let held = vec![held_lecture(course, clash)];
        let chosen = choose(course, &sections, &held, &[]).unwrap();
        assert_eq!(chosen.id, sections[1].id);
    }

    #[test]
    fn test_only_lecture_collisions_filter() {
        let course = CourseId::new();
        let slot = TimeSlot::new(1, 2);
        let sections = vec![section(course, 0, 10, slot)];
        let held = vec![section(CourseId::new(), 1, 10, slot)];
        assert!(choose(course, &sections, &held, &[]).is_ok());
    }

    #[test]
    fn test_excluded_section_is_never_chosen() {
        let course = CourseId::new();
        let sections = vec![
            section(course, 0, 10, TimeSlot::new(1, 1)),
            section(course, 3, 10, TimeSlot::new(5, 5)),
        ];
        let chosen = choose(course, &sections, &[], &[sections[0].id]).unwrap();
        assert_eq!(chosen.id, sections[1].id);

        assert!(matches!(
            choose(course, &sections[..1], &[], &[sections[0].id]),
            Err(SchedulingError::NoAvailableSections { .. })
        ));
    }

    #[test]
    fn test_error_cases() {
        let course = CourseId::new();
        assert!(matches!(
            choose(course, &[], &[], &[]),
            Err(SchedulingError::NoSectionsAvailable { .. })
        ));

        let slot = TimeSlot::new(2, 2);
        let blocked = vec![section(course, 0, 10, slot)];
        assert!(matches!(
            choose(course, &blocked, &[held_lecture(course, slot)], &[]),
            Err(SchedulingError::NoAvailableSections { .. })
        ));

        let full = vec![section(course, 2, 2, slot), section(course, 3, 3, TimeSlot::new(0, 0))];
        assert!(matches!(
            choose(course, &full, &[], &[]),
            Err(SchedulingError::NoCapacity { .. })
        ));
    }
}
