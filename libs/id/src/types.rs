//! Typed ID definitions for enrollment entities.

use crate::define_id;
use crate::IdError;

// =============================================================================
// Catalogue
// =============================================================================

define_id!(CourseId, "crs");
define_id!(LectureId, "lec");
define_id!(SectionId, "sec");

// =============================================================================
// Principals
// =============================================================================

define_id!(UserId, "usr");

// =============================================================================
// Cascades
// =============================================================================

define_id!(SagaId, "saga");

// =============================================================================
// Sessions
// =============================================================================

/// The two concrete kinds of capacity-bounded session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionKind {
    /// Chosen directly by the enrolling user.
    Lecture,
    /// Chosen by the engine on the user's behalf.
    Section,
}

impl SessionKind {
    /// Stable lowercase name, used as the storage discriminator.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lecture => "lecture",
            Self::Section => "section",
        }
    }

    /// Parses the storage discriminator.
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "lecture" => Some(Self::Lecture),
            "section" => Some(Self::Section),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to either kind of session.
///
/// Formats as the wrapped id, so the prefix alone tells the kinds apart:
/// `lec_…` or `sec_…`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionId {
    Lecture(LectureId),
    Section(SectionId),
}

impl SessionId {
    /// Returns which kind of session this id refers to.
    #[must_use]
    pub fn kind(&self) -> SessionKind {
        match self {
            Self::Lecture(_) => SessionKind::Lecture,
            Self::Section(_) => SessionKind::Section,
        }
    }

    /// Returns the lecture id, if this refers to a lecture.
    #[must_use]
    pub fn as_lecture(&self) -> Option<LectureId> {
        match self {
            Self::Lecture(id) => Some(*id),
            Self::Section(_) => None,
        }
    }

    /// Returns the section id, if this refers to a section.
    #[must_use]
    pub fn as_section(&self) -> Option<SectionId> {
        match self {
            Self::Section(id) => Some(*id),
            Self::Lecture(_) => None,
        }
    }

    /// Parses either a `lec_` or a `sec_` id.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        let Some((prefix, _)) = s.split_once('_') else {
            return Err(IdError::MissingSeparator);
        };
        match prefix {
            LectureId::PREFIX => LectureId::parse(s).map(Self::Lecture),
            SectionId::PREFIX => SectionId::parse(s).map(Self::Section),
            _ => Err(IdError::UnknownSessionKind(s.to_string())),
        }
    }
}

impl From<LectureId> for SessionId {
    fn from(id: LectureId) -> Self {
        Self::Lecture(id)
    }
}

impl From<SectionId> for SessionId {
    fn from(id: SectionId) -> Self {
        Self::Section(id)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lecture(id) => id.fmt(f),
            Self::Section(id) => id.fmt(f),
        }
    }
}

impl std::str::FromStr for SessionId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for SessionId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for SessionId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Ulid;
    use proptest::prelude::*;

    #[test]
    fn test_user_id_roundtrip() {
        let id = UserId::new();
        let s = id.to_string();
        let parsed: UserId = s.parse().unwrap();
        assert_eq!(id, parsed);
        assert!(s.starts_with("usr_"));
    }

    #[test]
    fn test_course_id_invalid_prefix() {
        let result: Result<CourseId, _> = "sec_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            IdError::InvalidPrefix {
                expected: "crs",
                ..
            }
        ));
    }

    #[test]
    fn test_missing_separator_and_empty() {
        let result: Result<LectureId, _> = "lec01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result.unwrap_err(), IdError::MissingSeparator));

        let result: Result<LectureId, _> = "".parse();
        assert!(matches!(result.unwrap_err(), IdError::Empty));
    }

    #[test]
    fn test_invalid_ulid() {
        let result: Result<SectionId, _> = "sec_invalid".parse();
        assert!(matches!(result.unwrap_err(), IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_session_id_dispatches_on_prefix() {
        let lecture = LectureId::new();
        let section = SectionId::new();

        let parsed: SessionId = lecture.to_string().parse().unwrap();
        assert_eq!(parsed, SessionId::Lecture(lecture));
        assert_eq!(parsed.kind(), SessionKind::Lecture);

        let parsed: SessionId = section.to_string().parse().unwrap();
        assert_eq!(parsed.as_section(), Some(section));
        assert_eq!(parsed.as_lecture(), None);
    }

    #[test]
    fn test_session_id_rejects_other_entities() {
        let err = SessionId::parse(&CourseId::new().to_string()).unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_session_id_json_is_plain_string() {
        let id = SessionId::Section(SectionId::new());
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_session_kind_db_names() {
        for kind in [SessionKind::Lecture, SessionKind::Section] {
            assert_eq!(SessionKind::from_db(kind.as_str()), Some(kind));
        }
        assert_eq!(SessionKind::from_db("tribune"), None);
    }

    #[test]
    fn test_ids_are_time_ordered() {
        let id1 = SectionId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = SectionId::new();
        assert!(id1 < id2);
    }

    #[test]
    fn test_all_id_prefixes_unique() {
        let prefixes = vec![
            CourseId::PREFIX,
            LectureId::PREFIX,
            SectionId::PREFIX,
            UserId::PREFIX,
            SagaId::PREFIX,
        ];

        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len(), "Duplicate ID prefixes found!");
    }

    proptest! {
        #[test]
        fn prop_any_ulid_roundtrips_through_text(raw in any::<u128>()) {
            let id = UserId::from_ulid(Ulid::from(raw));
            let parsed: UserId = id.to_string().parse().unwrap();
            prop_assert_eq!(parsed, id);
        }
    }
}
