//! Courses and sessions in Postgres.
//!
//! A session row carries its members in a `TEXT[]` column next to the
//! `enrolled` count, so one conditional `UPDATE` keeps both in step. Check
//! constraints on the table reject any write that would break
//! `0 <= enrolled <= capacity` or `enrolled = cardinality(users)`.

use std::collections::BTreeSet;

use async_trait::async_trait;
use hermes_id::{CourseId, SessionId, SessionKind, UserId};
use sqlx::{postgres::PgPool, postgres::PgRow, Row};
use tracing::debug;

use super::DbError;
use crate::model::{Course, MembershipChange, Session, SessionDetails, TimeSlot};
use crate::repository::{ConditionalUpdate, RepoError, RepoResult, SessionRepository};

const SESSION_COLUMNS: &str = "session_id, kind, course_id, name, code, description, \
     location, instructors, capacity, enrolled, day, slot, users";

/// A row from the sessions table.
#[derive(Debug, Clone)]
struct SessionRow {
    session_id: String,
    kind: String,
    course_id: String,
    name: String,
    code: String,
    description: String,
    location: String,
    instructors: Option<String>,
    capacity: i32,
    enrolled: i32,
    day: i32,
    slot: i32,
    users: Vec<String>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for SessionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            session_id: row.try_get("session_id")?,
            kind: row.try_get("kind")?,
            course_id: row.try_get("course_id")?,
            name: row.try_get("name")?,
            code: row.try_get("code")?,
            description: row.try_get("description")?,
            location: row.try_get("location")?,
            instructors: row.try_get("instructors")?,
            capacity: row.try_get("capacity")?,
            enrolled: row.try_get("enrolled")?,
            day: row.try_get("day")?,
            slot: row.try_get("slot")?,
            users: row.try_get("users")?,
        })
    }
}

impl TryFrom<SessionRow> for Session {
    type Error = RepoError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let invalid = |e: hermes_id::IdError| RepoError::InvalidData(e.to_string());

        let id: SessionId = row.session_id.parse().map_err(invalid)?;
        let stored_kind = SessionKind::from_db(&row.kind)
            .ok_or_else(|| RepoError::InvalidData(format!("unknown session kind {}", row.kind)))?;
        if stored_kind != id.kind() {
            return Err(RepoError::InvalidData(format!(
                "session {} stored as {}",
                id, row.kind
            )));
        }

        let users = row
            .users
            .iter()
            .map(|u| u.parse::<UserId>())
            .collect::<Result<BTreeSet<_>, _>>()
            .map_err(invalid)?;

        let details = match stored_kind {
            SessionKind::Lecture => SessionDetails::Lecture {
                hall: row.location,
                instructors: row.instructors.unwrap_or_default(),
            },
            SessionKind::Section => SessionDetails::Section { room: row.location },
        };

        Ok(Session {
            id,
            course: row.course_id.parse().map_err(invalid)?,
            name: row.name,
            code: row.code,
            description: row.description,
            capacity: row.capacity,
            enrolled: row.enrolled,
            slot: TimeSlot::new(row.day, row.slot),
            users,
            details,
        })
    }
}

#[derive(Debug, Clone)]
struct CourseRow {
    course_id: String,
    name: String,
    code: String,
    description: String,
    credit_hours: i32,
}

impl<'r> sqlx::FromRow<'r, PgRow> for CourseRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            course_id: row.try_get("course_id")?,
            name: row.try_get("name")?,
            code: row.try_get("code")?,
            description: row.try_get("description")?,
            credit_hours: row.try_get("credit_hours")?,
        })
    }
}

impl TryFrom<CourseRow> for Course {
    type Error = RepoError;

    fn try_from(row: CourseRow) -> Result<Self, Self::Error> {
        Ok(Course {
            id: row
                .course_id
                .parse()
                .map_err(|e: hermes_id::IdError| RepoError::InvalidData(e.to_string()))?,
            name: row.name,
            code: row.code,
            description: row.description,
            credit_hours: row.credit_hours,
        })
    }
}

fn query_err(e: sqlx::Error) -> RepoError {
    RepoError::Db(DbError::Query(e))
}

fn sql_state(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
        _ => None,
    }
}

/// [`SessionRepository`] over Postgres.
#[derive(Clone)]
pub struct PgSessionRepository {
    pool: PgPool,
}

impl PgSessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn session_exists(&self, id: SessionId) -> RepoResult<bool> {
        let row = sqlx::query("SELECT 1 FROM sessions WHERE session_id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl SessionRepository for PgSessionRepository {
    async fn get_session(&self, id: SessionId) -> RepoResult<Session> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;

        row.ok_or_else(|| RepoError::not_found("session", id))?
            .try_into()
    }

    async fn get_course_sections(&self, course: CourseId) -> RepoResult<Vec<Session>> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE course_id = $1 AND kind = 'section' \
             ORDER BY created_at, session_id"
        ))
        .bind(course.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        rows.into_iter().map(Session::try_from).collect()
    }

    async fn conditional_update_session(
        &self,
        id: SessionId,
        expected_enrolled: i32,
        user: UserId,
        change: MembershipChange,
    ) -> RepoResult<ConditionalUpdate> {
        let sql = match change {
            MembershipChange::Add => {
                r#"
                UPDATE sessions
                SET enrolled = enrolled + 1,
                    users = array_append(users, $3::text)
                WHERE session_id = $1
                  AND enrolled = $2
                  AND enrolled + 1 <= capacity
                  AND NOT ($3::text = ANY(users))
                RETURNING enrolled
                "#
            }
            MembershipChange::Remove => {
                r#"
                UPDATE sessions
                SET enrolled = enrolled - 1,
                    users = array_remove(users, $3::text)
                WHERE session_id = $1
                  AND enrolled = $2
                  AND enrolled > 0
                  AND $3::text = ANY(users)
                RETURNING enrolled
                "#
            }
        };

        let row = sqlx::query(sql)
            .bind(id.to_string())
            .bind(expected_enrolled)
            .bind(user.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let enrolled: i32 = row.try_get("enrolled").map_err(query_err)?;
                Ok(ConditionalUpdate::Applied { enrolled })
            }
            None if self.session_exists(id).await? => {
                debug!(session_id = %id, expected_enrolled, "Conditional update matched no row");
                Ok(ConditionalUpdate::Stale)
            }
            None => Err(RepoError::not_found("session", id)),
        }
    }

    async fn find_sessions_for_user(&self, user: UserId) -> RepoResult<Vec<Session>> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE $1 = ANY(users) ORDER BY session_id"
        ))
        .bind(user.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        rows.into_iter().map(Session::try_from).collect()
    }

    async fn insert_course(&self, course: &Course) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO courses (course_id, name, code, description, credit_hours)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(course.id.to_string())
        .bind(&course.name)
        .bind(&course.code)
        .bind(&course.description)
        .bind(course.credit_hours)
        .execute(&self.pool)
        .await
        .map_err(|e| match sql_state(&e).as_deref() {
            Some("23505") => RepoError::Duplicate {
                entity: "course",
                id: course.id.to_string(),
            },
            _ => query_err(e),
        })?;
        Ok(())
    }

    async fn get_course(&self, id: CourseId) -> RepoResult<Course> {
        let row = sqlx::query_as::<_, CourseRow>(
            r#"
            SELECT course_id, name, code, description, credit_hours
            FROM courses
            WHERE course_id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;

        row.ok_or_else(|| RepoError::not_found("course", id))?
            .try_into()
    }

    async fn insert_session(&self, session: &Session) -> RepoResult<()> {
        if !session.users.is_empty() || session.enrolled != 0 {
            return Err(RepoError::InvalidData(format!(
                "new session {} must start empty",
                session.id
            )));
        }

        let (location, instructors) = match &session.details {
            SessionDetails::Lecture { hall, instructors } => (hall.clone(), Some(instructors.clone())),
            SessionDetails::Section { room } => (room.clone(), None),
        };

        sqlx::query(
            r#"
            INSERT INTO sessions (
                session_id, kind, course_id, name, code, description,
                location, instructors, capacity, enrolled, day, slot, users
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, $10, $11, '{}')
            "#,
        )
        .bind(session.id.to_string())
        .bind(session.kind().as_str())
        .bind(session.course.to_string())
        .bind(&session.name)
        .bind(&session.code)
        .bind(&session.description)
        .bind(location)
        .bind(instructors)
        .bind(session.capacity)
        .bind(session.slot.day)
        .bind(session.slot.slot)
        .execute(&self.pool)
        .await
        .map_err(|e| match sql_state(&e).as_deref() {
            Some("23505") => RepoError::Duplicate {
                entity: "session",
                id: session.id.to_string(),
            },
            Some("23503") => RepoError::not_found("course", session.course),
            _ => query_err(e),
        })?;
        Ok(())
    }

    async fn delete_session(&self, id: SessionId) -> RepoResult<Session> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "DELETE FROM sessions WHERE session_id = $1 RETURNING {SESSION_COLUMNS}"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;

        row.ok_or_else(|| RepoError::not_found("session", id))?
            .try_into()
    }
}
