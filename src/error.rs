use rusqlite::ffi;
use serde_json::json;

use crate::backlog::BACKLOG_COURSE_CAP;

/// Why a student/course pair may not take the requested grading step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Ineligibility {
    #[error("student is not registered for this course")]
    NotRegistered,
    #[error("student has already passed this course")]
    AlreadyPassed,
    #[error("student is not registered in this group for this course")]
    NotRegisteredInGroup,
    #[error("cannot register for more than {cap} backlog courses in this group", cap = BACKLOG_COURSE_CAP)]
    BacklogCapReached,
    #[error("backlog group is closed for registration")]
    GroupClosed,
    #[error("student has no failing result for this course")]
    NoFailingResult,
}

impl Ineligibility {
    /// Stable tag for callers that need to branch on the reason.
    pub fn reason(self) -> &'static str {
        match self {
            Ineligibility::NotRegistered => "not_registered",
            Ineligibility::AlreadyPassed => "already_passed",
            Ineligibility::NotRegisteredInGroup => "not_registered_in_group",
            Ineligibility::BacklogCapReached => "backlog_cap_reached",
            Ineligibility::GroupClosed => "group_closed",
            Ineligibility::NoFailingResult => "no_failing_result",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Ineligible(#[from] Ineligibility),

    #[error("student {student_id}, course {course_id}: {why}")]
    IneligibleEntry {
        student_id: i64,
        course_id: i64,
        why: Ineligibility,
    },

    #[error("{0}")]
    Integrity(String),

    #[error("result already exists for this student and course")]
    Conflict,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("identity required")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(&'static str),

    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        CoreError::Validation(message.into())
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        CoreError::Integrity(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "bad_params",
            CoreError::Ineligible(_) | CoreError::IneligibleEntry { .. } => "not_eligible",
            CoreError::Integrity(_) => "integrity_violation",
            CoreError::Conflict => "conflict",
            CoreError::NotFound(_) => "not_found",
            CoreError::Unauthorized => "unauthorized",
            CoreError::Forbidden(_) => "forbidden",
            CoreError::Db(_) => "db_query_failed",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            CoreError::Ineligible(why) => Some(json!({ "reason": why.reason() })),
            CoreError::IneligibleEntry {
                student_id,
                course_id,
                why,
            } => Some(json!({
                "reason": why.reason(),
                "student_id": student_id,
                "course_id": course_id,
            })),
            _ => None,
        }
    }

    /// The ineligibility reason, when this error carries one.
    pub fn ineligibility(&self) -> Option<Ineligibility> {
        match self {
            CoreError::Ineligible(why) | CoreError::IneligibleEntry { why, .. } => Some(*why),
            _ => None,
        }
    }
}

pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                || inner.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

/// Maps a uniqueness failure from the store onto `on_unique`, passing any
/// other storage error through.
pub fn map_unique(e: rusqlite::Error, on_unique: impl FnOnce() -> CoreError) -> CoreError {
    if is_unique_violation(&e) {
        on_unique()
    } else {
        CoreError::Db(e)
    }
}
