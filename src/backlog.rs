//! Result entry gate and the backlog (supplementary exam) lifecycle.
//!
//! Per student/course pair:
//!
//! ```text
//! no result --(>=40)--> passed (terminal)
//!           --(<40)---> failed --added to group--> eligible --student opts in--> registered
//! registered --result in group >=40--> cleared (terminal)
//!            --result in group <40---> failed again --> eligible in another group
//! ```

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

use crate::error::{map_unique, CoreError, CoreResult, Ineligibility};
use crate::grading;
use crate::records;
use crate::results::{self, ResultRecord};

/// Registered backlog courses allowed per student within one group.
pub const BACKLOG_COURSE_CAP: i64 = 5;

#[derive(Debug, Clone)]
pub struct AddCheck {
    pub existing: Option<ResultRecord>,
    pub blocked: Option<Ineligibility>,
}

impl AddCheck {
    pub fn can_add(&self) -> bool {
        self.blocked.is_none()
    }

    /// A new result for this pair would be a backlog attempt.
    pub fn is_backlog(&self) -> bool {
        self.existing.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewResult {
    pub student_id: i64,
    pub course_id: i64,
    pub marks: f64,
    #[serde(default)]
    pub published: bool,
    #[serde(default)]
    pub backlog_group_id: Option<i64>,
    /// What the submitter believes this attempt is. Cross-checked against
    /// the stored history, never trusted on its own.
    #[serde(default)]
    pub is_backlog: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
pub struct BacklogEntry {
    pub student_id: i64,
    pub course_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacklogGroup {
    pub id: i64,
    pub name: String,
    pub is_open: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacklogGroupSummary {
    #[serde(flatten)]
    pub group: BacklogGroup,
    pub course_count: i64,
    pub registered_count: i64,
    pub graded_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Membership {
    pub group_id: i64,
    pub student_id: i64,
    pub course_id: i64,
    pub is_registered: bool,
    pub registered_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MembershipRow {
    #[serde(flatten)]
    pub membership: Membership,
    pub roll_no: String,
    pub student_name: String,
    pub course_code: String,
    pub course_name: String,
    pub has_result: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacklogGroupDetail {
    pub group: BacklogGroup,
    pub memberships: Vec<MembershipRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentMembership {
    #[serde(flatten)]
    pub membership: Membership,
    pub group_name: String,
    pub group_is_open: bool,
    pub course_code: String,
    pub course_name: String,
    pub has_result: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddEntriesOutcome {
    pub added: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CandidateFilter {
    pub department_id: Option<i64>,
    pub course_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacklogCandidate {
    pub student_id: i64,
    pub roll_no: String,
    pub student_name: String,
    pub course_id: i64,
    pub course_code: String,
    pub course_name: String,
    pub latest_marks: f64,
    pub attempts: i64,
}

// ---- result entry ----

/// Whether a new result may be recorded for the pair, and whether it would
/// be a first attempt or a backlog attempt.
pub fn can_add_result(conn: &Connection, student_id: i64, course_id: i64) -> CoreResult<AddCheck> {
    if !records::is_registered(conn, student_id, course_id)? {
        return Ok(AddCheck {
            existing: None,
            blocked: Some(Ineligibility::NotRegistered),
        });
    }
    let existing = results::latest_result(conn, student_id, course_id)?;
    let blocked = match &existing {
        Some(r) if grading::is_pass(r.marks) => Some(Ineligibility::AlreadyPassed),
        _ => None,
    };
    Ok(AddCheck { existing, blocked })
}

/// Records one result. The eligibility check and the insert share a single
/// write transaction so two submissions for the same pair cannot both see
/// an empty history.
pub fn create_result(conn: &Connection, input: &NewResult) -> CoreResult<ResultRecord> {
    let marks = grading::validate_marks(input.marks)?;

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let check = can_add_result(&tx, input.student_id, input.course_id)?;
    if let Some(why) = check.blocked {
        warn!(
            student_id = input.student_id,
            course_id = input.course_id,
            reason = why.reason(),
            "result rejected"
        );
        return Err(why.into());
    }

    let is_backlog = check.is_backlog();
    let group_id = match (is_backlog, input.is_backlog, input.backlog_group_id) {
        (false, Some(true), _) => {
            return Err(CoreError::validation(
                "backlog result requires a prior failing result",
            ))
        }
        (false, _, Some(_)) => {
            return Err(CoreError::validation(
                "backlog_group_id given but the course has no prior failing result",
            ))
        }
        (false, _, None) => None,
        (true, Some(false), _) => return Err(CoreError::Conflict),
        (true, _, None) => {
            return Err(CoreError::validation(
                "backlog_group_id is required for a backlog result",
            ))
        }
        (true, _, Some(group_id)) => {
            get_group(&tx, group_id)?;
            let membership = find_membership(&tx, group_id, input.student_id, input.course_id)?;
            if !membership.map(|m| m.is_registered).unwrap_or(false) {
                warn!(
                    student_id = input.student_id,
                    course_id = input.course_id,
                    group_id,
                    "backlog result rejected: not registered in group"
                );
                return Err(Ineligibility::NotRegisteredInGroup.into());
            }
            Some(group_id)
        }
    };

    tx.execute(
        "INSERT INTO results(student_id, course_id, marks, published, is_backlog, backlog_group_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            input.student_id,
            input.course_id,
            marks,
            input.published,
            is_backlog,
            group_id,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| map_unique(e, || CoreError::Conflict))?;
    let id = tx.last_insert_rowid();
    let record = results::get_result(&tx, id)?;
    tx.commit()?;

    info!(
        result_id = id,
        student_id = record.student_id,
        course_id = record.course_id,
        marks = record.marks,
        is_backlog,
        "result recorded"
    );
    Ok(record)
}

// ---- groups ----

fn group_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<BacklogGroup> {
    Ok(BacklogGroup {
        id: r.get(0)?,
        name: r.get(1)?,
        is_open: r.get::<_, i64>(2)? != 0,
        created_at: r.get(3)?,
    })
}

pub fn get_group(conn: &Connection, group_id: i64) -> CoreResult<BacklogGroup> {
    conn.query_row(
        "SELECT id, name, is_open, created_at FROM backlog_groups WHERE id = ?",
        [group_id],
        group_from_row,
    )
    .optional()?
    .ok_or(CoreError::NotFound("backlog group"))
}

fn group_name(name: &str) -> CoreResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CoreError::validation("group name must not be empty"));
    }
    Ok(name.to_string())
}

/// A pair may join a group only while it is registered and failing.
fn ensure_backlog_eligible(conn: &Connection, entry: BacklogEntry) -> CoreResult<()> {
    let why = if !records::is_registered(conn, entry.student_id, entry.course_id)? {
        Some(Ineligibility::NotRegistered)
    } else {
        match results::latest_result(conn, entry.student_id, entry.course_id)? {
            None => Some(Ineligibility::NoFailingResult),
            Some(r) if grading::is_pass(r.marks) => Some(Ineligibility::AlreadyPassed),
            Some(_) => None,
        }
    };
    match why {
        None => Ok(()),
        Some(why) => Err(CoreError::IneligibleEntry {
            student_id: entry.student_id,
            course_id: entry.course_id,
            why,
        }),
    }
}

fn insert_membership(conn: &Connection, group_id: i64, entry: BacklogEntry) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO backlog_group_courses(group_id, student_id, course_id, is_registered, registered_at)
         VALUES(?, ?, ?, 0, NULL)",
        (group_id, entry.student_id, entry.course_id),
    )?;
    Ok(())
}

/// Creates the group and its unregistered memberships together; nothing is
/// written unless every entry is eligible.
pub fn create_backlog_group(
    conn: &Connection,
    name: &str,
    is_open: bool,
    entries: &[BacklogEntry],
) -> CoreResult<BacklogGroup> {
    let name = group_name(name)?;
    let entries: BTreeSet<BacklogEntry> = entries.iter().copied().collect();

    let tx = conn.unchecked_transaction()?;
    for entry in &entries {
        ensure_backlog_eligible(&tx, *entry)?;
    }
    tx.execute(
        "INSERT INTO backlog_groups(name, is_open, created_at) VALUES(?, ?, ?)",
        (&name, is_open, Utc::now().to_rfc3339()),
    )?;
    let group_id = tx.last_insert_rowid();
    for entry in &entries {
        insert_membership(&tx, group_id, *entry)?;
    }
    let group = get_group(&tx, group_id)?;
    tx.commit()?;

    info!(group_id, name = %group.name, memberships = entries.len(), "backlog group created");
    Ok(group)
}

/// Adds memberships to an existing group. Pairs already in the group are
/// skipped, so overlapping resubmissions are harmless.
pub fn add_backlog_entries(
    conn: &Connection,
    group_id: i64,
    entries: &[BacklogEntry],
) -> CoreResult<AddEntriesOutcome> {
    let entries: BTreeSet<BacklogEntry> = entries.iter().copied().collect();

    let tx = conn.unchecked_transaction()?;
    get_group(&tx, group_id)?;
    let mut added = 0;
    let mut skipped = 0;
    for entry in entries {
        if find_membership(&tx, group_id, entry.student_id, entry.course_id)?.is_some() {
            skipped += 1;
            continue;
        }
        ensure_backlog_eligible(&tx, entry)?;
        insert_membership(&tx, group_id, entry)?;
        added += 1;
    }
    tx.commit()?;

    info!(group_id, added, skipped, "backlog group entries added");
    Ok(AddEntriesOutcome { added, skipped })
}

pub fn remove_backlog_entry(
    conn: &Connection,
    group_id: i64,
    student_id: i64,
    course_id: i64,
) -> CoreResult<()> {
    let membership = find_membership(conn, group_id, student_id, course_id)?
        .ok_or(CoreError::NotFound("backlog membership"))?;
    if membership.is_registered {
        return Err(CoreError::integrity(
            "cannot remove a backlog course the student has registered for",
        ));
    }
    conn.execute(
        "DELETE FROM backlog_group_courses WHERE group_id = ? AND student_id = ? AND course_id = ?",
        (group_id, student_id, course_id),
    )?;
    info!(group_id, student_id, course_id, "backlog membership removed");
    Ok(())
}

pub fn rename_backlog_group(conn: &Connection, group_id: i64, name: &str) -> CoreResult<BacklogGroup> {
    let name = group_name(name)?;
    let changed = conn.execute(
        "UPDATE backlog_groups SET name = ? WHERE id = ?",
        (&name, group_id),
    )?;
    if changed == 0 {
        return Err(CoreError::NotFound("backlog group"));
    }
    get_group(conn, group_id)
}

pub fn set_backlog_group_open(
    conn: &Connection,
    group_id: i64,
    is_open: bool,
) -> CoreResult<BacklogGroup> {
    let changed = conn.execute(
        "UPDATE backlog_groups SET is_open = ? WHERE id = ?",
        (is_open, group_id),
    )?;
    if changed == 0 {
        return Err(CoreError::NotFound("backlog group"));
    }
    info!(group_id, is_open, "backlog group registration window changed");
    get_group(conn, group_id)
}

/// Deletes the group and its memberships unless any registered membership
/// has already been graded. Returns how many memberships were removed.
pub fn delete_backlog_group(conn: &Connection, group_id: i64) -> CoreResult<usize> {
    let tx = conn.unchecked_transaction()?;
    get_group(&tx, group_id)?;
    let graded: i64 = tx.query_row(
        "SELECT COUNT(*)
         FROM backlog_group_courses bgc
         WHERE bgc.group_id = ?
           AND bgc.is_registered = 1
           AND EXISTS(
             SELECT 1 FROM results r
             WHERE r.is_backlog = 1
               AND r.backlog_group_id = bgc.group_id
               AND r.student_id = bgc.student_id
               AND r.course_id = bgc.course_id
           )",
        [group_id],
        |r| r.get(0),
    )?;
    if graded > 0 {
        return Err(CoreError::integrity(
            "cannot delete a backlog group with graded registrations",
        ));
    }
    let removed = tx.execute(
        "DELETE FROM backlog_group_courses WHERE group_id = ?",
        [group_id],
    )?;
    tx.execute("DELETE FROM backlog_groups WHERE id = ?", [group_id])?;
    tx.commit()?;

    info!(group_id, removed, "backlog group deleted");
    Ok(removed)
}

pub fn list_backlog_groups(conn: &Connection) -> CoreResult<Vec<BacklogGroupSummary>> {
    let mut stmt = conn.prepare(
        "SELECT
           g.id, g.name, g.is_open, g.created_at,
           (SELECT COUNT(*) FROM backlog_group_courses b WHERE b.group_id = g.id) AS course_count,
           (SELECT COUNT(*) FROM backlog_group_courses b
             WHERE b.group_id = g.id AND b.is_registered = 1) AS registered_count,
           (SELECT COUNT(*) FROM results r
             WHERE r.is_backlog = 1 AND r.backlog_group_id = g.id) AS graded_count
         FROM backlog_groups g
         ORDER BY g.created_at DESC, g.id DESC",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(BacklogGroupSummary {
                group: group_from_row(r)?,
                course_count: r.get(4)?,
                registered_count: r.get(5)?,
                graded_count: r.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn backlog_group_detail(conn: &Connection, group_id: i64) -> CoreResult<BacklogGroupDetail> {
    let group = get_group(conn, group_id)?;
    let mut stmt = conn.prepare(
        "SELECT
           b.group_id, b.student_id, b.course_id, b.is_registered, b.registered_at,
           s.roll_no, s.name, c.code, c.name,
           EXISTS(
             SELECT 1 FROM results r
             WHERE r.is_backlog = 1 AND r.backlog_group_id = b.group_id
               AND r.student_id = b.student_id AND r.course_id = b.course_id
           )
         FROM backlog_group_courses b
         JOIN students s ON s.id = b.student_id
         JOIN courses c ON c.id = b.course_id
         WHERE b.group_id = ?
         ORDER BY s.roll_no, c.code",
    )?;
    let memberships = stmt
        .query_map([group_id], |r| {
            Ok(MembershipRow {
                membership: membership_from_row(r)?,
                roll_no: r.get(5)?,
                student_name: r.get(6)?,
                course_code: r.get(7)?,
                course_name: r.get(8)?,
                has_result: r.get::<_, i64>(9)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(BacklogGroupDetail { group, memberships })
}

// ---- memberships ----

fn membership_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Membership> {
    Ok(Membership {
        group_id: r.get(0)?,
        student_id: r.get(1)?,
        course_id: r.get(2)?,
        is_registered: r.get::<_, i64>(3)? != 0,
        registered_at: r.get(4)?,
    })
}

pub fn find_membership(
    conn: &Connection,
    group_id: i64,
    student_id: i64,
    course_id: i64,
) -> CoreResult<Option<Membership>> {
    Ok(conn
        .query_row(
            "SELECT group_id, student_id, course_id, is_registered, registered_at
             FROM backlog_group_courses
             WHERE group_id = ? AND student_id = ? AND course_id = ?",
            (group_id, student_id, course_id),
            membership_from_row,
        )
        .optional()?)
}

pub fn registered_count(conn: &Connection, group_id: i64, student_id: i64) -> CoreResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM backlog_group_courses
         WHERE group_id = ? AND student_id = ? AND is_registered = 1",
        (group_id, student_id),
        |r| r.get(0),
    )?)
}

/// Student opts into a backlog course they were added to. Registering twice
/// is a no-op. The pair must still be failing at the time of registration.
pub fn register_for_backlog_course(
    conn: &Connection,
    group_id: i64,
    student_id: i64,
    course_id: i64,
) -> CoreResult<Membership> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let group = get_group(&tx, group_id)?;
    if !group.is_open {
        return Err(Ineligibility::GroupClosed.into());
    }
    let membership = find_membership(&tx, group_id, student_id, course_id)?
        .ok_or(CoreError::NotFound("backlog membership"))?;
    if membership.is_registered {
        return Ok(membership);
    }
    ensure_backlog_eligible(
        &tx,
        BacklogEntry {
            student_id,
            course_id,
        },
    )?;
    if registered_count(&tx, group_id, student_id)? >= BACKLOG_COURSE_CAP {
        warn!(group_id, student_id, course_id, "backlog registration cap reached");
        return Err(Ineligibility::BacklogCapReached.into());
    }

    tx.execute(
        "UPDATE backlog_group_courses
         SET is_registered = 1, registered_at = ?
         WHERE group_id = ? AND student_id = ? AND course_id = ?",
        (Utc::now().to_rfc3339(), group_id, student_id, course_id),
    )?;
    let updated = find_membership(&tx, group_id, student_id, course_id)?
        .ok_or(CoreError::NotFound("backlog membership"))?;
    tx.commit()?;

    info!(group_id, student_id, course_id, "backlog course registered");
    Ok(updated)
}

/// Withdraws a registration. Locked once a result exists for it.
pub fn unregister_backlog_course(
    conn: &Connection,
    group_id: i64,
    student_id: i64,
    course_id: i64,
) -> CoreResult<Membership> {
    let tx = conn.unchecked_transaction()?;
    let membership = find_membership(&tx, group_id, student_id, course_id)?
        .ok_or(CoreError::NotFound("backlog membership"))?;
    if !membership.is_registered {
        return Ok(membership);
    }
    let graded: Option<i64> = tx
        .query_row(
            "SELECT id FROM results
             WHERE is_backlog = 1 AND backlog_group_id = ? AND student_id = ? AND course_id = ?",
            (group_id, student_id, course_id),
            |r| r.get(0),
        )
        .optional()?;
    if graded.is_some() {
        return Err(CoreError::integrity(
            "cannot unregister a backlog course that already has a result",
        ));
    }

    tx.execute(
        "UPDATE backlog_group_courses
         SET is_registered = 0, registered_at = NULL
         WHERE group_id = ? AND student_id = ? AND course_id = ?",
        (group_id, student_id, course_id),
    )?;
    let updated = find_membership(&tx, group_id, student_id, course_id)?
        .ok_or(CoreError::NotFound("backlog membership"))?;
    tx.commit()?;

    info!(group_id, student_id, course_id, "backlog course unregistered");
    Ok(updated)
}

pub fn student_backlog_memberships(
    conn: &Connection,
    student_id: i64,
) -> CoreResult<Vec<StudentMembership>> {
    records::get_student(conn, student_id)?;
    let mut stmt = conn.prepare(
        "SELECT
           b.group_id, b.student_id, b.course_id, b.is_registered, b.registered_at,
           g.name, g.is_open, c.code, c.name,
           EXISTS(
             SELECT 1 FROM results r
             WHERE r.is_backlog = 1 AND r.backlog_group_id = b.group_id
               AND r.student_id = b.student_id AND r.course_id = b.course_id
           )
         FROM backlog_group_courses b
         JOIN backlog_groups g ON g.id = b.group_id
         JOIN courses c ON c.id = b.course_id
         WHERE b.student_id = ?
         ORDER BY g.id DESC, c.code",
    )?;
    let rows = stmt
        .query_map([student_id], |r| {
            Ok(StudentMembership {
                membership: membership_from_row(r)?,
                group_name: r.get(5)?,
                group_is_open: r.get::<_, i64>(6)? != 0,
                course_code: r.get(7)?,
                course_name: r.get(8)?,
                has_result: r.get::<_, i64>(9)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Registered pairs whose most recent attempt is failing.
pub fn backlog_candidates(
    conn: &Connection,
    filter: &CandidateFilter,
) -> CoreResult<Vec<BacklogCandidate>> {
    let mut stmt = conn.prepare(
        "SELECT
           s.id, s.roll_no, s.name, c.id, c.code, c.name, r.marks,
           (SELECT COUNT(*) FROM results a
             WHERE a.student_id = r.student_id AND a.course_id = r.course_id)
         FROM results r
         JOIN student_courses sc ON sc.student_id = r.student_id AND sc.course_id = r.course_id
         JOIN students s ON s.id = r.student_id
         JOIN courses c ON c.id = r.course_id
         WHERE r.id = (
             SELECT MAX(l.id) FROM results l
             WHERE l.student_id = r.student_id AND l.course_id = r.course_id
           )
           AND r.marks < ?1
           AND (?2 IS NULL OR c.department_id = ?2)
           AND (?3 IS NULL OR c.id = ?3)
         ORDER BY c.code, s.roll_no",
    )?;
    let rows = stmt
        .query_map(
            (grading::PASS_MARK, filter.department_id, filter.course_id),
            |r| {
                Ok(BacklogCandidate {
                    student_id: r.get(0)?,
                    roll_no: r.get(1)?,
                    student_name: r.get(2)?,
                    course_id: r.get(3)?,
                    course_code: r.get(4)?,
                    course_name: r.get(5)?,
                    latest_marks: r.get(6)?,
                    attempts: r.get(7)?,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
