use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backlog::{self, NewResult};
use crate::error::{CoreError, CoreResult};
use crate::grading;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRecord {
    pub id: i64,
    pub student_id: i64,
    pub course_id: i64,
    pub marks: f64,
    pub published: bool,
    pub is_backlog: bool,
    pub backlog_group_id: Option<i64>,
    pub created_at: String,
}

pub(crate) const RESULT_COLUMNS: &str =
    "r.id, r.student_id, r.course_id, r.marks, r.published, r.is_backlog, r.backlog_group_id, r.created_at";

pub(crate) fn result_from_row(r: &Row<'_>) -> rusqlite::Result<ResultRecord> {
    Ok(ResultRecord {
        id: r.get(0)?,
        student_id: r.get(1)?,
        course_id: r.get(2)?,
        marks: r.get(3)?,
        published: r.get::<_, i64>(4)? != 0,
        is_backlog: r.get::<_, i64>(5)? != 0,
        backlog_group_id: r.get(6)?,
        created_at: r.get(7)?,
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultFilter {
    pub student_id: Option<i64>,
    pub course_id: Option<i64>,
    pub is_backlog: Option<bool>,
    pub published: Option<bool>,
    pub backlog_group_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultUpdate {
    pub marks: Option<f64>,
    pub published: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkFailure {
    pub index: usize,
    pub student_id: i64,
    pub course_id: i64,
    pub code: &'static str,
    pub reason: Option<&'static str>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkOutcome {
    pub success: usize,
    pub failed: Vec<BulkFailure>,
}

pub fn get_result(conn: &Connection, id: i64) -> CoreResult<ResultRecord> {
    let sql = format!("SELECT {RESULT_COLUMNS} FROM results r WHERE r.id = ?");
    conn.query_row(&sql, [id], result_from_row)
        .optional()?
        .ok_or(CoreError::NotFound("result"))
}

/// Most recently recorded attempt for the pair, regular or backlog.
pub fn latest_result(
    conn: &Connection,
    student_id: i64,
    course_id: i64,
) -> CoreResult<Option<ResultRecord>> {
    let sql = format!(
        "SELECT {RESULT_COLUMNS}
         FROM results r
         WHERE r.student_id = ? AND r.course_id = ?
         ORDER BY r.id DESC
         LIMIT 1"
    );
    Ok(conn
        .query_row(&sql, (student_id, course_id), result_from_row)
        .optional()?)
}

/// Every attempt for a student in insertion order.
pub fn results_for_student(
    conn: &Connection,
    student_id: i64,
    published_only: bool,
) -> CoreResult<Vec<ResultRecord>> {
    let sql = format!(
        "SELECT {RESULT_COLUMNS}
         FROM results r
         WHERE r.student_id = ?1 AND (?2 = 0 OR r.published = 1)
         ORDER BY r.id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((student_id, published_only), result_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_results(conn: &Connection, filter: &ResultFilter) -> CoreResult<Vec<ResultRecord>> {
    let sql = format!(
        "SELECT {RESULT_COLUMNS}
         FROM results r
         WHERE (?1 IS NULL OR r.student_id = ?1)
           AND (?2 IS NULL OR r.course_id = ?2)
           AND (?3 IS NULL OR r.is_backlog = ?3)
           AND (?4 IS NULL OR r.published = ?4)
           AND (?5 IS NULL OR r.backlog_group_id = ?5)
         ORDER BY r.id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            (
                filter.student_id,
                filter.course_id,
                filter.is_backlog,
                filter.published,
                filter.backlog_group_id,
            ),
            result_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Attempts recorded for the pair after `id`.
fn later_attempts(conn: &Connection, current: &ResultRecord) -> CoreResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM results WHERE student_id = ? AND course_id = ? AND id > ?",
        (current.student_id, current.course_id, current.id),
        |r| r.get(0),
    )?)
}

/// Backlog memberships for the pair that have not been graded yet.
fn ungraded_memberships(conn: &Connection, student_id: i64, course_id: i64) -> CoreResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*)
         FROM backlog_group_courses b
         WHERE b.student_id = ?1 AND b.course_id = ?2
           AND NOT EXISTS(
             SELECT 1 FROM results r
             WHERE r.is_backlog = 1 AND r.backlog_group_id = b.group_id
               AND r.student_id = ?1 AND r.course_id = ?2
           )",
        (student_id, course_id),
        |r| r.get(0),
    )?)
}

/// Regrading or (un)publishing one attempt. Only the most recent attempt for
/// a pair can be regraded, and it cannot be regraded to a pass while the pair
/// still sits in a backlog group awaiting a result.
pub fn update_result(conn: &Connection, id: i64, patch: &ResultUpdate) -> CoreResult<ResultRecord> {
    let mut assignments: Vec<(&'static str, Value)> = Vec::new();
    if let Some(m) = patch.marks {
        assignments.push(("marks", Value::Real(grading::validate_marks(m)?)));
    }
    if let Some(p) = patch.published {
        assignments.push(("published", Value::Integer(p as i64)));
    }
    if assignments.is_empty() {
        return Err(CoreError::validation("nothing to update"));
    }

    let tx = conn.unchecked_transaction()?;
    let current = get_result(&tx, id)?;
    if let Some(marks) = patch.marks {
        if later_attempts(&tx, &current)? > 0 {
            return Err(CoreError::integrity(
                "marks are locked once a later attempt exists for this course",
            ));
        }
        if grading::is_pass(marks)
            && ungraded_memberships(&tx, current.student_id, current.course_id)? > 0
        {
            return Err(CoreError::integrity(
                "remove the course from its backlog groups before regrading it to a pass",
            ));
        }
    }

    let set_clause = assignments
        .iter()
        .map(|(col, _)| format!("{col} = ?"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut values: Vec<Value> = assignments.into_iter().map(|(_, v)| v).collect();
    values.push(Value::Integer(id));
    tx.execute(
        &format!("UPDATE results SET {set_clause} WHERE id = ?"),
        params_from_iter(values),
    )?;
    let updated = get_result(&tx, id)?;
    tx.commit()?;

    info!(
        result_id = id,
        marks = updated.marks,
        published = updated.published,
        "result updated"
    );
    Ok(updated)
}

pub fn delete_result(conn: &Connection, id: i64) -> CoreResult<()> {
    let tx = conn.unchecked_transaction()?;
    let current = get_result(&tx, id)?;
    if later_attempts(&tx, &current)? > 0 {
        return Err(CoreError::integrity(
            "cannot delete a result that has later attempts",
        ));
    }
    tx.execute("DELETE FROM results WHERE id = ?", [id])?;
    tx.commit()?;
    info!(
        result_id = id,
        student_id = current.student_id,
        course_id = current.course_id,
        "result deleted"
    );
    Ok(())
}

/// Sets `published` on the listed results and/or every result of a course.
pub fn publish_results(
    conn: &Connection,
    ids: &[i64],
    course_id: Option<i64>,
    published: bool,
) -> CoreResult<usize> {
    if ids.is_empty() && course_id.is_none() {
        return Err(CoreError::validation("provide ids or course_id"));
    }
    let tx = conn.unchecked_transaction()?;
    let mut updated = 0;
    for id in ids {
        let n = tx.execute(
            "UPDATE results SET published = ? WHERE id = ?",
            (published, id),
        )?;
        if n == 0 {
            return Err(CoreError::NotFound("result"));
        }
        updated += n;
    }
    if let Some(course_id) = course_id {
        updated += tx.execute(
            "UPDATE results SET published = ? WHERE course_id = ? AND published <> ?",
            (published, course_id, published),
        )?;
    }
    tx.commit()?;
    info!(updated, published, "results publish state changed");
    Ok(updated)
}

/// Records each row in its own transaction; one bad row does not stop the rest.
pub fn create_results_bulk(conn: &Connection, rows: &[NewResult]) -> BulkOutcome {
    let mut success = 0;
    let mut failed = Vec::new();
    for (index, row) in rows.iter().enumerate() {
        match backlog::create_result(conn, row) {
            Ok(_) => success += 1,
            Err(e) => failed.push(BulkFailure {
                index,
                student_id: row.student_id,
                course_id: row.course_id,
                code: e.code(),
                reason: e.ineligibility().map(|why| why.reason()),
                message: e.to_string(),
            }),
        }
    }
    if !failed.is_empty() {
        warn!(success, failed = failed.len(), "bulk result entry had rejected rows");
    }
    BulkOutcome { success, failed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::BacklogEntry;
    use crate::db;
    use crate::records::{self, NewCourse, NewDepartment, NewStudent, Semester};

    fn setup() -> (Connection, i64, i64) {
        let conn = Connection::open_in_memory().expect("open");
        db::init_schema(&conn).expect("schema");
        let dept = records::create_department(
            &conn,
            &NewDepartment {
                code: "EEE".into(),
                name: "Electrical".into(),
            },
        )
        .expect("dept");
        let course = records::create_course(
            &conn,
            &NewCourse {
                code: "EEE101".into(),
                name: "Circuits".into(),
                department_id: dept.id,
                year: 1,
                semester: Semester::Odd,
                credits: 3.0,
                cgpa_weight: 0.0,
            },
        )
        .expect("course");
        let student = records::create_student(
            &conn,
            &NewStudent {
                roll_no: "2001001".into(),
                name: "Student".into(),
                department_id: dept.id,
                current_year: 1,
                current_semester: Semester::Odd,
            },
        )
        .expect("student");
        records::register_course(&conn, student.id, course.id).expect("register");
        (conn, student.id, course.id)
    }

    fn new_result(student_id: i64, course_id: i64, marks: f64) -> NewResult {
        NewResult {
            student_id,
            course_id,
            marks,
            published: false,
            backlog_group_id: None,
            is_backlog: None,
        }
    }

    fn with_backlog_attempt(conn: &Connection, s: i64, c: i64) -> ResultRecord {
        let regular = backlog::create_result(conn, &new_result(s, c, 30.0)).expect("regular");
        let group = backlog::create_backlog_group(
            conn,
            "G1",
            true,
            &[BacklogEntry {
                student_id: s,
                course_id: c,
            }],
        )
        .expect("group");
        backlog::register_for_backlog_course(conn, group.id, s, c).expect("register");
        backlog::create_result(
            conn,
            &NewResult {
                backlog_group_id: Some(group.id),
                ..new_result(s, c, 50.0)
            },
        )
        .expect("backlog");
        regular
    }

    #[test]
    fn regular_marks_locked_after_backlog_attempt() {
        let (conn, s, c) = setup();
        let regular = with_backlog_attempt(&conn, s, c);

        let err = update_result(
            &conn,
            regular.id,
            &ResultUpdate {
                marks: Some(45.0),
                published: None,
            },
        )
        .expect_err("locked");
        assert_eq!(err.code(), "integrity_violation");
        assert_eq!(get_result(&conn, regular.id).expect("get").marks, 30.0);

        // Publishing is still allowed.
        let updated = update_result(
            &conn,
            regular.id,
            &ResultUpdate {
                marks: None,
                published: Some(true),
            },
        )
        .expect("publish");
        assert!(updated.published);

        let err = delete_result(&conn, regular.id).expect_err("delete locked");
        assert_eq!(err.code(), "integrity_violation");
    }

    #[test]
    fn update_revalidates_marks() {
        let (conn, s, c) = setup();
        let r = backlog::create_result(&conn, &new_result(s, c, 30.0)).expect("create");
        let err = update_result(
            &conn,
            r.id,
            &ResultUpdate {
                marks: Some(-1.0),
                published: None,
            },
        )
        .expect_err("range");
        assert_eq!(err.code(), "bad_params");
        let err = update_result(&conn, r.id, &ResultUpdate::default()).expect_err("empty");
        assert_eq!(err.code(), "bad_params");
    }

    #[test]
    fn publish_by_course_counts_changed_rows() {
        let (conn, s, c) = setup();
        let r = backlog::create_result(&conn, &new_result(s, c, 70.0)).expect("create");
        assert_eq!(publish_results(&conn, &[], Some(c), true).expect("publish"), 1);
        assert_eq!(publish_results(&conn, &[], Some(c), true).expect("again"), 0);
        assert!(get_result(&conn, r.id).expect("get").published);

        let err = publish_results(&conn, &[], None, true).expect_err("nothing selected");
        assert_eq!(err.code(), "bad_params");
        let err = publish_results(&conn, &[9999], None, true).expect_err("unknown id");
        assert!(matches!(err, CoreError::NotFound("result")));
    }

    #[test]
    fn bulk_create_keeps_good_rows() {
        let (conn, s, c) = setup();
        let outcome = create_results_bulk(
            &conn,
            &[
                new_result(s, c, 88.0),
                new_result(s, c, 90.0),
                new_result(s, 9999, 50.0),
                new_result(s, c, 120.0),
            ],
        );
        assert_eq!(outcome.success, 1);
        let codes: Vec<(usize, &str, Option<&str>)> = outcome
            .failed
            .iter()
            .map(|f| (f.index, f.code, f.reason))
            .collect();
        assert_eq!(
            codes,
            vec![
                (1, "not_eligible", Some("already_passed")),
                (2, "not_eligible", Some("not_registered")),
                (3, "bad_params", None),
            ]
        );
        assert_eq!(list_results(&conn, &ResultFilter::default()).expect("list").len(), 1);
    }

    fn backlog_attempt(conn: &Connection, s: i64, c: i64, name: &str, marks: f64) -> ResultRecord {
        let group = backlog::create_backlog_group(
            conn,
            name,
            true,
            &[BacklogEntry {
                student_id: s,
                course_id: c,
            }],
        )
        .expect("group");
        backlog::register_for_backlog_course(conn, group.id, s, c).expect("register");
        backlog::create_result(
            conn,
            &NewResult {
                backlog_group_id: Some(group.id),
                ..new_result(s, c, marks)
            },
        )
        .expect("backlog")
    }

    #[test]
    fn only_latest_attempt_can_be_regraded() {
        let (conn, s, c) = setup();
        backlog::create_result(&conn, &new_result(s, c, 30.0)).expect("regular");
        let first = backlog_attempt(&conn, s, c, "G1", 25.0);
        let second = backlog_attempt(&conn, s, c, "G2", 20.0);

        let err = update_result(
            &conn,
            first.id,
            &ResultUpdate {
                marks: Some(70.0),
                published: None,
            },
        )
        .expect_err("superseded attempt");
        assert_eq!(err.code(), "integrity_violation");
        assert_eq!(get_result(&conn, first.id).expect("get").marks, 25.0);
        let err = delete_result(&conn, first.id).expect_err("superseded delete");
        assert_eq!(err.code(), "integrity_violation");

        // Regrading the latest attempt to a pass closes the course.
        update_result(
            &conn,
            second.id,
            &ResultUpdate {
                marks: Some(70.0),
                published: None,
            },
        )
        .expect("latest attempt");
        let check = backlog::can_add_result(&conn, s, c).expect("check");
        assert_eq!(check.blocked, Some(crate::error::Ineligibility::AlreadyPassed));
        let err = backlog::create_backlog_group(
            &conn,
            "G3",
            true,
            &[BacklogEntry {
                student_id: s,
                course_id: c,
            }],
        )
        .expect_err("cleared course");
        assert_eq!(err.code(), "not_eligible");
    }

    #[test]
    fn passing_regrade_blocked_while_awaiting_backlog() {
        let (conn, s, c) = setup();
        let regular = backlog::create_result(&conn, &new_result(s, c, 35.0)).expect("regular");
        let group = backlog::create_backlog_group(
            &conn,
            "G1",
            true,
            &[BacklogEntry {
                student_id: s,
                course_id: c,
            }],
        )
        .expect("group");

        let err = update_result(
            &conn,
            regular.id,
            &ResultUpdate {
                marks: Some(85.0),
                published: None,
            },
        )
        .expect_err("pending membership");
        assert_eq!(err.code(), "integrity_violation");

        // A failing correction is still fine.
        update_result(
            &conn,
            regular.id,
            &ResultUpdate {
                marks: Some(38.0),
                published: None,
            },
        )
        .expect("failing regrade");

        backlog::remove_backlog_entry(&conn, group.id, s, c).expect("remove");
        let updated = update_result(
            &conn,
            regular.id,
            &ResultUpdate {
                marks: Some(85.0),
                published: None,
            },
        )
        .expect("no memberships left");
        assert_eq!(updated.marks, 85.0);
    }
}
