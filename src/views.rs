//! Read models built from effective results: per-course rows, semester GPA,
//! and the transcript.

use rusqlite::Connection;
use serde::Serialize;

use crate::effective::{self, EffectiveResult, ResultSource, ResultStatus};
use crate::error::CoreResult;
use crate::grading::{self, GpaEntry, GradePolicy};
use crate::records::{self, Course, Semester, Student};
use crate::results;

#[derive(Debug, Clone, Serialize)]
pub struct CourseResultRow {
    pub result_id: i64,
    pub course_id: i64,
    pub course_code: String,
    pub course_name: String,
    pub year: i64,
    pub semester: Semester,
    pub credits: f64,
    pub marks: f64,
    pub grade: &'static str,
    #[serde(rename = "gradePoint")]
    pub grade_point: f64,
    pub policy: GradePolicy,
    pub source: ResultSource,
    pub status: ResultStatus,
    pub attempts: usize,
    pub published: bool,
    pub backlog_group_id: Option<i64>,
}

impl CourseResultRow {
    fn new(course: &Course, eff: &EffectiveResult) -> Self {
        let grade = eff.grade();
        CourseResultRow {
            result_id: eff.result.id,
            course_id: course.id,
            course_code: course.code.clone(),
            course_name: course.name.clone(),
            year: course.year,
            semester: course.semester,
            credits: course.credits,
            marks: eff.result.marks,
            grade: grade.grade,
            grade_point: grade.grade_point,
            policy: eff.policy(),
            source: eff.source,
            status: eff.status,
            attempts: eff.attempts,
            published: eff.result.published,
            backlog_group_id: eff.result.backlog_group_id,
        }
    }

    fn gpa_entry(&self) -> GpaEntry {
        GpaEntry {
            marks: self.marks,
            credits: self.credits,
            is_backlog: self.source == ResultSource::Backlog,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SemesterGpa {
    pub year: i64,
    pub semester: Semester,
    pub sgpa: f64,
    pub credits_attempted: f64,
    pub credits_earned: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GpaSummary {
    pub sgpas: Vec<SemesterGpa>,
    pub cgpa: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptSemester {
    #[serde(flatten)]
    pub gpa: SemesterGpa,
    pub courses: Vec<CourseResultRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Transcript {
    pub student: Student,
    pub semesters: Vec<TranscriptSemester>,
    pub credits_attempted: f64,
    pub credits_earned: f64,
    pub cgpa: f64,
}

/// Effective result per course, ordered by year, semester, course code.
pub fn student_results(
    conn: &Connection,
    student_id: i64,
    published_only: bool,
) -> CoreResult<Vec<CourseResultRow>> {
    records::get_student(conn, student_id)?;
    let all = results::results_for_student(conn, student_id, published_only)?;
    let resolved = effective::resolve(all);
    let courses = records::courses_by_id(conn, resolved.keys().copied())?;

    let mut rows: Vec<CourseResultRow> = resolved
        .values()
        .filter_map(|eff| {
            courses
                .get(&eff.result.course_id)
                .map(|course| CourseResultRow::new(course, eff))
        })
        .collect();
    rows.sort_by(|a, b| {
        (a.year, a.semester, &a.course_code).cmp(&(b.year, b.semester, &b.course_code))
    });
    Ok(rows)
}

/// Groups rows (already sorted by [`student_results`]) into semesters and
/// computes each semester's GPA.
pub fn semester_breakdown(rows: &[CourseResultRow]) -> Vec<SemesterGpa> {
    let mut out: Vec<SemesterGpa> = Vec::new();
    for chunk in rows.chunk_by(|a, b| (a.year, a.semester) == (b.year, b.semester)) {
        let first = &chunk[0];
        let sgpa = grading::semester_gpa(chunk.iter().map(CourseResultRow::gpa_entry));
        out.push(SemesterGpa {
            year: first.year,
            semester: first.semester,
            sgpa,
            credits_attempted: chunk.iter().map(|r| r.credits).sum(),
            credits_earned: chunk
                .iter()
                .filter(|r| grading::is_pass(r.marks))
                .map(|r| r.credits)
                .sum(),
        });
    }
    out
}

fn cgpa_of(sgpas: &[SemesterGpa]) -> f64 {
    let values: Vec<f64> = sgpas.iter().map(|s| s.sgpa).collect();
    grading::overall_cgpa(&values)
}

pub fn student_gpa(conn: &Connection, student_id: i64, published_only: bool) -> CoreResult<GpaSummary> {
    let rows = student_results(conn, student_id, published_only)?;
    let sgpas = semester_breakdown(&rows);
    let cgpa = cgpa_of(&sgpas);
    Ok(GpaSummary { sgpas, cgpa })
}

pub fn student_transcript(
    conn: &Connection,
    student_id: i64,
    published_only: bool,
) -> CoreResult<Transcript> {
    let student = records::get_student(conn, student_id)?;
    let rows = student_results(conn, student_id, published_only)?;
    let sgpas = semester_breakdown(&rows);
    let cgpa = cgpa_of(&sgpas);

    let mut semesters = Vec::with_capacity(sgpas.len());
    for gpa in sgpas {
        let courses = rows
            .iter()
            .filter(|r| r.year == gpa.year && r.semester == gpa.semester)
            .cloned()
            .collect();
        semesters.push(TranscriptSemester { gpa, courses });
    }
    let credits_attempted = semesters.iter().map(|s| s.gpa.credits_attempted).sum();
    let credits_earned = semesters.iter().map(|s| s.gpa.credits_earned).sum();

    Ok(Transcript {
        student,
        semesters,
        credits_attempted,
        credits_earned,
        cgpa,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::{self, BacklogEntry, NewResult};
    use crate::db;
    use crate::records::{NewCourse, NewDepartment, NewStudent};

    struct Seed {
        conn: Connection,
        student_id: i64,
    }

    fn seed() -> Seed {
        let conn = Connection::open_in_memory().expect("open");
        db::init_schema(&conn).expect("schema");
        let dept = records::create_department(
            &conn,
            &NewDepartment {
                code: "CSE".into(),
                name: "Computer Science".into(),
            },
        )
        .expect("dept");
        let student = records::create_student(
            &conn,
            &NewStudent {
                roll_no: "1903001".into(),
                name: "Student One".into(),
                department_id: dept.id,
                current_year: 1,
                current_semester: Semester::Even,
            },
        )
        .expect("student");
        Seed {
            conn,
            student_id: student.id,
        }
    }

    fn course(s: &Seed, code: &str, year: i64, semester: Semester, credits: f64) -> i64 {
        let dept = records::list_departments(&s.conn).expect("depts")[0].id;
        let c = records::create_course(
            &s.conn,
            &NewCourse {
                code: code.into(),
                name: format!("{code} course"),
                department_id: dept,
                year,
                semester,
                credits,
                cgpa_weight: 0.0,
            },
        )
        .expect("course");
        records::register_course(&s.conn, s.student_id, c.id).expect("register");
        c.id
    }

    fn mark(s: &Seed, course_id: i64, marks: f64, published: bool, group: Option<i64>) {
        backlog::create_result(
            &s.conn,
            &NewResult {
                student_id: s.student_id,
                course_id,
                marks,
                published,
                backlog_group_id: group,
                is_backlog: group.map(|_| true),
            },
        )
        .expect("result");
    }

    #[test]
    fn single_backlog_clearance_gives_capped_sgpa() {
        let s = seed();
        let c = course(&s, "CSE101", 1, Semester::Odd, 3.0);
        mark(&s, c, 35.0, true, None);
        let group = backlog::create_backlog_group(
            &s.conn,
            "G1",
            true,
            &[BacklogEntry {
                student_id: s.student_id,
                course_id: c,
            }],
        )
        .expect("group");
        backlog::register_for_backlog_course(&s.conn, group.id, s.student_id, c).expect("register");
        mark(&s, c, 55.0, true, Some(group.id));

        let gpa = student_gpa(&s.conn, s.student_id, true).expect("gpa");
        assert_eq!(gpa.sgpas.len(), 1);
        assert_eq!(gpa.sgpas[0].sgpa, 2.75);
        assert_eq!(gpa.cgpa, 2.75);

        let rows = student_results(&s.conn, s.student_id, true).expect("rows");
        assert_eq!(rows[0].grade, "B-");
        assert_eq!(rows[0].status, ResultStatus::Cleared);
        assert_eq!(rows[0].attempts, 2);
    }

    #[test]
    fn semesters_are_ordered_and_averaged_unweighted() {
        let s = seed();
        let even = course(&s, "CSE102", 1, Semester::Even, 4.0);
        let odd_a = course(&s, "CSE101", 1, Semester::Odd, 3.0);
        let odd_b = course(&s, "MATH101", 1, Semester::Odd, 1.0);
        mark(&s, even, 85.0, true, None);
        mark(&s, odd_a, 62.0, true, None);
        mark(&s, odd_b, 12.0, true, None);

        let gpa = student_gpa(&s.conn, s.student_id, true).expect("gpa");
        let keys: Vec<(i64, Semester)> = gpa.sgpas.iter().map(|g| (g.year, g.semester)).collect();
        assert_eq!(keys, vec![(1, Semester::Odd), (1, Semester::Even)]);
        // The failed MATH101 drops out of the odd semester entirely.
        assert_eq!(gpa.sgpas[0].sgpa, 3.0);
        assert_eq!(gpa.sgpas[0].credits_attempted, 4.0);
        assert_eq!(gpa.sgpas[0].credits_earned, 3.0);
        assert_eq!(gpa.sgpas[1].sgpa, 4.0);
        assert_eq!(gpa.cgpa, 3.5);
    }

    #[test]
    fn unpublished_results_hidden_from_published_view() {
        let s = seed();
        let a = course(&s, "CSE101", 1, Semester::Odd, 3.0);
        let b = course(&s, "CSE103", 1, Semester::Odd, 3.0);
        mark(&s, a, 70.0, true, None);
        mark(&s, b, 90.0, false, None);

        assert_eq!(student_results(&s.conn, s.student_id, true).expect("rows").len(), 1);
        assert_eq!(student_results(&s.conn, s.student_id, false).expect("rows").len(), 2);
    }

    #[test]
    fn transcript_totals_match_semesters() {
        let s = seed();
        let a = course(&s, "CSE101", 1, Semester::Odd, 3.0);
        let b = course(&s, "CSE102", 1, Semester::Even, 3.0);
        mark(&s, a, 75.0, true, None);
        mark(&s, b, 20.0, true, None);

        let t = student_transcript(&s.conn, s.student_id, true).expect("transcript");
        assert_eq!(t.student.roll_no, "1903001");
        assert_eq!(t.semesters.len(), 2);
        assert_eq!(t.semesters[1].courses[0].status, ResultStatus::Failed);
        assert_eq!(t.credits_attempted, 6.0);
        assert_eq!(t.credits_earned, 3.0);
        // Odd 3.75, even 0.00 with no passed credits.
        assert_eq!(t.cgpa, 1.88);
    }
}
