//! Departments, courses, students, and course registrations.
//!
//! Everything the grading engine reads about a student or course lives here.
//! Updates go through typed partial-update structs; each `Some` field maps to
//! one fixed column in a parameterised `UPDATE`.

use chrono::Utc;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{map_unique, CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Semester {
    Odd,
    Even,
}

impl Semester {
    pub fn as_str(self) -> &'static str {
        match self {
            Semester::Odd => "odd",
            Semester::Even => "even",
        }
    }
}

impl ToSql for Semester {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Semester {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "odd" => Ok(Semester::Odd),
            "even" => Ok(Semester::Even),
            other => Err(FromSqlError::Other(
                format!("unknown semester: {other}").into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Department {
    pub id: i64,
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewDepartment {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DepartmentUpdate {
    pub code: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Course {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub department_id: i64,
    pub year: i64,
    pub semester: Semester,
    pub credits: f64,
    pub cgpa_weight: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCourse {
    pub code: String,
    pub name: String,
    pub department_id: i64,
    pub year: i64,
    pub semester: Semester,
    pub credits: f64,
    #[serde(default)]
    pub cgpa_weight: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CourseUpdate {
    pub code: Option<String>,
    pub name: Option<String>,
    pub department_id: Option<i64>,
    pub year: Option<i64>,
    pub semester: Option<Semester>,
    pub credits: Option<f64>,
    pub cgpa_weight: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Student {
    pub id: i64,
    pub roll_no: String,
    pub name: String,
    pub department_id: i64,
    pub current_year: i64,
    pub current_semester: Semester,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewStudent {
    pub roll_no: String,
    pub name: String,
    pub department_id: i64,
    #[serde(default = "first_year")]
    pub current_year: i64,
    #[serde(default = "odd_semester")]
    pub current_semester: Semester,
}

fn first_year() -> i64 {
    1
}

fn odd_semester() -> Semester {
    Semester::Odd
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StudentUpdate {
    pub roll_no: Option<String>,
    pub name: Option<String>,
    pub department_id: Option<i64>,
    pub current_year: Option<i64>,
    pub current_semester: Option<Semester>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisteredCourse {
    #[serde(flatten)]
    pub course: Course,
    pub registered_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CourseFilter {
    pub department_id: Option<i64>,
    pub year: Option<i64>,
    pub semester: Option<Semester>,
}

const COURSE_COLUMNS: &str =
    "c.id, c.code, c.name, c.department_id, c.year, c.semester, c.credits, c.cgpa_weight";

const STUDENT_COLUMNS: &str =
    "s.id, s.roll_no, s.name, s.department_id, s.current_year, s.current_semester";

fn course_from_row(r: &Row<'_>) -> rusqlite::Result<Course> {
    Ok(Course {
        id: r.get(0)?,
        code: r.get(1)?,
        name: r.get(2)?,
        department_id: r.get(3)?,
        year: r.get(4)?,
        semester: r.get(5)?,
        credits: r.get(6)?,
        cgpa_weight: r.get(7)?,
    })
}

fn student_from_row(r: &Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: r.get(0)?,
        roll_no: r.get(1)?,
        name: r.get(2)?,
        department_id: r.get(3)?,
        current_year: r.get(4)?,
        current_semester: r.get(5)?,
    })
}

fn required_text(field: &str, value: &str) -> CoreResult<String> {
    let v = value.trim();
    if v.is_empty() {
        return Err(CoreError::validation(format!("{field} must not be empty")));
    }
    Ok(v.to_string())
}

fn validate_year(field: &str, year: i64) -> CoreResult<i64> {
    if !(1..=4).contains(&year) {
        return Err(CoreError::validation(format!("{field} must be between 1 and 4")));
    }
    Ok(year)
}

fn validate_credits(credits: f64) -> CoreResult<f64> {
    if !credits.is_finite() || credits <= 0.0 {
        return Err(CoreError::validation("credits must be greater than 0"));
    }
    Ok(credits)
}

fn validate_cgpa_weight(weight: f64) -> CoreResult<f64> {
    if !weight.is_finite() || !(0.0..=4.0).contains(&weight) {
        return Err(CoreError::validation("cgpa_weight must be between 0 and 4"));
    }
    Ok(weight)
}

fn row_exists(conn: &Connection, sql: &str, id: i64) -> CoreResult<bool> {
    Ok(conn
        .query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

fn count(conn: &Connection, sql: &str, id: i64) -> CoreResult<i64> {
    Ok(conn.query_row(sql, [id], |r| r.get(0))?)
}

pub fn ensure_department(conn: &Connection, id: i64) -> CoreResult<()> {
    if !row_exists(conn, "SELECT 1 FROM departments WHERE id = ?", id)? {
        return Err(CoreError::NotFound("department"));
    }
    Ok(())
}

/// Runs `UPDATE <table> SET ... WHERE id = ?` for the given column/value
/// pairs. Column names always come from the update structs below.
fn apply_update(
    conn: &Connection,
    table: &'static str,
    id: i64,
    assignments: Vec<(&'static str, Value)>,
) -> CoreResult<bool> {
    if assignments.is_empty() {
        return Err(CoreError::validation("nothing to update"));
    }
    let set_clause = assignments
        .iter()
        .map(|(col, _)| format!("{col} = ?"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("UPDATE {table} SET {set_clause} WHERE id = ?");
    let mut values: Vec<Value> = assignments.into_iter().map(|(_, v)| v).collect();
    values.push(Value::Integer(id));
    let changed = conn.execute(&sql, params_from_iter(values))?;
    Ok(changed > 0)
}

impl DepartmentUpdate {
    fn assignments(&self) -> CoreResult<Vec<(&'static str, Value)>> {
        let mut out = Vec::new();
        if let Some(code) = &self.code {
            out.push(("code", Value::Text(required_text("code", code)?)));
        }
        if let Some(name) = &self.name {
            out.push(("name", Value::Text(required_text("name", name)?)));
        }
        Ok(out)
    }
}

impl CourseUpdate {
    fn assignments(&self) -> CoreResult<Vec<(&'static str, Value)>> {
        let mut out = Vec::new();
        if let Some(code) = &self.code {
            out.push(("code", Value::Text(required_text("code", code)?)));
        }
        if let Some(name) = &self.name {
            out.push(("name", Value::Text(required_text("name", name)?)));
        }
        if let Some(id) = self.department_id {
            out.push(("department_id", Value::Integer(id)));
        }
        if let Some(year) = self.year {
            out.push(("year", Value::Integer(validate_year("year", year)?)));
        }
        if let Some(semester) = self.semester {
            out.push(("semester", Value::Text(semester.as_str().to_string())));
        }
        if let Some(credits) = self.credits {
            out.push(("credits", Value::Real(validate_credits(credits)?)));
        }
        if let Some(weight) = self.cgpa_weight {
            out.push(("cgpa_weight", Value::Real(validate_cgpa_weight(weight)?)));
        }
        Ok(out)
    }
}

impl StudentUpdate {
    fn assignments(&self) -> CoreResult<Vec<(&'static str, Value)>> {
        let mut out = Vec::new();
        if let Some(roll) = &self.roll_no {
            out.push(("roll_no", Value::Text(required_text("roll_no", roll)?)));
        }
        if let Some(name) = &self.name {
            out.push(("name", Value::Text(required_text("name", name)?)));
        }
        if let Some(id) = self.department_id {
            out.push(("department_id", Value::Integer(id)));
        }
        if let Some(year) = self.current_year {
            out.push((
                "current_year",
                Value::Integer(validate_year("current_year", year)?),
            ));
        }
        if let Some(semester) = self.current_semester {
            out.push((
                "current_semester",
                Value::Text(semester.as_str().to_string()),
            ));
        }
        Ok(out)
    }
}

// ---- departments ----

pub fn list_departments(conn: &Connection) -> CoreResult<Vec<Department>> {
    let mut stmt = conn.prepare("SELECT id, code, name FROM departments ORDER BY code")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(Department {
                id: r.get(0)?,
                code: r.get(1)?,
                name: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_department(conn: &Connection, id: i64) -> CoreResult<Department> {
    conn.query_row(
        "SELECT id, code, name FROM departments WHERE id = ?",
        [id],
        |r| {
            Ok(Department {
                id: r.get(0)?,
                code: r.get(1)?,
                name: r.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or(CoreError::NotFound("department"))
}

pub fn create_department(conn: &Connection, input: &NewDepartment) -> CoreResult<Department> {
    let code = required_text("code", &input.code)?;
    let name = required_text("name", &input.name)?;
    conn.execute(
        "INSERT INTO departments(code, name) VALUES(?, ?)",
        (&code, &name),
    )
    .map_err(|e| map_unique(e, || CoreError::validation("department code already exists")))?;
    let id = conn.last_insert_rowid();
    info!(department_id = id, %code, "department created");
    Ok(Department { id, code, name })
}

pub fn update_department(
    conn: &Connection,
    id: i64,
    patch: &DepartmentUpdate,
) -> CoreResult<Department> {
    let changed = apply_update(conn, "departments", id, patch.assignments()?)
        .map_err(|e| match e {
            CoreError::Db(db) => {
                map_unique(db, || CoreError::validation("department code already exists"))
            }
            other => other,
        })?;
    if !changed {
        return Err(CoreError::NotFound("department"));
    }
    get_department(conn, id)
}

pub fn delete_department(conn: &Connection, id: i64) -> CoreResult<()> {
    ensure_department(conn, id)?;
    if count(conn, "SELECT COUNT(*) FROM courses WHERE department_id = ?", id)? > 0 {
        return Err(CoreError::integrity("department still has courses"));
    }
    if count(conn, "SELECT COUNT(*) FROM students WHERE department_id = ?", id)? > 0 {
        return Err(CoreError::integrity("department still has students"));
    }
    conn.execute("DELETE FROM departments WHERE id = ?", [id])?;
    info!(department_id = id, "department deleted");
    Ok(())
}

// ---- courses ----

pub fn list_courses(conn: &Connection, filter: &CourseFilter) -> CoreResult<Vec<Course>> {
    let sql = format!(
        "SELECT {COURSE_COLUMNS}
         FROM courses c
         WHERE (?1 IS NULL OR c.department_id = ?1)
           AND (?2 IS NULL OR c.year = ?2)
           AND (?3 IS NULL OR c.semester = ?3)
         ORDER BY c.year, c.semester = 'even', c.code"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            (filter.department_id, filter.year, filter.semester),
            course_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_course(conn: &Connection, id: i64) -> CoreResult<Course> {
    let sql = format!("SELECT {COURSE_COLUMNS} FROM courses c WHERE c.id = ?");
    conn.query_row(&sql, [id], course_from_row)
        .optional()?
        .ok_or(CoreError::NotFound("course"))
}

pub fn create_course(conn: &Connection, input: &NewCourse) -> CoreResult<Course> {
    let code = required_text("code", &input.code)?;
    let name = required_text("name", &input.name)?;
    let year = validate_year("year", input.year)?;
    let credits = validate_credits(input.credits)?;
    let cgpa_weight = validate_cgpa_weight(input.cgpa_weight)?;
    ensure_department(conn, input.department_id)?;

    conn.execute(
        "INSERT INTO courses(code, name, department_id, year, semester, credits, cgpa_weight)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &code,
            &name,
            input.department_id,
            year,
            input.semester,
            credits,
            cgpa_weight,
        ),
    )
    .map_err(|e| map_unique(e, || CoreError::validation("course code already exists")))?;
    let id = conn.last_insert_rowid();
    info!(course_id = id, %code, "course created");
    get_course(conn, id)
}

/// Credits, year and semester are frozen once the course has results.
pub fn update_course(conn: &Connection, id: i64, patch: &CourseUpdate) -> CoreResult<Course> {
    if let Some(dept) = patch.department_id {
        ensure_department(conn, dept)?;
    }
    if patch.credits.is_some() || patch.year.is_some() || patch.semester.is_some() {
        let current = get_course(conn, id)?;
        let moves = patch.credits.is_some_and(|c| c != current.credits)
            || patch.year.is_some_and(|y| y != current.year)
            || patch.semester.is_some_and(|s| s != current.semester);
        if moves && count(conn, "SELECT COUNT(*) FROM results WHERE course_id = ?", id)? > 0 {
            return Err(CoreError::integrity(
                "credits, year and semester cannot change once the course has results",
            ));
        }
    }
    let changed = apply_update(conn, "courses", id, patch.assignments()?).map_err(|e| match e {
        CoreError::Db(db) => map_unique(db, || CoreError::validation("course code already exists")),
        other => other,
    })?;
    if !changed {
        return Err(CoreError::NotFound("course"));
    }
    get_course(conn, id)
}

pub fn delete_course(conn: &Connection, id: i64) -> CoreResult<()> {
    get_course(conn, id)?;
    if count(conn, "SELECT COUNT(*) FROM results WHERE course_id = ?", id)? > 0 {
        return Err(CoreError::integrity("course has results"));
    }
    if count(
        conn,
        "SELECT COUNT(*) FROM student_courses WHERE course_id = ?",
        id,
    )? > 0
    {
        return Err(CoreError::integrity("course has student registrations"));
    }
    conn.execute("DELETE FROM courses WHERE id = ?", [id])?;
    info!(course_id = id, "course deleted");
    Ok(())
}

// ---- students ----

pub fn list_students(conn: &Connection, department_id: Option<i64>) -> CoreResult<Vec<Student>> {
    let sql = format!(
        "SELECT {STUDENT_COLUMNS}
         FROM students s
         WHERE (?1 IS NULL OR s.department_id = ?1)
         ORDER BY s.roll_no"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([department_id], student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_student(conn: &Connection, id: i64) -> CoreResult<Student> {
    let sql = format!("SELECT {STUDENT_COLUMNS} FROM students s WHERE s.id = ?");
    conn.query_row(&sql, [id], student_from_row)
        .optional()?
        .ok_or(CoreError::NotFound("student"))
}

pub fn create_student(conn: &Connection, input: &NewStudent) -> CoreResult<Student> {
    let roll_no = required_text("roll_no", &input.roll_no)?;
    let name = required_text("name", &input.name)?;
    let year = validate_year("current_year", input.current_year)?;
    ensure_department(conn, input.department_id)?;

    conn.execute(
        "INSERT INTO students(roll_no, name, department_id, current_year, current_semester)
         VALUES(?, ?, ?, ?, ?)",
        (
            &roll_no,
            &name,
            input.department_id,
            year,
            input.current_semester,
        ),
    )
    .map_err(|e| map_unique(e, || CoreError::validation("roll_no already exists")))?;
    let id = conn.last_insert_rowid();
    info!(student_id = id, %roll_no, "student created");
    get_student(conn, id)
}

pub fn update_student(conn: &Connection, id: i64, patch: &StudentUpdate) -> CoreResult<Student> {
    if let Some(dept) = patch.department_id {
        ensure_department(conn, dept)?;
    }
    let changed = apply_update(conn, "students", id, patch.assignments()?).map_err(|e| match e {
        CoreError::Db(db) => map_unique(db, || CoreError::validation("roll_no already exists")),
        other => other,
    })?;
    if !changed {
        return Err(CoreError::NotFound("student"));
    }
    get_student(conn, id)
}

/// Removes a student with no grade history. Registrations and unregistered
/// backlog memberships go with it.
pub fn delete_student(conn: &Connection, id: i64) -> CoreResult<()> {
    get_student(conn, id)?;
    if count(conn, "SELECT COUNT(*) FROM results WHERE student_id = ?", id)? > 0 {
        return Err(CoreError::integrity("student has results"));
    }
    if count(
        conn,
        "SELECT COUNT(*) FROM backlog_group_courses WHERE student_id = ? AND is_registered = 1",
        id,
    )? > 0
    {
        return Err(CoreError::integrity(
            "student has registered backlog courses",
        ));
    }

    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM backlog_group_courses WHERE student_id = ?", [id])?;
    tx.execute("DELETE FROM student_courses WHERE student_id = ?", [id])?;
    tx.execute("DELETE FROM students WHERE id = ?", [id])?;
    tx.commit()?;
    info!(student_id = id, "student deleted");
    Ok(())
}

// ---- registrations ----

pub fn is_registered(conn: &Connection, student_id: i64, course_id: i64) -> CoreResult<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM student_courses WHERE student_id = ? AND course_id = ?",
            (student_id, course_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some())
}

pub fn register_course(conn: &Connection, student_id: i64, course_id: i64) -> CoreResult<()> {
    get_student(conn, student_id)?;
    get_course(conn, course_id)?;
    conn.execute(
        "INSERT INTO student_courses(student_id, course_id, registered_at) VALUES(?, ?, ?)",
        (student_id, course_id, Utc::now().to_rfc3339()),
    )
    .map_err(|e| {
        map_unique(e, || {
            CoreError::validation("student is already registered for this course")
        })
    })?;
    info!(student_id, course_id, "course registration created");
    Ok(())
}

pub fn unregister_course(conn: &Connection, student_id: i64, course_id: i64) -> CoreResult<()> {
    if !is_registered(conn, student_id, course_id)? {
        return Err(CoreError::NotFound("registration"));
    }
    let results: i64 = conn.query_row(
        "SELECT COUNT(*) FROM results WHERE student_id = ? AND course_id = ?",
        (student_id, course_id),
        |r| r.get(0),
    )?;
    if results > 0 {
        return Err(CoreError::integrity(
            "cannot remove a registration that has results",
        ));
    }
    conn.execute(
        "DELETE FROM student_courses WHERE student_id = ? AND course_id = ?",
        (student_id, course_id),
    )?;
    info!(student_id, course_id, "course registration removed");
    Ok(())
}

pub fn list_registrations(conn: &Connection, student_id: i64) -> CoreResult<Vec<RegisteredCourse>> {
    get_student(conn, student_id)?;
    let sql = format!(
        "SELECT {COURSE_COLUMNS}, sc.registered_at
         FROM student_courses sc
         JOIN courses c ON c.id = sc.course_id
         WHERE sc.student_id = ?
         ORDER BY c.year, c.semester = 'even', c.code"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([student_id], |r| {
            Ok(RegisteredCourse {
                course: course_from_row(r)?,
                registered_at: r.get(8)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Loads the given courses keyed by id. Missing ids are simply absent.
pub fn courses_by_id(
    conn: &Connection,
    ids: impl IntoIterator<Item = i64>,
) -> CoreResult<std::collections::HashMap<i64, Course>> {
    let sql = format!("SELECT {COURSE_COLUMNS} FROM courses c WHERE c.id = ?");
    let mut stmt = conn.prepare(&sql)?;
    let mut out = std::collections::HashMap::new();
    for id in ids {
        if let Some(course) = stmt.query_row([id], course_from_row).optional()? {
            out.insert(id, course);
        }
    }
    Ok(out)
}
