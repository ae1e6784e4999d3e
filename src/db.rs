use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "records.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS departments(
            id INTEGER PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id INTEGER PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            department_id INTEGER NOT NULL,
            year INTEGER NOT NULL CHECK(year BETWEEN 1 AND 4),
            semester TEXT NOT NULL CHECK(semester IN ('odd', 'even')),
            credits REAL NOT NULL CHECK(credits > 0),
            cgpa_weight REAL NOT NULL DEFAULT 0 CHECK(cgpa_weight BETWEEN 0 AND 4),
            FOREIGN KEY(department_id) REFERENCES departments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_courses_department ON courses(department_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id INTEGER PRIMARY KEY,
            roll_no TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            department_id INTEGER NOT NULL,
            current_year INTEGER NOT NULL CHECK(current_year BETWEEN 1 AND 4),
            current_semester TEXT NOT NULL CHECK(current_semester IN ('odd', 'even')),
            FOREIGN KEY(department_id) REFERENCES departments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_department ON students(department_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_courses(
            student_id INTEGER NOT NULL,
            course_id INTEGER NOT NULL,
            registered_at TEXT NOT NULL,
            PRIMARY KEY(student_id, course_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_courses_course ON student_courses(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS backlog_groups(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            is_open INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // AUTOINCREMENT keeps result ids monotonic, which is how "most recent
    // result for a pair" is decided.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS results(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            student_id INTEGER NOT NULL,
            course_id INTEGER NOT NULL,
            marks REAL NOT NULL CHECK(marks BETWEEN 0 AND 100),
            published INTEGER NOT NULL DEFAULT 0,
            is_backlog INTEGER NOT NULL DEFAULT 0,
            backlog_group_id INTEGER,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(backlog_group_id) REFERENCES backlog_groups(id)
        )",
        [],
    )?;
    // Workspaces created before backlog support have results without the
    // backlog columns.
    ensure_results_backlog_columns(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_student_course ON results(student_id, course_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_backlog_group ON results(backlog_group_id)",
        [],
    )?;
    // One regular attempt per pair. Backlog attempts are unlimited, one per group.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_results_regular
         ON results(student_id, course_id) WHERE is_backlog = 0",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_results_backlog_group
         ON results(student_id, course_id, backlog_group_id) WHERE is_backlog = 1",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS backlog_group_courses(
            group_id INTEGER NOT NULL,
            student_id INTEGER NOT NULL,
            course_id INTEGER NOT NULL,
            is_registered INTEGER NOT NULL DEFAULT 0,
            registered_at TEXT,
            PRIMARY KEY(group_id, student_id, course_id),
            FOREIGN KEY(group_id) REFERENCES backlog_groups(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_backlog_group_courses_student
         ON backlog_group_courses(student_id, group_id)",
        [],
    )?;

    Ok(())
}

fn ensure_results_backlog_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "results", "is_backlog")? {
        conn.execute(
            "ALTER TABLE results ADD COLUMN is_backlog INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if !table_has_column(conn, "results", "backlog_group_id")? {
        conn.execute(
            "ALTER TABLE results ADD COLUMN backlog_group_id INTEGER REFERENCES backlog_groups(id)",
            [],
        )?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
