use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_recordsd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn recordsd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn admin() -> serde_json::Value {
    json!({ "role": "admin", "id": 1 })
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
    identity: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
        "identity": identity,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
    identity: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params, identity);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn select_workspace(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, prefix: &str) {
    let workspace = temp_dir(prefix);
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
        serde_json::Value::Null,
    );
}

/// Creates a department, one student, and `courses` registered first-year
/// odd courses (3 credits each). Returns (student_id, course_ids).
fn seed_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    courses: usize,
) -> (i64, Vec<i64>) {
    let dept = request_ok(
        stdin,
        reader,
        "seed-dept",
        "departments.create",
        json!({ "code": "CSE", "name": "Computer Science" }),
        admin(),
    );
    let dept_id = dept["department"]["id"].as_i64().expect("department id");
    let student = request_ok(
        stdin,
        reader,
        "seed-student",
        "students.create",
        json!({ "roll_no": "1903001", "name": "Student One", "department_id": dept_id }),
        admin(),
    );
    let student_id = student["student"]["id"].as_i64().expect("student id");

    let mut course_ids = Vec::new();
    for i in 0..courses {
        let course = request_ok(
            stdin,
            reader,
            &format!("seed-course-{i}"),
            "courses.create",
            json!({
                "code": format!("CSE10{}", i + 1),
                "name": format!("Course {}", i + 1),
                "department_id": dept_id,
                "year": 1,
                "semester": "odd",
                "credits": 3.0,
            }),
            admin(),
        );
        let course_id = course["course"]["id"].as_i64().expect("course id");
        let _ = request_ok(
            stdin,
            reader,
            &format!("seed-reg-{i}"),
            "registrations.create",
            json!({ "student_id": student_id, "course_id": course_id }),
            admin(),
        );
        course_ids.push(course_id);
    }
    (student_id, course_ids)
}

#[test]
fn identity_is_required_and_roles_are_enforced() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, "recordsd-role-access");
    let (student_id, courses) = seed_student(&mut stdin, &mut reader, 1);
    let student = json!({ "role": "student", "id": student_id });
    let other = json!({ "role": "student", "id": student_id + 100 });

    let anonymous = request(
        &mut stdin,
        &mut reader,
        "1",
        "courses.list",
        json!({}),
        serde_json::Value::Null,
    );
    assert_eq!(error_code(&anonymous), "unauthorized");

    let listed = request_ok(&mut stdin, &mut reader, "2", "courses.list", json!({}), student.clone());
    assert_eq!(listed["courses"].as_array().map(|a| a.len()), Some(1));

    let write = request(
        &mut stdin,
        &mut reader,
        "3",
        "results.create",
        json!({ "student_id": student_id, "course_id": courses[0], "marks": 99 }),
        student.clone(),
    );
    assert_eq!(error_code(&write), "forbidden");

    let peek = request(
        &mut stdin,
        &mut reader,
        "4",
        "students.gpa",
        json!({ "student_id": student_id }),
        other.clone(),
    );
    assert_eq!(error_code(&peek), "forbidden");

    let regs = request(
        &mut stdin,
        &mut reader,
        "5",
        "registrations.list",
        json!({ "student_id": student_id }),
        other.clone(),
    );
    assert_eq!(error_code(&regs), "forbidden");

    let own = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "registrations.list",
        json!({ "student_id": student_id }),
        student.clone(),
    );
    assert_eq!(own["registrations"][0]["code"].as_str(), Some("CSE101"));

    let lookup = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "grades.lookup",
        json!({ "marks": 92, "is_backlog": true }),
        student.clone(),
    );
    assert_eq!(lookup["grade"].as_str(), Some("B+"));
    assert_eq!(lookup["gradePoint"].as_f64(), Some(3.25));

    let groups = request(&mut stdin, &mut reader, "8", "backlog.groups.list", json!({}), student.clone());
    assert_eq!(error_code(&groups), "forbidden");

    let _ = child.kill();
}
