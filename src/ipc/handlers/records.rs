use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::CoreResult;
use crate::ipc::helpers::{identity, params, require_admin, require_student_access, with_db};
use crate::ipc::types::{AppState, Request};
use crate::records::{
    self, CourseFilter, CourseUpdate, DepartmentUpdate, NewCourse, NewDepartment, NewStudent,
    StudentUpdate,
};

#[derive(Deserialize)]
struct IdParams {
    id: i64,
}

#[derive(Deserialize)]
struct UpdateParams<P> {
    id: i64,
    #[serde(flatten)]
    patch: P,
}

#[derive(Deserialize)]
struct StudentListParams {
    department_id: Option<i64>,
}

#[derive(Deserialize)]
struct RegistrationParams {
    student_id: i64,
    course_id: i64,
}

#[derive(Deserialize)]
struct StudentParams {
    student_id: i64,
}

fn handle_departments_list(conn: &Connection, req: &Request) -> CoreResult<Value> {
    identity(req)?;
    let departments = records::list_departments(conn)?;
    Ok(json!({ "departments": departments }))
}

fn handle_departments_create(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let p: NewDepartment = params(req)?;
    let department = records::create_department(conn, &p)?;
    Ok(json!({ "department": department }))
}

fn handle_departments_update(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let p: UpdateParams<DepartmentUpdate> = params(req)?;
    let department = records::update_department(conn, p.id, &p.patch)?;
    Ok(json!({ "department": department }))
}

fn handle_departments_delete(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let p: IdParams = params(req)?;
    records::delete_department(conn, p.id)?;
    Ok(json!({ "ok": true }))
}

fn handle_courses_list(conn: &Connection, req: &Request) -> CoreResult<Value> {
    identity(req)?;
    let filter: CourseFilter = params(req)?;
    let courses = records::list_courses(conn, &filter)?;
    Ok(json!({ "courses": courses }))
}

fn handle_courses_create(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let p: NewCourse = params(req)?;
    let course = records::create_course(conn, &p)?;
    Ok(json!({ "course": course }))
}

fn handle_courses_update(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let p: UpdateParams<CourseUpdate> = params(req)?;
    let course = records::update_course(conn, p.id, &p.patch)?;
    Ok(json!({ "course": course }))
}

fn handle_courses_delete(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let p: IdParams = params(req)?;
    records::delete_course(conn, p.id)?;
    Ok(json!({ "ok": true }))
}

fn handle_students_list(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let p: StudentListParams = params(req)?;
    let students = records::list_students(conn, p.department_id)?;
    Ok(json!({ "students": students }))
}

fn handle_students_create(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let p: NewStudent = params(req)?;
    let student = records::create_student(conn, &p)?;
    Ok(json!({ "student": student }))
}

fn handle_students_update(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let p: UpdateParams<StudentUpdate> = params(req)?;
    let student = records::update_student(conn, p.id, &p.patch)?;
    Ok(json!({ "student": student }))
}

fn handle_students_delete(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let p: IdParams = params(req)?;
    records::delete_student(conn, p.id)?;
    Ok(json!({ "ok": true }))
}

fn handle_registrations_list(conn: &Connection, req: &Request) -> CoreResult<Value> {
    identity(req)?;
    let p: StudentParams = params(req)?;
    require_student_access(req, p.student_id)?;
    let registrations = records::list_registrations(conn, p.student_id)?;
    Ok(json!({ "registrations": registrations }))
}

fn handle_registrations_create(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let p: RegistrationParams = params(req)?;
    records::register_course(conn, p.student_id, p.course_id)?;
    Ok(json!({ "ok": true }))
}

fn handle_registrations_delete(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let p: RegistrationParams = params(req)?;
    records::unregister_course(conn, p.student_id, p.course_id)?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let handler: fn(&Connection, &Request) -> CoreResult<Value> = match req.method.as_str() {
        "departments.list" => handle_departments_list,
        "departments.create" => handle_departments_create,
        "departments.update" => handle_departments_update,
        "departments.delete" => handle_departments_delete,
        "courses.list" => handle_courses_list,
        "courses.create" => handle_courses_create,
        "courses.update" => handle_courses_update,
        "courses.delete" => handle_courses_delete,
        "students.list" => handle_students_list,
        "students.create" => handle_students_create,
        "students.update" => handle_students_update,
        "students.delete" => handle_students_delete,
        "registrations.list" => handle_registrations_list,
        "registrations.create" => handle_registrations_create,
        "registrations.delete" => handle_registrations_delete,
        _ => return None,
    };
    Some(with_db(state, req, handler))
}
