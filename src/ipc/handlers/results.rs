use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::backlog::{self, NewResult};
use crate::error::CoreResult;
use crate::grading::{self, GradePolicy};
use crate::ipc::helpers::{identity, params, require_admin, with_db};
use crate::ipc::types::{AppState, Request};
use crate::results::{self, ResultFilter, ResultUpdate};

#[derive(Deserialize)]
struct PairParams {
    student_id: i64,
    course_id: i64,
}

#[derive(Deserialize)]
struct BulkParams {
    results: Vec<NewResult>,
}

#[derive(Deserialize)]
struct UpdateParams {
    id: i64,
    #[serde(flatten)]
    patch: ResultUpdate,
}

#[derive(Deserialize)]
struct IdParams {
    id: i64,
}

#[derive(Deserialize)]
struct PublishParams {
    #[serde(default)]
    ids: Vec<i64>,
    course_id: Option<i64>,
    #[serde(default = "default_published")]
    published: bool,
}

fn default_published() -> bool {
    true
}

#[derive(Deserialize)]
struct LookupParams {
    marks: f64,
    #[serde(default)]
    is_backlog: bool,
}

fn handle_grades_lookup(_conn: &Connection, req: &Request) -> CoreResult<Value> {
    identity(req)?;
    let p: LookupParams = params(req)?;
    let marks = grading::validate_marks(p.marks)?;
    let policy = GradePolicy::for_attempt(p.is_backlog);
    let grade = grading::grade_of(marks, policy);
    Ok(json!({
        "grade": grade.grade,
        "gradePoint": grade.grade_point,
        "policy": policy,
    }))
}

fn handle_results_can_add(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let p: PairParams = params(req)?;
    let check = backlog::can_add_result(conn, p.student_id, p.course_id)?;
    Ok(json!({
        "canAdd": check.can_add(),
        "isBacklog": check.is_backlog(),
        "reason": check.blocked.map(|why| why.to_string()),
        "reasonCode": check.blocked.map(|why| why.reason()),
        "existingResult": check.existing,
    }))
}

fn handle_results_create(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let p: NewResult = params(req)?;
    let result = backlog::create_result(conn, &p)?;
    Ok(json!({ "result": result }))
}

fn handle_results_bulk_create(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let p: BulkParams = params(req)?;
    let outcome = results::create_results_bulk(conn, &p.results);
    Ok(json!(outcome))
}

fn handle_results_update(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let p: UpdateParams = params(req)?;
    let result = results::update_result(conn, p.id, &p.patch)?;
    Ok(json!({ "result": result }))
}

fn handle_results_delete(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let p: IdParams = params(req)?;
    results::delete_result(conn, p.id)?;
    Ok(json!({ "ok": true }))
}

fn handle_results_publish(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let p: PublishParams = params(req)?;
    let updated = results::publish_results(conn, &p.ids, p.course_id, p.published)?;
    Ok(json!({ "updated": updated }))
}

fn handle_results_list(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let filter: ResultFilter = params(req)?;
    let rows = results::list_results(conn, &filter)?;
    Ok(json!({ "results": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let handler: fn(&Connection, &Request) -> CoreResult<Value> = match req.method.as_str() {
        "grades.lookup" => handle_grades_lookup,
        "results.canAdd" => handle_results_can_add,
        "results.create" => handle_results_create,
        "results.bulkCreate" => handle_results_bulk_create,
        "results.update" => handle_results_update,
        "results.delete" => handle_results_delete,
        "results.publish" => handle_results_publish,
        "results.list" => handle_results_list,
        _ => return None,
    };
    Some(with_db(state, req, handler))
}
