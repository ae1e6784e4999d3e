use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::CoreResult;
use crate::ipc::helpers::{identity, params, require_student_access, with_db};
use crate::ipc::types::{AppState, Request};
use crate::views;

#[derive(Deserialize)]
struct StudentViewParams {
    student_id: i64,
    #[serde(default)]
    include_unpublished: bool,
}

/// Students only ever see published results; admins can opt in to the rest.
fn load(req: &Request) -> CoreResult<(i64, bool)> {
    identity(req)?;
    let p: StudentViewParams = params(req)?;
    let who = require_student_access(req, p.student_id)?;
    let published_only = !(who.is_admin() && p.include_unpublished);
    Ok((p.student_id, published_only))
}

fn handle_results(conn: &Connection, req: &Request) -> CoreResult<Value> {
    let (student_id, published_only) = load(req)?;
    let rows = views::student_results(conn, student_id, published_only)?;
    Ok(json!({ "results": rows }))
}

fn handle_gpa(conn: &Connection, req: &Request) -> CoreResult<Value> {
    let (student_id, published_only) = load(req)?;
    let summary = views::student_gpa(conn, student_id, published_only)?;
    Ok(json!(summary))
}

fn handle_transcript(conn: &Connection, req: &Request) -> CoreResult<Value> {
    let (student_id, published_only) = load(req)?;
    let transcript = views::student_transcript(conn, student_id, published_only)?;
    Ok(json!(transcript))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let handler: fn(&Connection, &Request) -> CoreResult<Value> = match req.method.as_str() {
        "students.results" => handle_results,
        "students.gpa" => handle_gpa,
        "students.transcript" => handle_transcript,
        _ => return None,
    };
    Some(with_db(state, req, handler))
}
