use std::collections::BTreeMap;

use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::backlog::{self, BacklogEntry, CandidateFilter};
use crate::error::CoreResult;
use crate::ipc::helpers::{identity, params, require_admin, require_student_access, with_db};
use crate::ipc::types::{AppState, Request};

#[derive(Deserialize)]
struct GroupParams {
    group_id: i64,
}

#[derive(Deserialize)]
struct CreateGroupParams {
    name: String,
    #[serde(default = "default_open")]
    is_open: bool,
    #[serde(default)]
    entries: Vec<BacklogEntry>,
}

fn default_open() -> bool {
    true
}

#[derive(Deserialize)]
struct EntriesParams {
    group_id: i64,
    entries: Vec<BacklogEntry>,
}

#[derive(Deserialize)]
struct MembershipParams {
    group_id: i64,
    student_id: i64,
    course_id: i64,
}

#[derive(Deserialize)]
struct RenameParams {
    group_id: i64,
    name: String,
}

#[derive(Deserialize)]
struct SetOpenParams {
    group_id: i64,
    is_open: bool,
}

#[derive(Deserialize)]
struct StudentParams {
    student_id: i64,
}

fn handle_candidates(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let filter: CandidateFilter = params(req)?;
    let candidates = backlog::backlog_candidates(conn, &filter)?;
    Ok(json!({ "candidates": candidates }))
}

fn handle_groups_list(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let groups = backlog::list_backlog_groups(conn)?;
    Ok(json!({ "groups": groups }))
}

fn handle_groups_get(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let p: GroupParams = params(req)?;
    let detail = backlog::backlog_group_detail(conn, p.group_id)?;
    Ok(json!(detail))
}

fn handle_groups_create(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let p: CreateGroupParams = params(req)?;
    let group = backlog::create_backlog_group(conn, &p.name, p.is_open, &p.entries)?;
    Ok(json!({ "group": group }))
}

fn handle_groups_add_entries(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let p: EntriesParams = params(req)?;
    let outcome = backlog::add_backlog_entries(conn, p.group_id, &p.entries)?;
    Ok(json!(outcome))
}

fn handle_groups_remove_entry(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let p: MembershipParams = params(req)?;
    backlog::remove_backlog_entry(conn, p.group_id, p.student_id, p.course_id)?;
    Ok(json!({ "ok": true }))
}

fn handle_groups_rename(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let p: RenameParams = params(req)?;
    let group = backlog::rename_backlog_group(conn, p.group_id, &p.name)?;
    Ok(json!({ "group": group }))
}

fn handle_groups_set_open(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let p: SetOpenParams = params(req)?;
    let group = backlog::set_backlog_group_open(conn, p.group_id, p.is_open)?;
    Ok(json!({ "group": group }))
}

fn handle_groups_delete(conn: &Connection, req: &Request) -> CoreResult<Value> {
    require_admin(req)?;
    let p: GroupParams = params(req)?;
    let removed = backlog::delete_backlog_group(conn, p.group_id)?;
    Ok(json!({ "ok": true, "membershipsRemoved": removed }))
}

fn handle_register(conn: &Connection, req: &Request) -> CoreResult<Value> {
    identity(req)?;
    let p: MembershipParams = params(req)?;
    require_student_access(req, p.student_id)?;
    let membership =
        backlog::register_for_backlog_course(conn, p.group_id, p.student_id, p.course_id)?;
    Ok(json!({ "membership": membership }))
}

fn handle_unregister(conn: &Connection, req: &Request) -> CoreResult<Value> {
    identity(req)?;
    let p: MembershipParams = params(req)?;
    require_student_access(req, p.student_id)?;
    let membership =
        backlog::unregister_backlog_course(conn, p.group_id, p.student_id, p.course_id)?;
    Ok(json!({ "membership": membership }))
}

fn handle_student(conn: &Connection, req: &Request) -> CoreResult<Value> {
    identity(req)?;
    let p: StudentParams = params(req)?;
    require_student_access(req, p.student_id)?;
    let memberships = backlog::student_backlog_memberships(conn, p.student_id)?;

    // The cap is per group.
    let mut groups: BTreeMap<i64, (String, bool, i64)> = BTreeMap::new();
    for m in &memberships {
        let slot = groups
            .entry(m.membership.group_id)
            .or_insert_with(|| (m.group_name.clone(), m.group_is_open, 0));
        if m.membership.is_registered {
            slot.2 += 1;
        }
    }
    let groups: Vec<Value> = groups
        .into_iter()
        .map(|(group_id, (name, is_open, registered))| {
            json!({
                "groupId": group_id,
                "groupName": name,
                "isOpen": is_open,
                "registered": registered,
                "remaining": (backlog::BACKLOG_COURSE_CAP - registered).max(0),
            })
        })
        .collect();

    Ok(json!({
        "memberships": memberships,
        "groups": groups,
        "cap": backlog::BACKLOG_COURSE_CAP,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let handler: fn(&Connection, &Request) -> CoreResult<Value> = match req.method.as_str() {
        "backlog.candidates" => handle_candidates,
        "backlog.groups.list" => handle_groups_list,
        "backlog.groups.get" => handle_groups_get,
        "backlog.groups.create" => handle_groups_create,
        "backlog.groups.addEntries" => handle_groups_add_entries,
        "backlog.groups.removeEntry" => handle_groups_remove_entry,
        "backlog.groups.rename" => handle_groups_rename,
        "backlog.groups.setOpen" => handle_groups_set_open,
        "backlog.groups.delete" => handle_groups_delete,
        "backlog.register" => handle_register,
        "backlog.unregister" => handle_unregister,
        "backlog.student" => handle_student,
        _ => return None,
    };
    Some(with_db(state, req, handler))
}
