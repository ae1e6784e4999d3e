use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::error::{CoreError, CoreResult};
use crate::ipc::error::{core_err, err, ok};
use crate::ipc::types::{AppState, Identity, Request};

/// Deserializes `params` into a typed struct. A missing or null `params`
/// reads as an empty object.
pub fn params<T: DeserializeOwned>(req: &Request) -> CoreResult<T> {
    let raw = if req.params.is_null() {
        json!({})
    } else {
        req.params.clone()
    };
    serde_json::from_value(raw).map_err(|e| CoreError::validation(format!("invalid params: {e}")))
}

pub fn identity(req: &Request) -> CoreResult<Identity> {
    req.identity.ok_or(CoreError::Unauthorized)
}

pub fn require_admin(req: &Request) -> CoreResult<Identity> {
    let who = identity(req)?;
    if !who.is_admin() {
        return Err(CoreError::Forbidden("admin access required"));
    }
    Ok(who)
}

/// Admins may act on any student; a student only on themself.
pub fn require_student_access(req: &Request, student_id: i64) -> CoreResult<Identity> {
    let who = identity(req)?;
    if !who.is_admin() && who.id != student_id {
        return Err(CoreError::Forbidden("not allowed to access another student's records"));
    }
    Ok(who)
}

/// Runs `f` against the open workspace and wraps its outcome as a response.
pub fn with_db<F>(state: &AppState, req: &Request, f: F) -> Value
where
    F: FnOnce(&Connection, &Request) -> CoreResult<Value>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, req) {
        Ok(v) => ok(&req.id, v),
        Err(e) => core_err(&req.id, &e),
    }
}
