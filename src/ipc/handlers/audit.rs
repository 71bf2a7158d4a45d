use serde_json::json;

use crate::audit;
use crate::ipc::error::{err, fail, ok};
use crate::ipc::types::{AppState, Request};
use crate::roles::{self, role_allows, Capability};
use crate::validate::GradeError;

const AUDIT_LIST_DEFAULT_LIMIT: i64 = 50;
const AUDIT_LIST_MAX_LIMIT: i64 = 500;

fn handle_audit_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let Some(actor_id) = req.params.get("actorId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing actorId", None);
    };
    let actor = match roles::load_actor(conn, actor_id) {
        Ok(a) => a,
        Err(e) => return fail(&req.id, &e),
    };
    if !role_allows(actor.role, Capability::ViewAudit) {
        return fail(
            &req.id,
            &GradeError::PermissionDenied {
                message: format!("role {} cannot view the audit log", actor.role.as_str()),
            },
        );
    }

    let school_id = if actor.is_platform_admin() {
        match req.params.get("schoolId").and_then(|v| v.as_str()) {
            Some(v) => v.to_string(),
            None => return err(&req.id, "bad_params", "missing schoolId", None),
        }
    } else {
        match &actor.school_id {
            Some(s) => s.clone(),
            None => return fail(&req.id, &GradeError::NotFound { what: "school" }),
        }
    };

    let limit = req
        .params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(AUDIT_LIST_DEFAULT_LIMIT)
        .clamp(1, AUDIT_LIST_MAX_LIMIT);

    match audit::list_for_school(conn, &school_id, limit) {
        Ok(entries) => ok(&req.id, json!({ "entries": entries })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "audit.list" => Some(handle_audit_list(state, req)),
        _ => None,
    }
}
