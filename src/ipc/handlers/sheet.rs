use std::time::Instant;

use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::audit::{self, AuditEntry};
use crate::ipc::error::{err, fail, ok};
use crate::ipc::handlers::grades::upsert_entry;
use crate::ipc::types::{AppState, Request};
use crate::lifecycle::{initial_status, GradeStatus};
use crate::roles;
use crate::sheet::GradeSheet;
use crate::validate::{self, GradeError, DEFAULT_MAX_SCORE};

fn handle_sheet_open(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };
    let term = match req.params.get("term").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing term", None),
    };
    let exam_type = match req.params.get("examType").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing examType", None),
    };
    let max_score = match req.params.get("maxScore") {
        None | Some(serde_json::Value::Null) => DEFAULT_MAX_SCORE,
        Some(v) => match v.as_f64() {
            Some(n) if n > 0.0 => n,
            _ => return err(&req.id, "bad_params", "maxScore must be a positive number", None),
        },
    };

    // Opening is gated the same way the eventual save is, so a teacher
    // can't stage edits for a class they have no business grading.
    let school_id = match validate::check_scope(conn, &actor, &class_id) {
        Ok(s) => s,
        Err(e) => return fail(&req.id, &e),
    };
    let subject_school: Option<String> = match conn
        .query_row(
            "SELECT school_id FROM subjects WHERE id = ?",
            [&subject_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(subject_school) = subject_school else {
        return fail(&req.id, &GradeError::NotFound { what: "subject" });
    };
    if subject_school != school_id {
        return fail(&req.id, &GradeError::CrossTenant);
    }

    let sheet_id = Uuid::new_v4().to_string();
    state.sheets.insert(
        sheet_id.clone(),
        GradeSheet::new(actor_id, &class_id, &subject_id, &term, &exam_type, max_score),
    );

    ok(&req.id, json!({ "sheetId": sheet_id, "maxScore": max_score }))
}

fn handle_sheet_set_score(state: &mut AppState, req: &Request) -> serde_json::Value {
    let sheet_id = match req.params.get("sheetId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sheetId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let Some(sheet) = state.sheets.get_mut(&sheet_id) else {
        return err(&req.id, "not_found", "sheet not found", None);
    };

    // Out-of-range or unparseable input is dropped without an error so the
    // host can forward raw keystrokes; the response says whether the value
    // was taken.
    let value = req.params.get("value").cloned().unwrap_or(serde_json::Value::Null);
    let accepted = sheet.set_score(&student_id, &value);
    let score = sheet.cell(&student_id).and_then(|c| c.score);

    ok(&req.id, json!({ "accepted": accepted, "score": score }))
}

fn handle_sheet_toggle_absent(state: &mut AppState, req: &Request) -> serde_json::Value {
    let sheet_id = match req.params.get("sheetId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sheetId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let Some(sheet) = state.sheets.get_mut(&sheet_id) else {
        return err(&req.id, "not_found", "sheet not found", None);
    };

    let absent = sheet.toggle_absent(&student_id);
    ok(&req.id, json!({ "absent": absent }))
}

fn handle_sheet_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let sheet_id = match req.params.get("sheetId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sheetId", None),
    };
    let Some(sheet) = state.sheets.get(&sheet_id) else {
        return err(&req.id, "not_found", "sheet not found", None);
    };

    // Empty-batch guard fires before any store access.
    let drafts = sheet.drafts();
    if drafts.is_empty() {
        return fail(&req.id, &GradeError::NoGradesToSave);
    }

    let actor = match roles::load_actor(conn, &sheet.actor_id) {
        Ok(a) => a,
        Err(e) => return fail(&req.id, &e),
    };

    // One batched save counts as one submission against the rate window.
    if let Err(retry_after) = state.limiter.check(&actor.user_id, Instant::now()) {
        return fail(
            &req.id,
            &GradeError::RateLimited {
                retry_after_ms: retry_after.as_millis() as u64,
            },
        );
    }

    let school_id = match validate::check_scope(conn, &actor, &sheet.class_id) {
        Ok(s) => s,
        Err(e) => {
            if matches!(
                e,
                GradeError::CrossTenant | GradeError::PermissionDenied { .. }
            ) {
                let _ = audit::record(
                    conn,
                    AuditEntry {
                        school_id: actor.school_id.as_deref(),
                        actor_id: &actor.user_id,
                        action: "sheet.save",
                        target_id: None,
                        old_value: None,
                        new_value: None,
                        success: false,
                        metadata: Some(json!({
                            "classId": sheet.class_id,
                            "error": e.code(),
                        })),
                    },
                );
            }
            return fail(&req.id, &e);
        }
    };

    // Validate the whole batch before writing anything; the save fails as
    // a unit.
    for draft in &drafts {
        if let Err(e) = validate::check_fields(draft)
            .and_then(|()| validate::check_score(draft.score, draft.max_score))
            .and_then(|()| validate::check_student(conn, &draft.class_id, &draft.student_id))
            .and_then(|()| validate::check_existing(conn, draft).map(|_| ()))
        {
            return fail(&req.id, &e);
        }
    }

    let status = initial_status(actor.role, false);
    let approved_by = if status == GradeStatus::Approved {
        Some(actor.user_id.as_str())
    } else {
        None
    };
    let now = chrono::Utc::now().to_rfc3339();

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let mut entry_ids = Vec::with_capacity(drafts.len());
    for draft in &drafts {
        match upsert_entry(&tx, &school_id, draft, status, &actor.user_id, approved_by, &now) {
            Ok(id) => entry_ids.push(id),
            Err(e) => {
                let _ = tx.rollback();
                return fail(&req.id, &e);
            }
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    let _ = audit::record(
        conn,
        AuditEntry {
            school_id: Some(&school_id),
            actor_id: &actor.user_id,
            action: "sheet.save",
            target_id: None,
            old_value: None,
            new_value: Some(json!({ "status": status.as_str() })),
            success: true,
            metadata: Some(json!({
                "classId": sheet.class_id,
                "subjectId": sheet.subject_id,
                "term": sheet.term,
                "examType": sheet.exam_type,
                "count": entry_ids.len(),
            })),
        },
    );

    let saved = entry_ids.len();
    state.sheets.remove(&sheet_id);

    ok(&req.id, json!({ "saved": saved, "entryIds": entry_ids }))
}

fn handle_sheet_discard(state: &mut AppState, req: &Request) -> serde_json::Value {
    let sheet_id = match req.params.get("sheetId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sheetId", None),
    };
    let existed = state.sheets.remove(&sheet_id).is_some();
    ok(&req.id, json!({ "discarded": existed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sheet.open" => Some(handle_sheet_open(state, req)),
        "sheet.setScore" => Some(handle_sheet_set_score(state, req)),
        "sheet.toggleAbsent" => Some(handle_sheet_toggle_absent(state, req)),
        "sheet.save" => Some(handle_sheet_save(state, req)),
        "sheet.discard" => Some(handle_sheet_discard(state, req)),
        _ => None,
    }
}
