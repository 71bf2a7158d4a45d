use std::time::Instant;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::aggregate::{build_groups, SubmissionRow};
use crate::audit::{self, AuditEntry};
use crate::db;
use crate::ipc::error::{err, fail, ok};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle::{initial_status, percentage, GradeStatus};
use crate::roles::{self, role_allows, ActorContext, Capability};
use crate::validate::{self, GradeDraft, GradeError, DEFAULT_MAX_SCORE};

fn parse_actor(conn: &Connection, req: &Request) -> Result<ActorContext, serde_json::Value> {
    let Some(actor_id) = req.params.get("actorId").and_then(|v| v.as_str()) else {
        return Err(err(&req.id, "bad_params", "missing actorId", None));
    };
    roles::load_actor(conn, actor_id).map_err(|e| fail(&req.id, &e))
}

fn str_param(params: &serde_json::Value, key: &str) -> String {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

/// Insert-or-update against the natural key. The conflict target implements
/// idempotent resubmission: score/percentage/submitter move, status only
/// moves off draft, approval fields are preserved once set.
pub fn upsert_entry(
    conn: &Connection,
    school_id: &str,
    draft: &GradeDraft,
    status: GradeStatus,
    submitted_by: &str,
    approved_by: Option<&str>,
    now_rfc3339: &str,
) -> Result<String, GradeError> {
    let entry_id = Uuid::new_v4().to_string();
    let pct = draft.score.map(|s| percentage(s, draft.max_score));
    let approved_at = approved_by.map(|_| now_rfc3339.to_string());

    db::with_write_retry(|| {
        conn.execute(
            "INSERT INTO grade_entries(
                id, school_id, student_id, subject_id, class_id, term, exam_type,
                score, max_score, percentage, status, submitted_by, submitted_at,
                approved_by, approved_at, released_at, is_released, is_immutable)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, 0, 0)
             ON CONFLICT(student_id, subject_id, class_id, term, exam_type) DO UPDATE SET
               score = excluded.score,
               max_score = excluded.max_score,
               percentage = excluded.percentage,
               submitted_by = excluded.submitted_by,
               submitted_at = excluded.submitted_at,
               status = CASE WHEN grade_entries.status = 'draft'
                             THEN excluded.status ELSE grade_entries.status END,
               approved_by = CASE WHEN grade_entries.status = 'draft'
                                  THEN excluded.approved_by ELSE grade_entries.approved_by END,
               approved_at = CASE WHEN grade_entries.status = 'draft'
                                  THEN excluded.approved_at ELSE grade_entries.approved_at END",
            rusqlite::params![
                entry_id,
                school_id,
                draft.student_id,
                draft.subject_id,
                draft.class_id,
                draft.term,
                draft.exam_type,
                draft.score,
                draft.max_score,
                pct,
                status.as_str(),
                submitted_by,
                now_rfc3339,
                approved_by,
                approved_at,
            ],
        )
    })
    .map_err(|e| GradeError::db("db_insert_failed", e))?;

    conn.query_row(
        "SELECT id FROM grade_entries
         WHERE student_id = ? AND subject_id = ? AND class_id = ? AND term = ? AND exam_type = ?",
        (
            &draft.student_id,
            &draft.subject_id,
            &draft.class_id,
            &draft.term,
            &draft.exam_type,
        ),
        |r| r.get(0),
    )
    .map_err(|e| GradeError::db("db_query_failed", e))
}

fn handle_grades_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let actor = match parse_actor(conn, req) {
        Ok(a) => a,
        Err(resp) => return resp,
    };

    let score = match req.params.get("score") {
        None | Some(serde_json::Value::Null) => None,
        Some(v) => match v.as_f64() {
            Some(n) => Some(n),
            None => return err(&req.id, "bad_params", "score must be a number", None),
        },
    };
    let max_score = match req.params.get("maxScore") {
        None | Some(serde_json::Value::Null) => DEFAULT_MAX_SCORE,
        Some(v) => match v.as_f64() {
            Some(n) => n,
            None => return err(&req.id, "bad_params", "maxScore must be a number", None),
        },
    };
    let as_draft = req
        .params
        .get("asDraft")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let draft = GradeDraft {
        student_id: str_param(&req.params, "studentId"),
        subject_id: str_param(&req.params, "subjectId"),
        class_id: str_param(&req.params, "classId"),
        term: str_param(&req.params, "term"),
        exam_type: str_param(&req.params, "examType"),
        score,
        max_score,
    };

    let (school_id, existing) = match validate::validate_submission(
        conn,
        &mut state.limiter,
        Instant::now(),
        &actor,
        &draft,
    ) {
        Ok(v) => v,
        Err(e) => {
            // Permission and tenancy rejections leave an audit trail.
            if matches!(
                e,
                GradeError::CrossTenant | GradeError::PermissionDenied { .. }
            ) {
                let _ = audit::record(
                    conn,
                    AuditEntry {
                        school_id: actor.school_id.as_deref(),
                        actor_id: &actor.user_id,
                        action: "grades.submit",
                        target_id: None,
                        old_value: None,
                        new_value: None,
                        success: false,
                        metadata: Some(json!({
                            "classId": draft.class_id,
                            "error": e.code(),
                        })),
                    },
                );
            }
            return fail(&req.id, &e);
        }
    };

    // A resubmission keeps the row's current status; only drafts move
    // forward on submit. New rows start per the actor's role.
    let created_status = initial_status(actor.role, as_draft);
    let final_status = match &existing {
        Some(entry) if entry.status != GradeStatus::Draft => entry.status,
        _ => created_status,
    };
    let approves_own = final_status == GradeStatus::Approved
        && existing
            .as_ref()
            .map(|e| e.status == GradeStatus::Draft)
            .unwrap_or(true);
    let approved_by = if approves_own {
        Some(actor.user_id.as_str())
    } else {
        None
    };

    let now = chrono::Utc::now().to_rfc3339();
    let entry_id = match upsert_entry(
        conn,
        &school_id,
        &draft,
        created_status,
        &actor.user_id,
        approved_by,
        &now,
    ) {
        Ok(id) => id,
        Err(e) => return fail(&req.id, &e),
    };

    let pct = draft.score.map(|s| percentage(s, draft.max_score));
    let _ = audit::record(
        conn,
        AuditEntry {
            school_id: Some(&school_id),
            actor_id: &actor.user_id,
            action: "grades.submit",
            target_id: Some(&entry_id),
            old_value: existing.as_ref().map(|e| {
                json!({ "score": e.score, "status": e.status.as_str() })
            }),
            new_value: Some(json!({ "score": draft.score, "status": final_status.as_str() })),
            success: true,
            metadata: existing.as_ref().map(|_| json!({ "resubmission": true })),
        },
    );

    ok(
        &req.id,
        json!({
            "entryId": entry_id,
            "status": final_status.as_str(),
            "score": draft.score,
            "maxScore": draft.max_score,
            "percentage": pct,
            "resubmission": existing.is_some()
        }),
    )
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let actor = match parse_actor(conn, req) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let subject_id = req
        .params
        .get("subjectId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    // Tenant check only; any role inside the school may read its entries.
    let class_school: Option<String> = match conn
        .query_row(
            "SELECT school_id FROM classes WHERE id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(class_school) = class_school else {
        return err(&req.id, "not_found", "class not found", None);
    };
    if !actor.is_platform_admin() && actor.school_id.as_deref() != Some(class_school.as_str()) {
        return fail(&req.id, &GradeError::CrossTenant);
    }

    let (sql, binds): (String, Vec<Value>) = match &subject_id {
        Some(sid) => (
            "SELECT id, student_id, subject_id, term, exam_type, score, max_score, percentage,
                    status, submitted_by, submitted_at, is_released
             FROM grade_entries
             WHERE class_id = ? AND subject_id = ?
             ORDER BY submitted_at DESC, rowid DESC"
                .to_string(),
            vec![Value::Text(class_id.clone()), Value::Text(sid.clone())],
        ),
        None => (
            "SELECT id, student_id, subject_id, term, exam_type, score, max_score, percentage,
                    status, submitted_by, submitted_at, is_released
             FROM grade_entries
             WHERE class_id = ?
             ORDER BY submitted_at DESC, rowid DESC"
                .to_string(),
            vec![Value::Text(class_id.clone())],
        ),
    };

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "subjectId": r.get::<_, String>(2)?,
                "term": r.get::<_, String>(3)?,
                "examType": r.get::<_, String>(4)?,
                "score": r.get::<_, Option<f64>>(5)?,
                "maxScore": r.get::<_, f64>(6)?,
                "percentage": r.get::<_, Option<f64>>(7)?,
                "status": r.get::<_, String>(8)?,
                "submittedBy": r.get::<_, String>(9)?,
                "submittedAt": r.get::<_, Option<String>>(10)?,
                "isReleased": r.get::<_, i64>(11)? != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(entries) => ok(&req.id, json!({ "entries": entries })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Batched display-name lookup. Three separate queries (classes, subjects,
/// users) instead of a join; several foreign keys on a grade row point at
/// the same tables.
fn lookup_names(
    conn: &Connection,
    table: &str,
    ids: &[String],
) -> rusqlite::Result<std::collections::HashMap<String, String>> {
    let mut out = std::collections::HashMap::new();
    if ids.is_empty() {
        return Ok(out);
    }
    let placeholders = std::iter::repeat("?")
        .take(ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!("SELECT id, name FROM {} WHERE id IN ({})", table, placeholders);
    let binds: Vec<Value> = ids.iter().map(|id| Value::Text(id.clone())).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(binds), |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (id, name) = row?;
        out.insert(id, name);
    }
    Ok(out)
}

fn distinct<F>(rows: &[SubmissionRow], f: F) -> Vec<String>
where
    F: Fn(&SubmissionRow) -> &String,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for row in rows {
        let v = f(row);
        if seen.insert(v.clone()) {
            out.push(v.clone());
        }
    }
    out
}

fn handle_grades_submissions(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let actor = match parse_actor(conn, req) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    if !role_allows(actor.role, Capability::ReviewSubmissions) {
        return fail(
            &req.id,
            &GradeError::PermissionDenied {
                message: format!("role {} cannot review submissions", actor.role.as_str()),
            },
        );
    }
    // Platform admins name the school explicitly; everyone else reviews
    // their own.
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

    let mut stmt = match conn.prepare(
        "SELECT class_id, subject_id, term, exam_type, submitted_by, score, status, submitted_at
         FROM grade_entries
         WHERE school_id = ?
           AND status IN ('submitted', 'approved', 'released')
           AND submitted_at IS NOT NULL
         ORDER BY submitted_at DESC, rowid DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows: Vec<SubmissionRow> = match stmt
        .query_map([&school_id], |r| {
            let status_str: String = r.get(6)?;
            Ok(SubmissionRow {
                class_id: r.get(0)?,
                subject_id: r.get(1)?,
                term: r.get(2)?,
                exam_type: r.get(3)?,
                submitted_by: r.get(4)?,
                score: r.get(5)?,
                status: GradeStatus::parse(&status_str).unwrap_or(GradeStatus::Submitted),
                submitted_at: r.get(7)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let class_names = match lookup_names(conn, "classes", &distinct(&rows, |r| &r.class_id)) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let subject_names = match lookup_names(conn, "subjects", &distinct(&rows, |r| &r.subject_id)) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let submitter_names = match lookup_names(conn, "users", &distinct(&rows, |r| &r.submitted_by)) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let groups: Vec<serde_json::Value> = build_groups(&rows)
        .into_iter()
        .map(|g| {
            json!({
                "classId": g.key.class_id,
                "className": class_names.get(&g.key.class_id),
                "subjectId": g.key.subject_id,
                "subjectName": subject_names.get(&g.key.subject_id),
                "term": g.key.term,
                "examType": g.key.exam_type,
                "submittedBy": g.key.submitted_by,
                "submitterName": submitter_names.get(&g.key.submitted_by),
                "status": g.status.as_str(),
                "count": g.count,
                "average": g.average,
                "min": g.min,
                "max": g.max,
                "latestSubmittedAt": g.latest_submitted_at
            })
        })
        .collect();

    ok(&req.id, json!({ "groups": groups }))
}

/// Bulk status transition over one submission group, all-or-nothing. Only
/// rows whose current status legally transitions to `target` are touched;
/// the batch commits in a single transaction.
fn handle_bulk_transition(
    state: &mut AppState,
    req: &Request,
    target: GradeStatus,
    cap: Capability,
    action: &str,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let actor = match parse_actor(conn, req) {
        Ok(a) => a,
        Err(resp) => return resp,
    };

    let class_id = str_param(&req.params, "classId");
    let subject_id = str_param(&req.params, "subjectId");
    let term = str_param(&req.params, "term");
    let exam_type = str_param(&req.params, "examType");
    let submitted_by = str_param(&req.params, "submittedBy");
    for (key, value) in [
        ("classId", &class_id),
        ("subjectId", &subject_id),
        ("term", &term),
        ("examType", &exam_type),
        ("submittedBy", &submitted_by),
    ] {
        if value.is_empty() {
            return err(&req.id, "bad_params", format!("missing {}", key), None);
        }
    }

    let class_school: Option<String> = match conn
        .query_row(
            "SELECT school_id FROM classes WHERE id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(class_school) = class_school else {
        return err(&req.id, "not_found", "class not found", None);
    };

    // Permission gate before anything mutates; a denial is audited and
    // leaves every row untouched.
    let denial = if !role_allows(actor.role, cap) {
        Some(GradeError::PermissionDenied {
            message: format!("role {} cannot perform {}", actor.role.as_str(), action),
        })
    } else if !actor.is_platform_admin()
        && actor.school_id.as_deref() != Some(class_school.as_str())
    {
        Some(GradeError::CrossTenant)
    } else {
        None
    };

    if let Some(e) = denial {
        let _ = audit::record(
            conn,
            AuditEntry {
                school_id: actor.school_id.as_deref(),
                actor_id: &actor.user_id,
                action,
                target_id: None,
                old_value: None,
                new_value: None,
                success: false,
                metadata: Some(json!({
                    "classId": class_id,
                    "subjectId": subject_id,
                    "term": term,
                    "examType": exam_type,
                    "submittedBy": submitted_by,
                    "error": e.code(),
                })),
            },
        );
        return fail(&req.id, &e);
    }

    let mut stmt = match conn.prepare(
        "SELECT id, status FROM grade_entries
         WHERE class_id = ? AND subject_id = ? AND term = ? AND exam_type = ? AND submitted_by = ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let group_rows: Vec<(String, GradeStatus)> = match stmt
        .query_map(
            (&class_id, &subject_id, &term, &exam_type, &submitted_by),
            |r| {
                let status_str: String = r.get(1)?;
                Ok((
                    r.get::<_, String>(0)?,
                    GradeStatus::parse(&status_str).unwrap_or(GradeStatus::Submitted),
                ))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Drafts were withheld from submission and are not part of review;
    // everything else in the group moves if the state machine allows it.
    let eligible: Vec<String> = group_rows
        .iter()
        .filter(|(_, status)| *status != GradeStatus::Draft && status.can_transition(target))
        .map(|(id, _)| id.clone())
        .collect();
    if eligible.is_empty() {
        return err(
            &req.id,
            "not_found",
            format!("no grades eligible for {} in this group", target.as_str()),
            None,
        );
    }

    let now = chrono::Utc::now().to_rfc3339();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let placeholders = std::iter::repeat("?")
        .take(eligible.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = match target {
        GradeStatus::Approved => format!(
            "UPDATE grade_entries SET status = 'approved', approved_by = ?, approved_at = ?
             WHERE id IN ({})",
            placeholders
        ),
        GradeStatus::Released => format!(
            "UPDATE grade_entries
             SET status = 'released', released_at = ?, is_released = 1, is_immutable = 1
             WHERE id IN ({})",
            placeholders
        ),
        _ => return err(&req.id, "bad_params", "unsupported transition target", None),
    };

    let mut binds: Vec<Value> = Vec::with_capacity(eligible.len() + 2);
    if target == GradeStatus::Approved {
        binds.push(Value::Text(actor.user_id.clone()));
    }
    binds.push(Value::Text(now.clone()));
    for id in &eligible {
        binds.push(Value::Text(id.clone()));
    }

    let updated = match db::with_write_retry(|| tx.execute(&sql, params_from_iter(binds.clone()))) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "grade_entries" })),
            );
        }
    };

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    let _ = audit::record(
        conn,
        AuditEntry {
            school_id: actor.school_id.as_deref(),
            actor_id: &actor.user_id,
            action,
            target_id: None,
            old_value: Some(json!({
                "status": match target {
                    GradeStatus::Released => GradeStatus::Approved.as_str(),
                    _ => GradeStatus::Submitted.as_str(),
                }
            })),
            new_value: Some(json!({ "status": target.as_str() })),
            success: true,
            metadata: Some(json!({
                "classId": class_id,
                "subjectId": subject_id,
                "term": term,
                "examType": exam_type,
                "submittedBy": submitted_by,
                "count": updated,
            })),
        },
    );

    match target {
        GradeStatus::Approved => ok(&req.id, json!({ "approved": updated })),
        _ => ok(&req.id, json!({ "released": updated })),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.submit" => Some(handle_grades_submit(state, req)),
        "grades.list" => Some(handle_grades_list(state, req)),
        "grades.submissions" => Some(handle_grades_submissions(state, req)),
        "grades.approve" => Some(handle_bulk_transition(
            state,
            req,
            GradeStatus::Approved,
            Capability::ApproveGrades,
            "grades.approve",
        )),
        "grades.release" => Some(handle_bulk_transition(
            state,
            req,
            GradeStatus::Released,
            Capability::ReleaseGrades,
            "grades.release",
        )),
        _ => None,
    }
}
