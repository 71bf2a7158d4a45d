use std::time::Instant;

use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::lifecycle::GradeStatus;
use crate::ratelimit::SubmissionLimiter;
use crate::roles::{role_allows, ActorContext, Capability, Role};

pub const DEFAULT_MAX_SCORE: f64 = 100.0;

/// Domain failure taxonomy. Every variant maps to a stable protocol code;
/// callers branch on the tagged value rather than unwinding.
#[derive(Debug)]
pub enum GradeError {
    MissingField { field: &'static str },
    InvalidScore { message: String },
    RateLimited { retry_after_ms: u64 },
    CrossTenant,
    PermissionDenied { message: String },
    StudentClassMismatch,
    ImmutableRecord,
    NoGradesToSave,
    NotFound { what: &'static str },
    Db { code: &'static str, message: String },
}

impl GradeError {
    pub fn db(code: &'static str, e: rusqlite::Error) -> GradeError {
        GradeError::Db {
            code,
            message: e.to_string(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GradeError::MissingField { .. } => "missing_field",
            GradeError::InvalidScore { .. } => "invalid_score",
            GradeError::RateLimited { .. } => "rate_limited",
            GradeError::CrossTenant => "cross_tenant",
            GradeError::PermissionDenied { .. } => "permission_denied",
            GradeError::StudentClassMismatch => "student_class_mismatch",
            GradeError::ImmutableRecord => "immutable_record",
            GradeError::NoGradesToSave => "no_grades_to_save",
            GradeError::NotFound { .. } => "not_found",
            GradeError::Db { code, .. } => code,
        }
    }

    pub fn message(&self) -> String {
        match self {
            GradeError::MissingField { field } => format!("missing required field: {}", field),
            GradeError::InvalidScore { message } => message.clone(),
            GradeError::RateLimited { retry_after_ms } => format!(
                "submission rate limit reached; retry after {} ms",
                retry_after_ms
            ),
            GradeError::CrossTenant => "class belongs to a different school".to_string(),
            GradeError::PermissionDenied { message } => message.clone(),
            GradeError::StudentClassMismatch => {
                "student is not enrolled in the referenced class".to_string()
            }
            GradeError::ImmutableRecord => "grade has been released and is read-only".to_string(),
            GradeError::NoGradesToSave => "no grades to save".to_string(),
            GradeError::NotFound { what } => format!("{} not found", what),
            GradeError::Db { message, .. } => message.clone(),
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            GradeError::RateLimited { retry_after_ms } => {
                Some(json!({ "retryAfterMs": retry_after_ms }))
            }
            _ => None,
        }
    }
}

/// Candidate grade payload, as assembled by a handler from request params.
#[derive(Debug, Clone)]
pub struct GradeDraft {
    pub student_id: String,
    pub subject_id: String,
    pub class_id: String,
    pub term: String,
    pub exam_type: String,
    pub score: Option<f64>,
    pub max_score: f64,
}

/// Existing row state at the natural key, needed for the immutability check
/// and the audit old-value.
#[derive(Debug, Clone)]
pub struct ExistingEntry {
    pub score: Option<f64>,
    pub status: GradeStatus,
}

/// Rule 1 + 3: required identity and context fields.
pub fn check_fields(draft: &GradeDraft) -> Result<(), GradeError> {
    if draft.student_id.trim().is_empty() {
        return Err(GradeError::MissingField {
            field: "studentId",
        });
    }
    if draft.subject_id.trim().is_empty() {
        return Err(GradeError::MissingField {
            field: "subjectId",
        });
    }
    if draft.class_id.trim().is_empty() {
        return Err(GradeError::MissingField { field: "classId" });
    }
    Ok(())
}

/// Rule 2: when a score is present it must be a finite number inside
/// [0, max_score]; max_score itself must be positive.
pub fn check_score(score: Option<f64>, max_score: f64) -> Result<(), GradeError> {
    if !max_score.is_finite() || max_score <= 0.0 {
        return Err(GradeError::InvalidScore {
            message: format!("maxScore must be a positive number, got {}", max_score),
        });
    }
    let Some(v) = score else {
        return Ok(());
    };
    if !v.is_finite() || v < 0.0 {
        return Err(GradeError::InvalidScore {
            message: format!("score must be >= 0, got {}", v),
        });
    }
    if v > max_score {
        return Err(GradeError::InvalidScore {
            message: format!("score {} exceeds maxScore {}", v, max_score),
        });
    }
    Ok(())
}

fn check_term_exam(draft: &GradeDraft) -> Result<(), GradeError> {
    if draft.term.trim().is_empty() {
        return Err(GradeError::MissingField { field: "term" });
    }
    if draft.exam_type.trim().is_empty() {
        return Err(GradeError::MissingField { field: "examType" });
    }
    Ok(())
}

/// Rules 5 + 6: the class must exist and resolve to the actor's school
/// (platform admins are exempt), and the actor must be a platform admin,
/// the principal of that school, or a teacher assigned to that class.
/// Returns the class's school_id for tenant-scoping the write.
pub fn check_scope(
    conn: &Connection,
    ctx: &ActorContext,
    class_id: &str,
) -> Result<String, GradeError> {
    let class_school: Option<String> = conn
        .query_row(
            "SELECT school_id FROM classes WHERE id = ?",
            [class_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| GradeError::db("db_query_failed", e))?;
    let Some(class_school) = class_school else {
        return Err(GradeError::NotFound { what: "class" });
    };

    if !ctx.is_platform_admin() && ctx.school_id.as_deref() != Some(class_school.as_str()) {
        return Err(GradeError::CrossTenant);
    }

    if !role_allows(ctx.role, Capability::SubmitGrades) {
        return Err(GradeError::PermissionDenied {
            message: format!("role {} cannot submit grades", ctx.role.as_str()),
        });
    }
    if ctx.role == Role::Teacher {
        let assigned: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM class_teachers WHERE class_id = ? AND user_id = ?",
                [class_id, ctx.user_id.as_str()],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| GradeError::db("db_query_failed", e))?;
        if assigned.is_none() {
            return Err(GradeError::PermissionDenied {
                message: "teacher is not assigned to this class".to_string(),
            });
        }
    }

    Ok(class_school)
}

/// Rule 7: the student must belong to the referenced class.
pub fn check_student(
    conn: &Connection,
    class_id: &str,
    student_id: &str,
) -> Result<(), GradeError> {
    let student_class: Option<String> = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| GradeError::db("db_query_failed", e))?;
    let Some(student_class) = student_class else {
        return Err(GradeError::NotFound { what: "student" });
    };
    if student_class != class_id {
        return Err(GradeError::StudentClassMismatch);
    }
    Ok(())
}

/// Released entries are immutable; everything else at the natural key is
/// returned so the caller can upsert in place and audit the old value.
pub fn check_existing(
    conn: &Connection,
    draft: &GradeDraft,
) -> Result<Option<ExistingEntry>, GradeError> {
    let row: Option<(Option<f64>, String, i64)> = conn
        .query_row(
            "SELECT score, status, is_immutable FROM grade_entries
             WHERE student_id = ? AND subject_id = ? AND class_id = ? AND term = ? AND exam_type = ?",
            (
                &draft.student_id,
                &draft.subject_id,
                &draft.class_id,
                &draft.term,
                &draft.exam_type,
            ),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(|e| GradeError::db("db_query_failed", e))?;

    let Some((score, status_str, is_immutable)) = row else {
        return Ok(None);
    };
    let status = GradeStatus::parse(&status_str).unwrap_or(GradeStatus::Submitted);
    if is_immutable != 0 || status.is_terminal() {
        return Err(GradeError::ImmutableRecord);
    }
    Ok(Some(ExistingEntry { score, status }))
}

/// Full validation pipeline for one submission, in rule order. Read-only
/// apart from the rate-limit counter increment. On success returns the
/// class's school_id and the existing row at the key, if any.
pub fn validate_submission(
    conn: &Connection,
    limiter: &mut SubmissionLimiter,
    now: Instant,
    ctx: &ActorContext,
    draft: &GradeDraft,
) -> Result<(String, Option<ExistingEntry>), GradeError> {
    check_fields(draft)?;
    check_score(draft.score, draft.max_score)?;
    check_term_exam(draft)?;
    limiter
        .check(&ctx.user_id, now)
        .map_err(|retry_after| GradeError::RateLimited {
            retry_after_ms: retry_after.as_millis() as u64,
        })?;
    let school_id = check_scope(conn, ctx, &draft.class_id)?;
    check_student(conn, &draft.class_id, &draft.student_id)?;
    let existing = check_existing(conn, draft)?;
    Ok((school_id, existing))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> GradeDraft {
        GradeDraft {
            student_id: "s1".to_string(),
            subject_id: "sub1".to_string(),
            class_id: "c1".to_string(),
            term: "T1".to_string(),
            exam_type: "midterm".to_string(),
            score: Some(80.0),
            max_score: 100.0,
        }
    }

    #[test]
    fn missing_identity_fields_fail_in_order() {
        let mut d = draft();
        d.student_id = "".to_string();
        let e = check_fields(&d).expect_err("missing studentId");
        assert_eq!(e.code(), "missing_field");
        assert!(e.message().contains("studentId"));

        let mut d = draft();
        d.subject_id = "  ".to_string();
        let e = check_fields(&d).expect_err("missing subjectId");
        assert!(e.message().contains("subjectId"));

        let mut d = draft();
        d.class_id = "".to_string();
        let e = check_fields(&d).expect_err("missing classId");
        assert!(e.message().contains("classId"));
    }

    #[test]
    fn score_bounds() {
        assert!(check_score(Some(0.0), 100.0).is_ok());
        assert!(check_score(Some(100.0), 100.0).is_ok());
        assert!(check_score(None, 100.0).is_ok());

        let e = check_score(Some(-1.0), 100.0).expect_err("negative");
        assert_eq!(e.code(), "invalid_score");
        let e = check_score(Some(101.0), 100.0).expect_err("over max");
        assert_eq!(e.code(), "invalid_score");
        let e = check_score(Some(20.0), 0.0).expect_err("non-positive max");
        assert_eq!(e.code(), "invalid_score");
        let e = check_score(Some(f64::NAN), 100.0).expect_err("nan");
        assert_eq!(e.code(), "invalid_score");
    }

    #[test]
    fn term_and_exam_type_required() {
        let mut d = draft();
        d.term = "".to_string();
        let e = check_term_exam(&d).expect_err("missing term");
        assert!(e.message().contains("term"));

        let mut d = draft();
        d.exam_type = " ".to_string();
        let e = check_term_exam(&d).expect_err("missing examType");
        assert!(e.message().contains("examType"));
    }

    #[test]
    fn rate_limit_error_carries_retry_after() {
        let e = GradeError::RateLimited {
            retry_after_ms: 1234,
        };
        assert_eq!(e.code(), "rate_limited");
        let details = e.details().expect("details");
        assert_eq!(details.get("retryAfterMs").and_then(|v| v.as_u64()), Some(1234));
    }
}
