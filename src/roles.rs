use rusqlite::{Connection, OptionalExtension};

use crate::validate::GradeError;

/// Closed set of actor roles. Role strings are stored in the users table and
/// parsed once on actor resolution; no call site re-checks raw strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    PlatformAdmin,
    SchoolOwner,
    Principal,
    Teacher,
    FinanceOfficer,
    Parent,
}

impl Role {
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "platform_admin" => Some(Role::PlatformAdmin),
            "school_owner" => Some(Role::SchoolOwner),
            "principal" => Some(Role::Principal),
            "teacher" => Some(Role::Teacher),
            "finance_officer" => Some(Role::FinanceOfficer),
            "parent" => Some(Role::Parent),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::PlatformAdmin => "platform_admin",
            Role::SchoolOwner => "school_owner",
            Role::Principal => "principal",
            Role::Teacher => "teacher",
            Role::FinanceOfficer => "finance_officer",
            Role::Parent => "parent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    SubmitGrades,
    ReviewSubmissions,
    ApproveGrades,
    ReleaseGrades,
    ViewAudit,
}

/// Single capability table; permission checks happen here and nowhere else.
/// Teachers additionally need a class assignment for SubmitGrades, which the
/// validator checks against class_teachers.
pub fn role_allows(role: Role, cap: Capability) -> bool {
    match cap {
        Capability::SubmitGrades => matches!(
            role,
            Role::PlatformAdmin | Role::Principal | Role::Teacher
        ),
        Capability::ReviewSubmissions => matches!(
            role,
            Role::PlatformAdmin | Role::SchoolOwner | Role::Principal
        ),
        Capability::ApproveGrades | Capability::ReleaseGrades => matches!(role, Role::Principal),
        Capability::ViewAudit => matches!(
            role,
            Role::PlatformAdmin | Role::SchoolOwner | Role::Principal
        ),
    }
}

/// The acting user, resolved once per request and threaded as an explicit
/// argument into every validator/aggregator call. Never ambient state.
#[derive(Debug, Clone)]
pub struct ActorContext {
    pub user_id: String,
    pub role: Role,
    pub school_id: Option<String>,
}

impl ActorContext {
    pub fn is_platform_admin(&self) -> bool {
        self.role == Role::PlatformAdmin
    }
}

pub fn load_actor(conn: &Connection, actor_id: &str) -> Result<ActorContext, GradeError> {
    let row: Option<(Option<String>, String)> = conn
        .query_row(
            "SELECT school_id, role FROM users WHERE id = ?",
            [actor_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| GradeError::db("db_query_failed", e))?;

    let Some((school_id, role_str)) = row else {
        return Err(GradeError::NotFound { what: "actor" });
    };
    let Some(role) = Role::parse(&role_str) else {
        return Err(GradeError::PermissionDenied {
            message: format!("unknown role: {}", role_str),
        });
    };

    Ok(ActorContext {
        user_id: actor_id.to_string(),
        role,
        school_id,
    })
}
