use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

/// One audit tuple: (action, target, old value, new value, metadata).
/// Writes are fire-and-forget; call sites invoke `record` with `let _ =`.
pub struct AuditEntry<'a> {
    pub school_id: Option<&'a str>,
    pub actor_id: &'a str,
    pub action: &'a str,
    pub target_id: Option<&'a str>,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub success: bool,
    pub metadata: Option<serde_json::Value>,
}

pub fn record(conn: &Connection, entry: AuditEntry<'_>) -> rusqlite::Result<()> {
    let id = Uuid::new_v4().to_string();
    let created_at = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO audit_log(id, school_id, actor_id, action, target_id,
            old_value, new_value, success, metadata, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            entry.school_id,
            entry.actor_id,
            entry.action,
            entry.target_id,
            entry.old_value.map(|v| v.to_string()),
            entry.new_value.map(|v| v.to_string()),
            entry.success as i64,
            entry.metadata.map(|v| v.to_string()),
            &created_at,
        ),
    )?;
    Ok(())
}

/// Recent audit rows for one school, newest first.
pub fn list_for_school(
    conn: &Connection,
    school_id: &str,
    limit: i64,
) -> rusqlite::Result<Vec<serde_json::Value>> {
    let mut stmt = conn.prepare(
        "SELECT id, actor_id, action, target_id, old_value, new_value, success, metadata, created_at
         FROM audit_log
         WHERE school_id = ?
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?",
    )?;
    let rows = stmt
        .query_map((school_id, limit), |r| {
            let old_value: Option<String> = r.get(4)?;
            let new_value: Option<String> = r.get(5)?;
            let metadata: Option<String> = r.get(7)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "actorId": r.get::<_, String>(1)?,
                "action": r.get::<_, String>(2)?,
                "targetId": r.get::<_, Option<String>>(3)?,
                "oldValue": old_value
                    .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok()),
                "newValue": new_value
                    .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok()),
                "success": r.get::<_, i64>(6)? != 0,
                "metadata": metadata
                    .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok()),
                "createdAt": r.get::<_, String>(8)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
