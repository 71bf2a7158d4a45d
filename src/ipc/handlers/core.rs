use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;

use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::ratelimit::{
    RateLimitConfig, SubmissionLimiter, DEFAULT_MAX_PER_WINDOW, DEFAULT_WINDOW_MS,
};

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

fn parse_rate_limit(params: &serde_json::Value) -> Result<RateLimitConfig, String> {
    let Some(raw) = params.get("submissionRateLimit") else {
        return Ok(RateLimitConfig::default());
    };
    let Some(obj) = raw.as_object() else {
        return Err("submissionRateLimit must be an object".to_string());
    };
    let max_per_window = match obj.get("maxPerWindow") {
        None => DEFAULT_MAX_PER_WINDOW,
        Some(v) => match v.as_u64() {
            Some(n) if n > 0 => n as usize,
            _ => {
                return Err(
                    "submissionRateLimit.maxPerWindow must be a positive integer".to_string(),
                )
            }
        },
    };
    let window_ms = match obj.get("windowMs") {
        None => DEFAULT_WINDOW_MS,
        Some(v) => match v.as_u64() {
            Some(n) if n > 0 => n,
            _ => return Err("submissionRateLimit.windowMs must be a positive integer".to_string()),
        },
    };
    Ok(RateLimitConfig {
        max_per_window,
        window: Duration::from_millis(window_ms),
    })
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    let rate_config = match parse_rate_limit(&req.params) {
        Ok(c) => c,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };

    match db::open_db(&path) {
        Ok(conn) => {
            state.workspace = Some(path.clone());
            state.db = Some(conn);
            // Selecting a workspace starts a fresh session: open sheets and
            // rate-limit history do not carry over.
            state.limiter = SubmissionLimiter::new(rate_config);
            state.sheets.clear();
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
