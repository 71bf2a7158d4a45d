use std::collections::HashMap;
use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::ratelimit::{RateLimitConfig, SubmissionLimiter};
use crate::sheet::GradeSheet;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub limiter: SubmissionLimiter,
    pub sheets: HashMap<String, GradeSheet>,
}

impl AppState {
    pub fn new() -> AppState {
        AppState {
            workspace: None,
            db: None,
            limiter: SubmissionLimiter::new(RateLimitConfig::default()),
            sheets: HashMap::new(),
        }
    }
}
