use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_PER_WINDOW: usize = 30;
pub const DEFAULT_WINDOW_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_per_window: usize,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            max_per_window: DEFAULT_MAX_PER_WINDOW,
            window: Duration::from_millis(DEFAULT_WINDOW_MS),
        }
    }
}

/// Sliding-window submission counter keyed by user id. Purely in-memory;
/// a rejected call never reaches the store.
#[derive(Debug)]
pub struct SubmissionLimiter {
    config: RateLimitConfig,
    hits: HashMap<String, VecDeque<Instant>>,
}

impl SubmissionLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        SubmissionLimiter {
            config,
            hits: HashMap::new(),
        }
    }

    /// Records one submission attempt for the user at `now`. Returns the
    /// retry-after duration when the window is already full; the attempt is
    /// only counted when admitted.
    pub fn check(&mut self, user_id: &str, now: Instant) -> Result<(), Duration> {
        let window = self.config.window;
        let entry = self.hits.entry(user_id.to_string()).or_default();

        while let Some(&front) = entry.front() {
            if now.duration_since(front) >= window {
                entry.pop_front();
            } else {
                break;
            }
        }

        if entry.len() >= self.config.max_per_window {
            let retry_after = match entry.front() {
                Some(&oldest) => window.saturating_sub(now.duration_since(oldest)),
                None => window,
            };
            return Err(retry_after);
        }

        entry.push_back(now);
        Ok(())
    }
}
