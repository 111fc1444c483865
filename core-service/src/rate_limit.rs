//! Per-user command rate limiting.
//!
//! Sliding window: a user may issue `max_commands` commands in any
//! `window`. Timestamps come from the injected [`Clock`].

use bridge_traits::{Clock, UserId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct RateLimiter {
    max_commands: usize,
    window: Duration,
    clock: Arc<dyn Clock>,
    history: Mutex<HashMap<UserId, VecDeque<DateTime<Utc>>>>,
}

impl RateLimiter {
    pub fn new(max_commands: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_commands: max_commands as usize,
            window,
            clock,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Record a command for `user`, or return how long until one is allowed.
    pub fn check(&self, user: UserId) -> Result<(), Duration> {
        if self.max_commands == 0 {
            return Ok(());
        }

        let now = self.clock.now();
        let mut history = self.history.lock();
        let recent = history.entry(user).or_default();
        self.expire(recent, now);

        if recent.len() >= self.max_commands {
            let retry_after = recent
                .front()
                .and_then(|oldest| (*oldest + self.window_chrono() - now).to_std().ok())
                .unwrap_or(self.window);
            debug!(user_id = %user, retry_after_ms = retry_after.as_millis() as u64, "Command rate limited");
            return Err(retry_after);
        }

        recent.push_back(now);
        Ok(())
    }

    /// Drop users with no command inside the window.
    pub fn prune(&self) -> usize {
        let now = self.clock.now();
        let mut history = self.history.lock();
        let before = history.len();
        history.retain(|_, recent| {
            self.expire(recent, now);
            !recent.is_empty()
        });
        before - history.len()
    }

    pub fn tracked_users(&self) -> usize {
        self.history.lock().len()
    }

    fn window_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.window).unwrap_or_else(|_| chrono::Duration::days(1))
    }

    fn expire(&self, recent: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
        let window = self.window_chrono();
        while recent.front().is_some_and(|at| *at + window <= now) {
            recent.pop_front();
        }
    }
}
