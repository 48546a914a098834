//! Per-user request spacing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::queue::UserId;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("please wait {}s before sending another request", .remaining.as_secs().max(1))]
pub struct TooSoon {
    pub remaining: Duration,
}

/// Rejects a user's request arriving within `gap` of their last accepted one.
pub struct TimeGap {
    gap: Duration,
    last_seen: Mutex<HashMap<UserId, Instant>>,
}

impl TimeGap {
    pub fn new(gap: Duration) -> Self {
        Self {
            gap,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, user: UserId) -> Result<(), TooSoon> {
        self.check_at(user, Instant::now())
    }

    /// Rejected requests do not reset the window.
    pub fn check_at(&self, user: UserId, now: Instant) -> Result<(), TooSoon> {
        let mut last_seen = self.last_seen.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(last) = last_seen.get(&user) {
            let elapsed = now.saturating_duration_since(*last);
            if elapsed < self.gap {
                return Err(TooSoon {
                    remaining: self.gap - elapsed,
                });
            }
        }
        last_seen.insert(user, now);
        Ok(())
    }

    pub fn tracked_users(&self) -> usize {
        self.last_seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drop entries older than the gap so the map does not grow without bound.
    pub fn prune(&self, now: Instant) {
        let mut last_seen = self.last_seen.lock().unwrap_or_else(|e| e.into_inner());
        last_seen.retain(|_, last| now.saturating_duration_since(*last) < self.gap);
    }
}
