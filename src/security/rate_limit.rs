//! Sliding-window rate limiting for gateway forwards.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A forward was refused because the gateway exceeded its rate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rate limited for {key}: {count} calls in the last {window_secs}s (limit: {max})")]
pub struct RateLimited {
    /// What was limited (the gateway session).
    pub key: String,
    /// Calls already inside the window.
    pub count: u32,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Calls allowed per window.
    pub max: u32,
}

/// Sliding-window rate limiter.
///
/// Uses a sync [`Mutex`] since the critical section is very short (no awaits).
#[derive(Debug)]
pub struct RateLimiter {
    window: Mutex<VecDeque<Instant>>,
    max_count: u32,
    window_secs: u64,
}

impl RateLimiter {
    /// Create a new rate limiter with the given window size and maximum count.
    pub fn new(window_secs: u64, max_count: u32) -> Self {
        Self {
            window: Mutex::new(VecDeque::new()),
            max_count,
            window_secs,
        }
    }

    /// Limiter allowing `max_count` calls per minute.
    pub fn per_minute(max_count: u32) -> Self {
        Self::new(60, max_count)
    }

    /// Calls allowed per window.
    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    /// Admit one call if the window has room, recording it.
    ///
    /// Check and record happen under one lock so concurrent callers cannot
    /// both squeeze into the last slot.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimited`] when the window is full.
    pub fn try_acquire(&self, key: &str) -> Result<(), RateLimited> {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);

        let now = Instant::now();
        let cutoff = now
            .checked_sub(Duration::from_secs(self.window_secs))
            .unwrap_or(now);

        // Drain expired entries
        while window.front().is_some_and(|t| *t < cutoff) {
            window.pop_front();
        }

        let count = u32::try_from(window.len()).unwrap_or(u32::MAX);
        if count >= self.max_count {
            return Err(RateLimited {
                key: key.to_owned(),
                count,
                window_secs: self.window_secs,
                max: self.max_count,
            });
        }
        window.push_back(now);
        Ok(())
    }
}
