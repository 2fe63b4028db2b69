//! Submission-rate limiter.
//!
//! A fixed pool of `n` tokens. A released token only becomes usable again
//! `d` after the release, so callers that release right after *submitting*
//! an operation (not after it completes) start at most `n` operations per
//! `d`, however long each operation runs.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{GateError, Result};
use crate::sync::{lock, wait, wait_for};

struct LimiterState {
    /// Instant at which each pooled token becomes usable, oldest first.
    ready_at: VecDeque<Instant>,
    interrupted: bool,
}

pub struct RateLimiter {
    capacity: usize,
    delay: Duration,
    state: Mutex<LimiterState>,
    changed: Condvar,
}

impl RateLimiter {
    pub fn new(capacity: usize, delay: Duration) -> Self {
        let now = Instant::now();
        Self {
            capacity,
            delay,
            state: Mutex::new(LimiterState {
                ready_at: std::iter::repeat_n(now, capacity).collect(),
                interrupted: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Block until a token is usable and take it.
    pub fn acquire(&self) -> Result<()> {
        let mut state = lock(&self.state);
        loop {
            if state.interrupted {
                return Err(GateError::Interrupted);
            }
            let now = Instant::now();
            // Tokens are queued in release order with a constant delay, so
            // the front is always the first to become ready.
            state = match state.ready_at.front().copied() {
                Some(ready) if ready <= now => {
                    state.ready_at.pop_front();
                    return Ok(());
                }
                Some(ready) => wait_for(&self.changed, state, ready - now),
                None => wait(&self.changed, state),
            };
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut state = lock(&self.state);
        if state.interrupted {
            return false;
        }
        match state.ready_at.front() {
            Some(ready) if *ready <= Instant::now() => {
                state.ready_at.pop_front();
                true
            }
            _ => false,
        }
    }

    /// Return a token; it becomes usable again after the configured delay.
    pub fn release(&self) {
        let mut state = lock(&self.state);
        if state.ready_at.len() >= self.capacity {
            tracing::warn!(
                capacity = self.capacity,
                "Rate limiter token released into a full pool - ignoring"
            );
            return;
        }
        state.ready_at.push_back(Instant::now() + self.delay);
        self.changed.notify_one();
    }

    /// Fail every blocked and future `acquire` with [`GateError::Interrupted`].
    pub fn interrupt(&self) {
        let mut state = lock(&self.state);
        state.interrupted = true;
        self.changed.notify_all();
    }

    /// Tokens usable right now.
    pub fn available(&self) -> usize {
        let now = Instant::now();
        lock(&self.state)
            .ready_at
            .iter()
            .take_while(|ready| **ready <= now)
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("capacity", &self.capacity)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}
