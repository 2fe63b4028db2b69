//! Permit pool implementation.

use std::sync::{Condvar, Mutex};

use crate::error::{GateError, Result};
use crate::sync::{lock, wait};

struct PoolState {
    available: usize,
    interrupted: bool,
}

/// A permit acquired from the pool but not yet owned by an occurrence.
#[must_use = "dropping an uncommitted permit returns it to the pool"]
pub struct PermitInUse<'a> {
    pool: &'a PermitPool,
    committed: bool,
}

impl PermitInUse<'_> {
    /// Transfer the permit to an outstanding occurrence. The pool gets it back
    /// through [`PermitPool::release`] when that occurrence arrives.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PermitInUse<'_> {
    fn drop(&mut self) {
        if !self.committed {
            tracing::debug!("Uncommitted permit returned to pool");
            self.pool.release();
        }
    }
}

/// Pool of concurrency slots with blocking, interruptible acquisition.
pub struct PermitPool {
    capacity: usize,
    state: Mutex<PoolState>,
    freed: Condvar,
}

impl PermitPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(PoolState {
                available: capacity,
                interrupted: false,
            }),
            freed: Condvar::new(),
        }
    }

    /// Block until a permit is free. Never times out; only an interrupt
    /// ends the wait early.
    pub fn acquire(&self) -> Result<PermitInUse<'_>> {
        let mut state = lock(&self.state);
        loop {
            if state.interrupted {
                return Err(GateError::Interrupted);
            }
            if state.available > 0 {
                state.available -= 1;
                return Ok(PermitInUse {
                    pool: self,
                    committed: false,
                });
            }
            state = wait(&self.freed, state);
        }
    }

    pub fn try_acquire(&self) -> Option<PermitInUse<'_>> {
        let mut state = lock(&self.state);
        if state.interrupted || state.available == 0 {
            return None;
        }
        state.available -= 1;
        Some(PermitInUse {
            pool: self,
            committed: false,
        })
    }

    /// Return one committed permit to the pool.
    pub fn release(&self) {
        let mut state = lock(&self.state);
        if state.available >= self.capacity {
            debug_assert!(false, "permit released more times than acquired");
            tracing::error!(capacity = self.capacity, "Bug: permit released into a full pool");
            return;
        }
        state.available += 1;
        self.freed.notify_one();
    }

    pub fn interrupt(&self) {
        let mut state = lock(&self.state);
        state.interrupted = true;
        self.freed.notify_all();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        lock(&self.state).available
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn pool_acquire_until_empty() {
        let pool = PermitPool::new(2);

        let p1 = pool.try_acquire();
        assert!(p1.is_some());
        let p2 = pool.try_acquire();
        assert!(p2.is_some());
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn uncommitted_permit_returns_on_drop() {
        let pool = PermitPool::new(1);
        {
            let _permit = pool.acquire().unwrap();
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn committed_permit_stays_out_until_released() {
        let pool = PermitPool::new(1);
        pool.acquire().unwrap().commit();
        assert_eq!(pool.available(), 0);
        assert!(pool.try_acquire().is_none());

        pool.release();
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn acquire_blocks_until_release() {
        let pool = Arc::new(PermitPool::new(1));
        pool.acquire().unwrap().commit();

        let releaser = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                pool.release();
            })
        };

        let start = Instant::now();
        pool.acquire().unwrap().commit();
        assert!(start.elapsed() >= Duration::from_millis(25));
        releaser.join().unwrap();
    }

    #[test]
    fn interrupt_wakes_blocked_acquirer() {
        let pool = Arc::new(PermitPool::new(1));
        pool.acquire().unwrap().commit();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire().map(PermitInUse::commit))
        };

        thread::sleep(Duration::from_millis(10));
        pool.interrupt();
        assert_eq!(waiter.join().unwrap(), Err(GateError::Interrupted));
        assert!(pool.try_acquire().is_none());
    }
}
