//! Timed permit gate - bounded concurrency with per-registration deadlines.
//!
//! Flow for one round:
//! 1. `register` acquires a permit (blocking), records the occurrence, and
//!    queues its deadline
//! 2. The request's callback calls `arrive` on a [`GateHandle`]
//! 3. The timer thread calls the same arrival path when a deadline passes
//!    first and, only if that arrival wins, records the label as timed out
//! 4. `drain` blocks until every occurrence has arrived by either path

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::Label;
use crate::error::Result;
use crate::permit::PermitPool;
use crate::sync::lock;
use crate::timer::{Deadline, DeadlineQueue};
use crate::tracker::{OccurrenceId, OutstandingTracker};

/// Which path completed an occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arrival {
    Explicit,
    Deadline(OccurrenceId),
}

/// Something a shutdown signal can wake.
pub trait Interruptible: Send + Sync {
    fn interrupt(&self);
}

struct GateShared<L> {
    tracker: OutstandingTracker<L>,
    permits: PermitPool,
    deadlines: DeadlineQueue<L>,
    timed_out: Mutex<HashSet<L>>,
}

impl<L: Label> GateShared<L> {
    fn arrive(&self, label: &L, arrival: Arrival) -> bool {
        let occurrence = match arrival {
            Arrival::Explicit => None,
            Arrival::Deadline(id) => Some(id),
        };

        // Only the winning arrival updates the timeout record and returns the
        // permit, both before drainers wake. Lock order: tracker, then the
        // timeout set or the pool.
        self.tracker.arrive_with(label, occurrence, |removed| {
            if !removed {
                return;
            }
            {
                let mut timed_out = lock(&self.timed_out);
                match arrival {
                    Arrival::Explicit => {
                        timed_out.remove(label);
                    }
                    Arrival::Deadline(_) => {
                        timed_out.insert(label.clone());
                    }
                }
            }
            self.permits.release();
        })
    }

    fn run_timer(&self) {
        while let Some(expired) = self.deadlines.next_expired() {
            if self.arrive(&expired.label, Arrival::Deadline(expired.occurrence)) {
                tracing::info!(label = ?expired.label, "Request timed out");
            }
        }
        tracing::trace!("Gate timer stopped");
    }
}

impl<L: Label> Interruptible for GateShared<L> {
    fn interrupt(&self) {
        self.permits.interrupt();
        self.tracker.interrupt();
    }
}

/// Cloneable handle for completing requests from callback threads.
pub struct GateHandle<L> {
    shared: Arc<GateShared<L>>,
}

impl<L> Clone for GateHandle<L> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<L: Label> GateHandle<L> {
    /// Report that the request for `label` finished (success or failure).
    ///
    /// Returns `false` if the occurrence was already completed, typically by
    /// its deadline; a late response is then a no-op.
    pub fn arrive(&self, label: &L) -> bool {
        self.shared.arrive(label, Arrival::Explicit)
    }

    pub fn interrupt(&self) {
        self.shared.interrupt();
    }
}

/// Concurrency-bounded gate that force-completes registrations whose
/// deadline passes before an explicit arrival.
///
/// One gate serves one round; it is closed once drained.
pub struct TimedPermitGate<L: Label> {
    shared: Arc<GateShared<L>>,
    deadline: Duration,
    timer: Option<JoinHandle<()>>,
}

impl<L: Label> TimedPermitGate<L> {
    /// Create a gate with `concurrency` permits and a per-registration
    /// `deadline`, starting its timer thread.
    ///
    /// Panics if the OS refuses to spawn the timer thread.
    pub fn new(concurrency: usize, deadline: Duration) -> Self {
        let shared = Arc::new(GateShared {
            tracker: OutstandingTracker::new(),
            permits: PermitPool::new(concurrency),
            deadlines: DeadlineQueue::new(),
            timed_out: Mutex::new(HashSet::new()),
        });

        let timer_shared = Arc::clone(&shared);
        let timer = std::thread::Builder::new()
            .name("fetchgate-timer".to_string())
            .spawn(move || timer_shared.run_timer())
            .expect("Failed to spawn gate timer thread");

        Self {
            shared,
            deadline,
            timer: Some(timer),
        }
    }

    /// Register one occurrence of `label`, blocking while all permits are
    /// held. The permit is taken before the label becomes visible, so the
    /// outstanding count never exceeds the capacity.
    pub fn register(&self, label: L) -> Result<()> {
        let permit = self.shared.permits.acquire()?;
        // On error the uncommitted permit goes back to the pool.
        let occurrence = self.shared.tracker.register_occurrence(label.clone())?;
        permit.commit();

        self.shared.deadlines.push(Deadline {
            fire_at: Instant::now() + self.deadline,
            occurrence,
            label,
        });
        Ok(())
    }

    /// Explicit completion; see [`GateHandle::arrive`].
    pub fn arrive(&self, label: &L) -> bool {
        self.shared.arrive(label, Arrival::Explicit)
    }

    /// Block until every registered occurrence has arrived, then close the
    /// gate and stop its timer.
    pub fn drain(&self) -> Result<()> {
        self.shared.tracker.drain()?;
        self.shared.deadlines.shutdown();
        Ok(())
    }

    /// Labels whose most recent completion was forced by their deadline.
    pub fn timeout_labels(&self) -> HashSet<L> {
        lock(&self.shared.timed_out).clone()
    }

    pub fn handle(&self) -> GateHandle<L> {
        GateHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Type-erased interrupt target for shutdown plumbing.
    pub fn interruptible(&self) -> Arc<dyn Interruptible> {
        self.shared.clone()
    }

    /// Wake a blocked `register` or `drain` with an interrupted error.
    pub fn interrupt(&self) {
        self.shared.interrupt();
    }

    pub fn capacity(&self) -> usize {
        self.shared.permits.capacity()
    }

    pub fn available_permits(&self) -> usize {
        self.shared.permits.available()
    }

    pub fn outstanding(&self) -> usize {
        self.shared.tracker.len()
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}

impl<L: Label> Drop for TimedPermitGate<L> {
    fn drop(&mut self) {
        self.shared.deadlines.shutdown();
        if let Some(timer) = self.timer.take()
            && timer.join().is_err()
        {
            tracing::error!("Gate timer thread panicked");
        }
    }
}
