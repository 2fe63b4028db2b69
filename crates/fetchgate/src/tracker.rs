//! Outstanding-label tracking with exactly-once completion.
//!
//! The tracker is a multiset: registering an equal label twice yields two
//! independent occurrences, each of which must arrive exactly once before a
//! drain can return. Occurrences carry a monotonically increasing id so a
//! caller that knows *which* occurrence it is completing (the deadline timer)
//! cannot accidentally complete a younger one.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::Label;
use crate::error::{GateError, Result};
use crate::sync::{lock, wait, wait_for};

/// Identifies one registration of a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct OccurrenceId(u64);

/// Number of waiting labels listed when a bounded drain gives up.
const PENDING_REPORT_LIMIT: usize = 10;

/// Plain multiset of occurrences, keyed by label. Not synchronized.
#[derive(Debug)]
pub(crate) struct Occurrences<L> {
    by_label: HashMap<L, VecDeque<OccurrenceId>>,
    total: usize,
    next_id: u64,
}

impl<L: Label> Occurrences<L> {
    pub(crate) fn new() -> Self {
        Self {
            by_label: HashMap::new(),
            total: 0,
            next_id: 0,
        }
    }

    pub(crate) fn insert(&mut self, label: L) -> OccurrenceId {
        let id = OccurrenceId(self.next_id);
        self.next_id += 1;
        self.by_label.entry(label).or_default().push_back(id);
        self.total += 1;
        id
    }

    /// Remove the oldest occurrence of `label`, or exactly `id` when given.
    pub(crate) fn remove(&mut self, label: &L, id: Option<OccurrenceId>) -> bool {
        let Some(ids) = self.by_label.get_mut(label) else {
            return false;
        };

        let removed = match id {
            None => ids.pop_front().is_some(),
            // Ids are pushed in increasing order, so the deque stays sorted.
            Some(id) => match ids.binary_search(&id) {
                Ok(pos) => ids.remove(pos).is_some(),
                Err(_) => false,
            },
        };

        if ids.is_empty() {
            self.by_label.remove(label);
        }
        if removed {
            self.total -= 1;
        }
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.total
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Up to `n` waiting labels, duplicates repeated per occurrence.
    pub(crate) fn sample(&self, n: usize) -> Vec<L> {
        self.by_label
            .iter()
            .flat_map(|(label, ids)| std::iter::repeat_n(label, ids.len()))
            .take(n)
            .cloned()
            .collect()
    }
}

#[derive(Debug)]
struct TrackerState<L> {
    outstanding: Occurrences<L>,
    closed: bool,
    interrupted: bool,
}

/// Thread-safe multiset of in-flight labels.
///
/// `register` and `arrive` may be called from any thread; `drain` blocks the
/// caller until every registered occurrence has arrived and then closes the
/// tracker to further registrations.
#[derive(Debug)]
pub struct OutstandingTracker<L> {
    state: Mutex<TrackerState<L>>,
    drained: Condvar,
}

impl<L: Label> Default for OutstandingTracker<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: Label> OutstandingTracker<L> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState {
                outstanding: Occurrences::new(),
                closed: false,
                interrupted: false,
            }),
            drained: Condvar::new(),
        }
    }

    /// Add one occurrence of `label`.
    pub fn register(&self, label: L) -> Result<()> {
        self.register_occurrence(label).map(|_| ())
    }

    pub(crate) fn register_occurrence(&self, label: L) -> Result<OccurrenceId> {
        let mut state = lock(&self.state);
        if state.interrupted {
            return Err(GateError::Interrupted);
        }
        if state.closed {
            tracing::error!(label = ?label, "Register called on a drained tracker");
            return Err(GateError::Closed);
        }
        Ok(state.outstanding.insert(label))
    }

    /// Remove one occurrence of `label`.
    ///
    /// Returns `true` only for the call that actually removed an occurrence;
    /// that is the sole signal allowed to release resources tied to it.
    pub fn arrive(&self, label: &L) -> bool {
        self.arrive_with(label, None, |_| {})
    }

    /// Arrive and run `on_arrival` with the outcome while the tracker lock is
    /// still held, so bookkeeping tied to the winning arrival is atomic with
    /// the removal itself.
    pub(crate) fn arrive_with(
        &self,
        label: &L,
        id: Option<OccurrenceId>,
        on_arrival: impl FnOnce(bool),
    ) -> bool {
        let mut state = lock(&self.state);
        let removed = state.outstanding.remove(label, id);
        on_arrival(removed);
        if removed && state.outstanding.is_empty() {
            self.drained.notify_all();
        }
        removed
    }

    /// Block until every registered occurrence has arrived, then close.
    ///
    /// Returns immediately on an already drained tracker.
    pub fn drain(&self) -> Result<()> {
        let mut state = lock(&self.state);
        while !state.outstanding.is_empty() {
            if state.interrupted {
                tracing::warn!(
                    waiting = state.outstanding.len(),
                    pending = ?state.outstanding.sample(PENDING_REPORT_LIMIT),
                    "Drain interrupted"
                );
                return Err(GateError::Interrupted);
            }
            state = wait(&self.drained, state);
        }
        state.closed = true;
        Ok(())
    }

    /// Drain with an upper bound on the wait.
    ///
    /// Returns `Ok(false)` if occurrences are still outstanding when `timeout`
    /// elapses; the tracker then stays open.
    pub fn drain_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        while !state.outstanding.is_empty() {
            if state.interrupted {
                return Err(GateError::Interrupted);
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::error!(
                    waiting = state.outstanding.len(),
                    pending = ?state.outstanding.sample(PENDING_REPORT_LIMIT),
                    "Timed out waiting for outstanding labels"
                );
                return Ok(false);
            }
            state = wait_for(&self.drained, state, deadline - now);
        }
        state.closed = true;
        Ok(true)
    }

    /// Wake every drainer with [`GateError::Interrupted`] and refuse further
    /// registrations.
    pub fn interrupt(&self) {
        let mut state = lock(&self.state);
        state.interrupted = true;
        self.drained.notify_all();
    }

    pub fn len(&self) -> usize {
        lock(&self.state).outstanding.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).outstanding.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Up to `n` labels still waiting to arrive.
    pub fn pending(&self, n: usize) -> Vec<L> {
        lock(&self.state).outstanding.sample(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn register_and_arrive() {
        let tracker = OutstandingTracker::new();
        tracker.register("a").unwrap();
        assert_eq!(tracker.len(), 1);

        assert!(tracker.arrive(&"a"));
        assert!(!tracker.arrive(&"a"));
        assert!(tracker.is_empty());
    }

    #[test]
    fn arrive_unknown_label_is_noop() {
        let tracker = OutstandingTracker::new();
        tracker.register("a").unwrap();
        assert!(!tracker.arrive(&"b"));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn duplicates_are_independent_occurrences() {
        let tracker = OutstandingTracker::new();
        tracker.register("x").unwrap();
        tracker.register("x").unwrap();
        assert_eq!(tracker.len(), 2);

        assert!(tracker.arrive(&"x"));
        assert!(!tracker.is_empty());
        assert!(tracker.arrive(&"x"));
        assert!(tracker.is_empty());
        assert!(!tracker.arrive(&"x"));
    }

    #[test]
    fn targeted_removal_skips_other_occurrences() {
        let tracker = OutstandingTracker::new();
        let first = tracker.register_occurrence("x").unwrap();
        let second = tracker.register_occurrence("x").unwrap();

        // Plain arrival takes the oldest occurrence.
        assert!(tracker.arrive(&"x"));
        // The first occurrence is gone; targeting it again is a no-op.
        assert!(!tracker.arrive_with(&"x", Some(first), |_| {}));
        assert!(tracker.arrive_with(&"x", Some(second), |_| {}));
        assert!(tracker.is_empty());
    }

    #[test]
    fn drain_closes_tracker() {
        let tracker = OutstandingTracker::new();
        tracker.register(1).unwrap();
        tracker.arrive(&1);

        tracker.drain().unwrap();
        assert!(tracker.is_closed());
        assert_eq!(tracker.register(2), Err(GateError::Closed));
        assert!(tracker.is_empty());

        // Subsequent drains return immediately.
        tracker.drain().unwrap();
    }

    #[test]
    fn drain_on_empty_tracker_returns_immediately() {
        let tracker: OutstandingTracker<u32> = OutstandingTracker::new();
        tracker.drain().unwrap();
        assert!(tracker.is_closed());
    }

    #[test]
    fn drain_waits_for_every_occurrence() {
        let tracker = Arc::new(OutstandingTracker::new());
        for i in 0..8 {
            tracker.register(i % 3).unwrap();
        }

        let arrived = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..8)
            .map(|i| {
                let tracker = Arc::clone(&tracker);
                let arrived = Arc::clone(&arrived);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(5 * (i as u64 % 4)));
                    arrived.fetch_add(1, Ordering::SeqCst);
                    assert!(tracker.arrive(&(i % 3)));
                })
            })
            .collect();

        tracker.drain().unwrap();
        assert_eq!(arrived.load(Ordering::SeqCst), 8);
        assert!(tracker.is_empty());

        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn concurrent_arrivals_have_exactly_one_winner() {
        for _ in 0..50 {
            let tracker = Arc::new(OutstandingTracker::new());
            tracker.register("x").unwrap();

            let wins = Arc::new(AtomicUsize::new(0));
            let racers: Vec<_> = (0..4)
                .map(|_| {
                    let tracker = Arc::clone(&tracker);
                    let wins = Arc::clone(&wins);
                    thread::spawn(move || {
                        if tracker.arrive(&"x") {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for racer in racers {
                racer.join().unwrap();
            }

            assert_eq!(wins.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn drain_timeout_reports_stragglers_without_closing() {
        let tracker = OutstandingTracker::new();
        tracker.register("slow").unwrap();

        assert!(!tracker.drain_timeout(Duration::from_millis(20)).unwrap());
        assert!(!tracker.is_closed());
        assert_eq!(tracker.pending(10), vec!["slow"]);

        tracker.arrive(&"slow");
        assert!(tracker.drain_timeout(Duration::from_millis(20)).unwrap());
        assert!(tracker.is_closed());
    }

    #[test]
    fn interrupt_unblocks_drain() {
        let tracker = Arc::new(OutstandingTracker::new());
        tracker.register("stuck").unwrap();

        let interrupter = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                tracker.interrupt();
            })
        };

        assert_eq!(tracker.drain(), Err(GateError::Interrupted));
        assert_eq!(tracker.register("late"), Err(GateError::Interrupted));
        interrupter.join().unwrap();
    }

    #[test]
    fn pending_lists_duplicates() {
        let tracker = OutstandingTracker::new();
        tracker.register("a").unwrap();
        tracker.register("a").unwrap();

        assert_eq!(tracker.pending(10), vec!["a", "a"]);
        assert_eq!(tracker.pending(1).len(), 1);
    }
}
