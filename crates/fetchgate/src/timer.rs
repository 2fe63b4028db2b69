//! Deadline queue serviced by a gate's timer thread.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use crate::sync::{lock, wait, wait_for};
use crate::tracker::OccurrenceId;

/// One registration's deadline.
#[derive(Debug)]
pub(crate) struct Deadline<L> {
    pub fire_at: Instant,
    pub occurrence: OccurrenceId,
    pub label: L,
}

// Min-heap on fire time; ties keep registration order. The label takes no
// part in ordering.
impl<L> Ord for Deadline<L> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.occurrence.cmp(&self.occurrence))
    }
}

impl<L> PartialOrd for Deadline<L> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<L> PartialEq for Deadline<L> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<L> Eq for Deadline<L> {}

struct QueueState<L> {
    heap: BinaryHeap<Deadline<L>>,
    shutdown: bool,
}

pub(crate) struct DeadlineQueue<L> {
    state: Mutex<QueueState<L>>,
    wake: Condvar,
}

impl<L> DeadlineQueue<L> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                shutdown: false,
            }),
            wake: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, deadline: Deadline<L>) {
        let mut state = lock(&self.state);
        if state.shutdown {
            return;
        }
        state.heap.push(deadline);
        // The new entry may be earlier than the one the timer is sleeping on.
        self.wake.notify_one();
    }

    /// Block until the earliest deadline has passed and pop it.
    ///
    /// Returns `None` once the queue is shut down; entries still queued at
    /// that point are discarded.
    pub(crate) fn next_expired(&self) -> Option<Deadline<L>> {
        let mut state = lock(&self.state);
        loop {
            if state.shutdown {
                return None;
            }
            let now = Instant::now();
            let next_fire = state.heap.peek().map(|d| d.fire_at);
            state = match next_fire {
                None => wait(&self.wake, state),
                Some(fire_at) if fire_at <= now => return state.heap.pop(),
                Some(fire_at) => wait_for(&self.wake, state, fire_at - now),
            };
        }
    }

    pub(crate) fn shutdown(&self) {
        let mut state = lock(&self.state);
        state.shutdown = true;
        state.heap.clear();
        self.wake.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock(&self.state).heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::Occurrences;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn ids(n: usize) -> Vec<OccurrenceId> {
        let mut occurrences = Occurrences::new();
        (0..n).map(|_| occurrences.insert(())).collect()
    }

    #[test]
    fn pops_in_fire_time_order() {
        let queue = DeadlineQueue::new();
        let base = Instant::now();
        let ids = ids(3);

        queue.push(Deadline {
            fire_at: base + Duration::from_millis(30),
            occurrence: ids[0],
            label: "late",
        });
        queue.push(Deadline {
            fire_at: base + Duration::from_millis(10),
            occurrence: ids[1],
            label: "early",
        });
        queue.push(Deadline {
            fire_at: base + Duration::from_millis(20),
            occurrence: ids[2],
            label: "middle",
        });

        let order: Vec<_> = (0..3)
            .map(|_| queue.next_expired().unwrap().label)
            .collect();
        assert_eq!(order, vec!["early", "middle", "late"]);
    }

    #[test]
    fn equal_fire_times_keep_registration_order() {
        let queue = DeadlineQueue::new();
        let fire_at = Instant::now();
        let ids = ids(2);

        queue.push(Deadline {
            fire_at,
            occurrence: ids[1],
            label: "second",
        });
        queue.push(Deadline {
            fire_at,
            occurrence: ids[0],
            label: "first",
        });

        assert_eq!(queue.next_expired().unwrap().label, "first");
        assert_eq!(queue.next_expired().unwrap().label, "second");
    }

    #[test]
    fn does_not_fire_early() {
        let queue = DeadlineQueue::new();
        let start = Instant::now();
        queue.push(Deadline {
            fire_at: start + Duration::from_millis(40),
            occurrence: ids(1)[0],
            label: "x",
        });

        queue.next_expired().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn earlier_push_wakes_sleeping_timer() {
        let queue = Arc::new(DeadlineQueue::new());
        let ids = ids(2);
        let start = Instant::now();
        queue.push(Deadline {
            fire_at: start + Duration::from_secs(10),
            occurrence: ids[0],
            label: "far",
        });

        let pusher = {
            let queue = Arc::clone(&queue);
            let id = ids[1];
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                queue.push(Deadline {
                    fire_at: Instant::now() + Duration::from_millis(10),
                    occurrence: id,
                    label: "near",
                });
            })
        };

        assert_eq!(queue.next_expired().unwrap().label, "near");
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(queue.len(), 1);
        pusher.join().unwrap();
    }

    #[test]
    fn shutdown_releases_waiter() {
        let queue: Arc<DeadlineQueue<&str>> = Arc::new(DeadlineQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.next_expired().is_none())
        };

        thread::sleep(Duration::from_millis(10));
        queue.shutdown();
        assert!(waiter.join().unwrap());
    }
}
