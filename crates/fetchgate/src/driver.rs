//! Batch retry driver - runs labeled work to completion over several rounds.
//!
//! Each round issues its work set through a fresh [`TimedPermitGate`], drains
//! it, and keeps only the labels that timed out. Those are retried with less
//! concurrency on the assumption that repeated timeouts mean the remote side
//! is overloaded. After the round ceiling the leftovers are reported as
//! permanently failed; that is logged, never raised.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::Label;
use crate::config::CoordinatorConfig;
use crate::error::{GateError, Result};
use crate::gate::{GateHandle, Interruptible, TimedPermitGate};
use crate::rate_limit::RateLimiter;
use crate::sync::lock;

/// Shrinks concurrency in proportion to the number of timeouts, clamped to
/// `[floor, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyPolicy {
    max: usize,
    floor: usize,
    divisor: usize,
}

impl ConcurrencyPolicy {
    pub fn new(max: usize, floor: usize, divisor: usize) -> Self {
        let max = max.max(1);
        Self {
            max,
            floor: floor.clamp(1, max),
            divisor: divisor.max(1),
        }
    }

    pub fn initial(&self) -> usize {
        self.max
    }

    /// Concurrency for the round after one that ended with `timed_out`
    /// timeouts at `current` concurrency. Never grows between rounds.
    pub fn next(&self, current: usize, timed_out: usize) -> usize {
        let proposed = (timed_out / self.divisor + 1).clamp(self.floor, self.max);
        proposed.min(current.max(self.floor))
    }
}

impl Default for ConcurrencyPolicy {
    fn default() -> Self {
        Self::new(5, 1, 10)
    }
}

#[derive(Debug, Default)]
struct RoundCounters {
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

/// One-shot completion for a dispatched request.
///
/// Consuming it performs the single explicit arrival for the request.
/// Dropping it unconsumed leaves the request to its deadline.
pub struct Completion<L: Label> {
    label: L,
    gate: GateHandle<L>,
    counters: Arc<RoundCounters>,
    consumed: bool,
}

impl<L: Label> Completion<L> {
    pub fn label(&self) -> &L {
        &self.label
    }

    /// The request returned data (possibly empty). Returns `false` if the
    /// deadline already claimed it.
    pub fn succeed(mut self) -> bool {
        self.consumed = true;
        let arrived = self.gate.arrive(&self.label);
        if arrived {
            self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            tracing::debug!(label = ?self.label, "Late response ignored");
        }
        arrived
    }

    /// The remote side answered with an error. The item is not retried.
    pub fn fail(mut self, reason: impl fmt::Display) -> bool {
        self.consumed = true;
        let arrived = self.gate.arrive(&self.label);
        if arrived {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(label = ?self.label, reason = %reason, "Request failed");
        }
        arrived
    }
}

impl<L: Label> Drop for Completion<L> {
    fn drop(&mut self) {
        if !self.consumed {
            tracing::warn!(label = ?self.label, "Completion dropped without a result - waiting for deadline");
        }
    }
}

impl<L: Label> fmt::Debug for Completion<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("label", &self.label)
            .field("consumed", &self.consumed)
            .finish()
    }
}

/// Submits one asynchronous request per label.
///
/// Implementations must not block until the response arrives: they hand the
/// completion to whatever callback path the SDK offers and return.
pub trait Dispatch<L: Label> {
    fn dispatch(&self, label: &L, completion: Completion<L>);
}

impl<L, F> Dispatch<L> for F
where
    L: Label,
    F: Fn(&L, Completion<L>),
{
    fn dispatch(&self, label: &L, completion: Completion<L>) {
        self(label, completion)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundSummary {
    pub round: usize,
    pub concurrency: usize,
    pub issued: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport<L> {
    pub items: usize,
    pub rounds: Vec<RoundSummary>,
    /// Still timing out after the last round. The caller decides whether to
    /// resubmit them in a later batch.
    pub permanently_failed: Vec<L>,
}

impl<L> BatchReport<L> {
    pub fn is_complete(&self) -> bool {
        self.permanently_failed.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.rounds.iter().map(|r| r.succeeded).sum()
    }

    pub fn failed(&self) -> usize {
        self.rounds.iter().map(|r| r.failed).sum()
    }
}

#[derive(Default)]
struct InterruptSlot {
    interrupted: bool,
    current: Option<Arc<dyn Interruptible>>,
}

/// Cloneable shutdown switch for a running driver.
///
/// Wakes the current round's gate and the shared rate limiter, if any.
#[derive(Clone, Default)]
pub struct Interrupter {
    slot: Arc<Mutex<InterruptSlot>>,
    limiter: Option<Arc<RateLimiter>>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        let current = {
            let mut slot = lock(&self.slot);
            slot.interrupted = true;
            slot.current.clone()
        };
        if let Some(target) = current {
            target.interrupt();
        }
        if let Some(limiter) = &self.limiter {
            limiter.interrupt();
        }
    }

    pub fn is_interrupted(&self) -> bool {
        lock(&self.slot).interrupted
    }

    fn install(&self, target: Arc<dyn Interruptible>) -> Result<InstalledTarget<'_>> {
        let mut slot = lock(&self.slot);
        if slot.interrupted {
            return Err(GateError::Interrupted);
        }
        slot.current = Some(target);
        Ok(InstalledTarget { owner: self })
    }
}

/// Clears the interrupt target when a round ends, however it ends.
struct InstalledTarget<'a> {
    owner: &'a Interrupter,
}

impl Drop for InstalledTarget<'_> {
    fn drop(&mut self) {
        lock(&self.owner.slot).current = None;
    }
}

pub struct BatchRetryDriver {
    policy: ConcurrencyPolicy,
    deadline: Duration,
    max_rounds: usize,
    rate_limiter: Option<Arc<RateLimiter>>,
    interrupter: Interrupter,
}

impl BatchRetryDriver {
    pub fn new(config: &CoordinatorConfig) -> Self {
        let rate_limiter = config
            .rate_limit
            .as_ref()
            .map(|rate| Arc::new(RateLimiter::new(rate.permits, rate.period)));
        Self {
            policy: config.policy(),
            deadline: config.deadline,
            max_rounds: config.max_rounds.max(1),
            interrupter: Interrupter {
                slot: Arc::default(),
                limiter: rate_limiter.clone(),
            },
            rate_limiter,
        }
    }

    /// Share an existing limiter, e.g. one SDK-wide request budget across
    /// several drivers.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.interrupter.limiter = Some(Arc::clone(&limiter));
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    pub fn policy(&self) -> ConcurrencyPolicy {
        self.policy
    }

    /// Drive `items` through rounds until nothing times out or the round
    /// ceiling is reached.
    ///
    /// Only an interrupt (or a closed gate, which indicates a bug) is an
    /// error; per-item timeouts and failures end up in the report.
    ///
    /// Duplicate labels are separate occurrences in the first round, but the
    /// timeout set is a set: duplicates that time out are retried once, and
    /// `permanently_failed` lists each label at most once. Pass the items
    /// through [`dedup_labels`] first for one-to-one accounting.
    pub fn run<L, D>(&self, items: impl IntoIterator<Item = L>, dispatcher: &D) -> Result<BatchReport<L>>
    where
        L: Label,
        D: Dispatch<L> + ?Sized,
    {
        let mut work: Vec<L> = items.into_iter().collect();
        let items = work.len();
        let mut rounds = Vec::new();
        let mut concurrency = self.policy.initial();

        let mut round = 0;
        while !work.is_empty() {
            round += 1;
            let (summary, timed_out) = self.run_round(round, concurrency, &work, dispatcher)?;
            rounds.push(summary);

            if timed_out.is_empty() {
                break;
            }
            if round >= self.max_rounds {
                tracing::error!(
                    rounds = round,
                    remaining = timed_out.len(),
                    labels = ?timed_out,
                    "Items still time out after the last retry round"
                );
                return Ok(BatchReport {
                    items,
                    rounds,
                    permanently_failed: timed_out,
                });
            }

            concurrency = self.policy.next(concurrency, timed_out.len());
            tracing::info!(
                items = timed_out.len(),
                permits = concurrency,
                "Retrying timed-out items"
            );
            work = timed_out;
        }

        Ok(BatchReport {
            items,
            rounds,
            permanently_failed: Vec::new(),
        })
    }

    fn run_round<L, D>(
        &self,
        round: usize,
        concurrency: usize,
        work: &[L],
        dispatcher: &D,
    ) -> Result<(RoundSummary, Vec<L>)>
    where
        L: Label,
        D: Dispatch<L> + ?Sized,
    {
        let started = Instant::now();
        let gate = TimedPermitGate::new(concurrency, self.deadline);
        let _installed = self.interrupter.install(gate.interruptible())?;
        let counters = Arc::new(RoundCounters::default());

        for label in work {
            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire()?;
            }
            let registered = gate.register(label.clone());
            if registered.is_ok() {
                let completion = Completion {
                    label: label.clone(),
                    gate: gate.handle(),
                    counters: Arc::clone(&counters),
                    consumed: false,
                };
                dispatcher.dispatch(label, completion);
            }
            // The token only paces submissions, so it goes back right away.
            if let Some(limiter) = &self.rate_limiter {
                limiter.release();
            }
            registered?;
        }

        gate.drain()?;

        let timed_out: Vec<L> = gate.timeout_labels().into_iter().collect();
        let summary = RoundSummary {
            round,
            concurrency,
            issued: work.len(),
            succeeded: counters.succeeded.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            timed_out: timed_out.len(),
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        tracing::info!(
            round,
            issued = summary.issued,
            concurrency,
            timed_out = summary.timed_out,
            elapsed_ms = summary.elapsed_ms,
            "Round finished"
        );
        Ok((summary, timed_out))
    }
}

/// Distinct labels among `items`, preserving first-seen order.
pub fn dedup_labels<L: Label>(items: impl IntoIterator<Item = L>) -> Vec<L> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|label| seen.insert(label.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn config(concurrency: usize, deadline_ms: u64, max_rounds: usize) -> CoordinatorConfig {
        CoordinatorConfig {
            concurrency,
            deadline: Duration::from_millis(deadline_ms),
            max_rounds,
            min_concurrency: 1,
            shrink_divisor: 10,
            rate_limit: None,
        }
    }

    #[test]
    fn policy_matches_reference_heuristic() {
        let policy = ConcurrencyPolicy::new(5, 1, 10);
        assert_eq!(policy.initial(), 5);
        assert_eq!(policy.next(5, 20), 3);
        assert_eq!(policy.next(5, 9), 1);
        assert_eq!(policy.next(5, 400), 5);
        // Never grows past the current round.
        assert_eq!(policy.next(2, 400), 2);
    }

    #[test]
    fn policy_respects_floor() {
        let policy = ConcurrencyPolicy::new(8, 3, 10);
        assert_eq!(policy.next(8, 0), 3);
        assert_eq!(policy.next(3, 1), 3);
    }

    #[test]
    fn empty_batch_runs_no_rounds() {
        let driver = BatchRetryDriver::new(&config(5, 100, 10));
        let report = driver
            .run(Vec::<u32>::new(), &|_: &u32, c: Completion<u32>| {
                c.succeed();
            })
            .unwrap();
        assert!(report.rounds.is_empty());
        assert!(report.is_complete());
    }

    #[test]
    fn single_round_when_everything_answers() {
        let driver = BatchRetryDriver::new(&config(3, 1_000, 10));
        let report = driver
            .run(0..20u32, &|_: &u32, c: Completion<u32>| {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(1));
                    c.succeed();
                });
            })
            .unwrap();

        assert_eq!(report.rounds.len(), 1);
        assert_eq!(report.succeeded(), 20);
        assert!(report.is_complete());
    }

    #[test]
    fn explicit_failures_are_not_retried() {
        let driver = BatchRetryDriver::new(&config(2, 1_000, 10));
        let report = driver
            .run(0..6u32, &|label: &u32, c: Completion<u32>| {
                if label % 2 == 0 {
                    c.fail("invalid symbol");
                } else {
                    c.succeed();
                }
            })
            .unwrap();

        assert_eq!(report.rounds.len(), 1);
        assert_eq!(report.failed(), 3);
        assert_eq!(report.succeeded(), 3);
    }

    #[test]
    fn timed_out_items_are_retried_until_they_answer() {
        let attempts = Arc::new(Mutex::new(std::collections::HashMap::<u32, u32>::new()));
        let driver = BatchRetryDriver::new(&config(4, 20, 10));

        let seen = Arc::clone(&attempts);
        let report = driver
            .run(0..8u32, &move |label: &u32, c: Completion<u32>| {
                let attempt = {
                    let mut seen = lock(&seen);
                    let n = seen.entry(*label).or_default();
                    *n += 1;
                    *n
                };
                // Odd labels stay silent on their first attempt.
                if label % 2 == 1 && attempt == 1 {
                    drop(c);
                } else {
                    c.succeed();
                }
            })
            .unwrap();

        assert_eq!(report.rounds.len(), 2);
        assert_eq!(report.rounds[0].timed_out, 4);
        assert_eq!(report.rounds[1].issued, 4);
        assert_eq!(report.rounds[1].concurrency, 1);
        assert!(report.is_complete());
        assert_eq!(report.succeeded(), 8);
    }

    #[test]
    fn stops_at_round_ceiling() {
        let driver = BatchRetryDriver::new(&config(2, 5, 3));
        let report = driver
            .run(["a", "b"], &|_: &&'static str, c: Completion<&'static str>| drop(c))
            .unwrap();

        assert_eq!(report.rounds.len(), 3);
        let mut failed = report.permanently_failed.clone();
        failed.sort();
        assert_eq!(failed, vec!["a", "b"]);
    }

    #[test]
    fn duplicate_timeouts_merge_into_one_retry() {
        let driver = BatchRetryDriver::new(&config(2, 5, 2));
        let report = driver
            .run([7u32, 7], &|_: &u32, c: Completion<u32>| drop(c))
            .unwrap();

        assert_eq!(report.items, 2);
        assert_eq!(report.rounds[0].issued, 2);
        assert_eq!(report.rounds[0].timed_out, 1);
        assert_eq!(report.rounds[1].issued, 1);
        assert_eq!(report.permanently_failed, vec![7]);
    }

    #[test]
    fn rate_limiter_paces_submissions() {
        let mut cfg = config(10, 1_000, 1);
        cfg.rate_limit = Some(crate::config::RateLimitConfig {
            permits: 2,
            period: Duration::from_millis(30),
        });
        let driver = BatchRetryDriver::new(&cfg);

        let start = Instant::now();
        let report = driver
            .run(0..6u32, &|_: &u32, c: Completion<u32>| {
                c.succeed();
            })
            .unwrap();
        assert!(report.is_complete());
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn interrupt_before_run_fails_fast() {
        let driver = BatchRetryDriver::new(&config(1, 1_000, 10));
        driver.interrupter().interrupt();

        let result = driver.run([1u32], &|_: &u32, c: Completion<u32>| {
            c.succeed();
        });
        assert_eq!(result.unwrap_err(), GateError::Interrupted);
    }

    #[test]
    fn interrupt_unblocks_running_round() {
        let driver = BatchRetryDriver::new(&config(1, 60_000, 10));
        let interrupter = driver.interrupter();
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            interrupter.interrupt();
        });

        let start = Instant::now();
        let result = driver.run([1u32, 2, 3], &|_: &u32, c: Completion<u32>| drop(c));
        assert_eq!(result.unwrap_err(), GateError::Interrupted);
        assert!(start.elapsed() < Duration::from_secs(5));
        trigger.join().unwrap();
    }

    #[test]
    fn dedup_keeps_first_seen_order() {
        assert_eq!(dedup_labels(["b", "a", "b", "c", "a"]), vec!["b", "a", "c"]);
    }

    #[test]
    fn report_serializes_round_summaries() {
        let report = BatchReport {
            items: 100,
            rounds: vec![
                RoundSummary {
                    round: 1,
                    concurrency: 5,
                    issued: 100,
                    succeeded: 78,
                    failed: 2,
                    timed_out: 20,
                    elapsed_ms: 5120,
                },
                RoundSummary {
                    round: 2,
                    concurrency: 3,
                    issued: 20,
                    succeeded: 20,
                    failed: 0,
                    timed_out: 0,
                    elapsed_ms: 640,
                },
            ],
            permanently_failed: Vec::<String>::new(),
        };

        insta::assert_json_snapshot!(report, @r#"
        {
          "items": 100,
          "rounds": [
            {
              "round": 1,
              "concurrency": 5,
              "issued": 100,
              "succeeded": 78,
              "failed": 2,
              "timed_out": 20,
              "elapsed_ms": 5120
            },
            {
              "round": 2,
              "concurrency": 3,
              "issued": 20,
              "succeeded": 20,
              "failed": 0,
              "timed_out": 0,
              "elapsed_ms": 640
            }
          ],
          "permanently_failed": []
        }
        "#);
    }
}
