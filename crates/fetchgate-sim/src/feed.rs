//! Simulated historical-data feed.
//!
//! Requests are answered from tokio tasks after a fixed latency, the way a
//! vendor SDK answers from its own reader thread. A configurable share of
//! requests answers only after the coordinator's deadline for its first few
//! attempts, and another share is rejected outright.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use dashmap::DashMap;
use fetchgate::{Completion, Dispatch};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::label::BarRequest;
use crate::session::FeedSession;

/// How the simulated remote side behaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedProfile {
    /// Time to answer a well-behaved request.
    pub latency_ms: u64,
    /// Share of labels (0-100) that answer late.
    pub late_pct: u8,
    /// Attempts a late label needs before it answers in time.
    pub late_attempts: u32,
    /// Extra delay on a late answer.
    pub late_by_ms: u64,
    /// Share of labels (0-100) the feed rejects.
    pub error_pct: u8,
}

impl Default for FeedProfile {
    fn default() -> Self {
        Self {
            latency_ms: 50,
            late_pct: 20,
            late_attempts: 1,
            late_by_ms: 10_000,
            error_pct: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Response {
    Data,
    Late,
    Rejected(String),
}

impl FeedProfile {
    fn respond(&self, label: &BarRequest, attempt: u32) -> Response {
        if bucket(label, "error") < self.error_pct {
            return Response::Rejected(format!("No security definition found for {}", label.ticker));
        }
        if bucket(label, "late") < self.late_pct && attempt <= self.late_attempts {
            return Response::Late;
        }
        Response::Data
    }

    fn delay(&self, response: &Response) -> Duration {
        let latency = Duration::from_millis(self.latency_ms);
        match response {
            Response::Late => latency + Duration::from_millis(self.late_by_ms),
            _ => latency,
        }
    }
}

/// Stable 0-99 bucket per label, independent of the attempt.
fn bucket(label: &BarRequest, salt: &str) -> u8 {
    let mut hasher = DefaultHasher::new();
    salt.hash(&mut hasher);
    label.hash(&mut hasher);
    (hasher.finish() % 100) as u8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// Deterministic daily bars for every trading day the request covers.
pub fn synthesize_bars(label: &BarRequest) -> Vec<Bar> {
    let mut hasher = DefaultHasher::new();
    label.ticker.hash(&mut hasher);
    let seed = hasher.finish();
    let mut close = 20.0 + (seed % 200) as f64;

    label
        .trading_days()
        .into_iter()
        .enumerate()
        .map(|(i, date)| {
            let step = ((seed >> (i % 48)) % 7) as f64 - 3.0;
            let open = close;
            close = (open + step * 0.25).max(1.0);
            Bar {
                date,
                open,
                high: open.max(close) + 0.5,
                low: (open.min(close) - 0.5).max(0.5),
                close,
                volume: 10_000 + (seed >> (i % 32)) % 90_000,
            }
        })
        .collect()
}

pub struct SimulatedFeed {
    session: Arc<FeedSession>,
    runtime: Handle,
    profile: FeedProfile,
    shutdown: CancellationToken,
    attempts: DashMap<BarRequest, u32>,
    bars: Arc<DashMap<BarRequest, Vec<Bar>>>,
}

impl SimulatedFeed {
    pub fn new(session: Arc<FeedSession>, runtime: Handle, profile: FeedProfile) -> Self {
        Self {
            session,
            runtime,
            profile,
            shutdown: CancellationToken::new(),
            attempts: DashMap::new(),
            bars: Arc::new(DashMap::new()),
        }
    }

    pub fn profile(&self) -> &FeedProfile {
        &self.profile
    }

    /// Requests submitted for `label` so far.
    pub fn attempts(&self, label: &BarRequest) -> u32 {
        self.attempts.get(label).map(|n| *n).unwrap_or(0)
    }

    pub fn bars(&self, label: &BarRequest) -> Option<Vec<Bar>> {
        self.bars.get(label).map(|bars| bars.clone())
    }

    /// Labels that have received data.
    pub fn fetched(&self) -> usize {
        self.bars.len()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Abandon every pending response. Their completions fail, which is a
    /// no-op for requests the coordinator already timed out.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Dispatch<BarRequest> for SimulatedFeed {
    fn dispatch(&self, label: &BarRequest, completion: Completion<BarRequest>) {
        let request_id = match self.session.start_request() {
            Ok(id) => id,
            Err(e) => {
                completion.fail(e);
                return;
            }
        };
        let attempt = {
            let mut attempts = self.attempts.entry(label.clone()).or_insert(0);
            *attempts += 1;
            *attempts
        };
        let response = self.profile.respond(label, attempt);
        let delay = self.profile.delay(&response);
        tracing::debug!(request_id, %label, attempt, ?response, "Submitted historical data request");

        let bars = Arc::clone(&self.bars);
        let shutdown = self.shutdown.clone();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    completion.fail("feed shut down before answering");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match response {
                Response::Rejected(reason) => {
                    completion.fail(reason);
                }
                Response::Data | Response::Late => {
                    let label = completion.label().clone();
                    bars.insert(label.clone(), synthesize_bars(&label));
                    if !completion.succeed() {
                        tracing::debug!(request_id, %label, "Data arrived after the deadline");
                    }
                }
            }
        });
    }
}

impl Drop for SimulatedFeed {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
