//! Simulated market-data client built on the fetchgate coordinator.
//!
//! - [`label`]: historical bar requests used as work-item labels
//! - [`session`]: connect/shutdown lifecycle of the feed connection
//! - [`feed`]: a callback-style feed whose responses can be late or rejected
//! - [`Simulation`]: wires a feed to a [`BatchRetryDriver`]

pub mod error;
pub mod feed;
pub mod label;
pub mod session;

use std::path::Path;
use std::sync::Arc;

use fetchgate::{BatchReport, BatchRetryDriver, CoordinatorConfig, Interrupter, dedup_labels};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

pub use error::{SessionError, SimError};
pub use feed::{Bar, FeedProfile, SimulatedFeed};
pub use label::BarRequest;
pub use session::FeedSession;

const DEFAULT_HOST: &str = "127.0.0.1:7496";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub host: String,
    pub coordinator: CoordinatorConfig,
    pub feed: FeedProfile,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            coordinator: CoordinatorConfig::default(),
            feed: FeedProfile::default(),
        }
    }
}

impl SimConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SimError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| fetchgate::ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(fetchgate::ConfigError::from)?;
        config.coordinator.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Serialize)]
pub struct SimReport {
    pub host: String,
    pub requests: u64,
    pub fetched: usize,
    #[serde(flatten)]
    pub batch: BatchReport<BarRequest>,
}

pub struct Simulation {
    session: Arc<FeedSession>,
    feed: SimulatedFeed,
    driver: BatchRetryDriver,
}

impl Simulation {
    pub fn new(config: &SimConfig, runtime: Handle) -> Result<Self, SimError> {
        config.coordinator.validate()?;
        let session = Arc::new(FeedSession::connect(config.host.clone())?);
        let feed = SimulatedFeed::new(Arc::clone(&session), runtime, config.feed.clone());
        Ok(Self {
            session,
            feed,
            driver: BatchRetryDriver::new(&config.coordinator),
        })
    }

    pub fn interrupter(&self) -> Interrupter {
        self.driver.interrupter()
    }

    pub fn feed(&self) -> &SimulatedFeed {
        &self.feed
    }

    /// Fetch every distinct request. Blocks the calling thread, so call it
    /// from outside the runtime's worker threads.
    pub fn run(&self, requests: impl IntoIterator<Item = BarRequest>) -> Result<SimReport, SimError> {
        let requests = dedup_labels(requests);
        tracing::info!(requests = requests.len(), host = self.session.host(), "Starting batch");
        let batch = self.driver.run(requests, &self.feed)?;

        if !batch.is_complete() {
            tracing::warn!(
                count = batch.permanently_failed.len(),
                "Some requests never answered in time; resubmit them in a later batch"
            );
        }
        Ok(SimReport {
            host: self.session.host().to_string(),
            requests: self.session.requests_issued(),
            fetched: self.feed.fetched(),
            batch,
        })
    }

    /// Abandon outstanding responses and close the session.
    pub fn shutdown(&self) {
        self.feed.shutdown();
        self.session.shutdown();
    }
}
