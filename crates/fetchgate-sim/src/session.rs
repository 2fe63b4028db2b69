//! Feed session lifecycle.
//!
//! The session is connected once, shared by every in-flight request, and
//! shut down when the last reference drops.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::SessionError;

#[derive(Debug)]
pub struct FeedSession {
    host: String,
    connected: AtomicBool,
    next_request: AtomicU64,
}

impl FeedSession {
    pub fn connect(host: impl Into<String>) -> Result<Self, SessionError> {
        let host = host.into();
        if host.trim().is_empty() || host.contains(char::is_whitespace) {
            return Err(SessionError::InvalidHost(host));
        }
        tracing::info!(%host, "Feed session connected");
        Ok(Self {
            host,
            connected: AtomicBool::new(true),
            next_request: AtomicU64::new(1),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Allocate a request id; fails once the session has been shut down.
    pub fn start_request(&self) -> Result<u64, SessionError> {
        if !self.is_connected() {
            return Err(SessionError::Disconnected);
        }
        Ok(self.next_request.fetch_add(1, Ordering::Relaxed))
    }

    pub fn requests_issued(&self) -> u64 {
        self.next_request.load(Ordering::Relaxed) - 1
    }

    /// Idempotent.
    pub fn shutdown(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            tracing::info!(
                host = %self.host,
                requests = self.requests_issued(),
                "Feed session shut down"
            );
        }
    }
}

impl Drop for FeedSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
