use thiserror::Error;

/// Errors surfaced by the blocking coordination primitives.
///
/// Timeouts are not errors: they are recorded on the gate and drive the next
/// retry round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GateError {
    /// `register` was called after the tracker had been drained.
    #[error("tracker is closed: no registrations accepted after drain")]
    Closed,

    /// A blocked `register`, `drain` or `acquire` was woken by an interrupt.
    #[error("interrupted while waiting")]
    Interrupted,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GateError>;
