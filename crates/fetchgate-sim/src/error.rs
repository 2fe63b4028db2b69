use fetchgate::{ConfigError, GateError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid feed host: {0:?}")]
    InvalidHost(String),

    #[error("feed session is not connected")]
    Disconnected,
}

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("batch aborted: {0}")]
    Batch(#[from] GateError),
}
