//! Error types for the library seams.
//!
//! The taxonomy matters more than the variants: `HubError` is
//! transient-retryable (callers degrade to "no data"), `ExecutionError` is
//! caught at the agent boundary with state rolled back, and
//! `OrchestratorError` covers fatal-skip conditions during bot creation and
//! restore. Risk rejections are NOT errors - `validate_order` returns them
//! as a normal negative result.

use thiserror::Error;

/// Errors from the market data hub.
#[derive(Debug, Error)]
pub enum HubError {
    /// Stream and/or cache could not be established within the retry budget.
    #[error("connection failed after {attempts} attempts: {reason}")]
    Connection { attempts: u32, reason: String },

    /// Hub has been closed.
    #[error("hub is closed")]
    Closed,
}

/// Errors from the cache backend. Transient by definition; the hub retries
/// a bounded number of times before degrading.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache i/o error: {0}")]
    Io(String),

    #[error("cache connection closed")]
    ConnectionClosed,
}

/// Errors from the execution client.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Order rejected by the exchange or execution client.
    #[error("order rejected: {0}")]
    Rejected(String),

    /// Transport failure talking to the exchange.
    #[error("transport error: {0}")]
    Transport(String),

    /// No market price available to fill a simulated order.
    #[error("no price available for {0}")]
    NoPrice(String),
}

impl From<reqwest::Error> for ExecutionError {
    fn from(e: reqwest::Error) -> Self {
        ExecutionError::Transport(e.to_string())
    }
}

/// Errors from bot lifecycle management.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Strategy name not present in the registry.
    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    /// Strategy constructor rejected its parameters.
    #[error("invalid strategy params for {name}: {reason}")]
    InvalidStrategyParams { name: String, reason: String },

    #[error("unknown bot: {0}")]
    UnknownBot(uuid::Uuid),

    #[error("bot {0} is already running")]
    AlreadyRunning(uuid::Uuid),

    /// Persistence collaborator failure.
    #[error("persistence error: {0}")]
    Persistence(String),
}
