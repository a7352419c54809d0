//! Error types for the reader and its repository.

use alloy::primitives::Address;
use thiserror::Error;

use crate::model::EpochStatus;

/// Errors surfaced by chain access, adapters and the reconciliation passes.
#[derive(Debug, Error)]
pub enum ReaderError {
    /// The shared cancellation token fired. Not a failure.
    #[error("cancelled")]
    Cancelled,
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("subscription error: {0}")]
    Subscription(String),
    #[error("adapter error: {0}")]
    Adapter(String),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("chain id mismatch: expected {expected}, got {actual}")]
    ChainIdMismatch { expected: u64, actual: u64 },
}

impl ReaderError {
    /// True when this error only reports shutdown.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReaderError::Cancelled)
    }
}

impl From<serde_json::Error> for ReaderError {
    fn from(e: serde_json::Error) -> Self {
        ReaderError::Decode(e.to_string())
    }
}

impl From<alloy::sol_types::Error> for ReaderError {
    fn from(e: alloy::sol_types::Error) -> Self {
        ReaderError::Decode(e.to_string())
    }
}

/// Errors produced by a [crate::repository::Repository] implementation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("application {0} not found")]
    ApplicationNotFound(Address),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("epoch {index} of {application}: cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        application: Address,
        index: u64,
        from: EpochStatus,
        to: EpochStatus,
    },
}

pub type Result<T, E = ReaderError> = std::result::Result<T, E>;
