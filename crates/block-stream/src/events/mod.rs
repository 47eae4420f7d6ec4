//! Events and error types for the block stream publisher.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::domain::ConnectionState;

pub mod wire;

pub use wire::*;

/// Remote pipeline operations executed under a timeout budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineOperation {
    Open,
    StatusQuery,
    Send,
    Close,
}

impl PipelineOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::StatusQuery => "status_query",
            Self::Send => "send",
            Self::Close => "close",
        }
    }
}

/// Block stream errors.
#[derive(Debug, Error)]
pub enum BlockStreamError {
    #[error(transparent)]
    InvalidStateTransition(#[from] StateTransitionError),

    #[error("Connection is not active (state: {0:?})")]
    NotActive(ConnectionState),

    #[error("Connection has no open request pipeline")]
    PipelineUnavailable,

    #[error("Pipeline {} timed out after {timeout:?}", operation.as_str())]
    PipelineTimeout {
        operation: PipelineOperation,
        timeout: Duration,
    },

    #[error("Pipeline {} failed: {source}", operation.as_str())]
    Transport {
        operation: PipelineOperation,
        #[source]
        source: TransportError,
    },

    #[error("Operation cancelled by shutdown")]
    Cancelled,

    #[error("Block node {node} is unavailable: {reason}")]
    PeerUnavailable { node: String, reason: String },

    #[error("Connection manager is not running")]
    ManagerInactive,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BlockStreamError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::PipelineTimeout { .. })
    }
}

/// Illegal connection state transition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateTransitionError {
    #[error("Connection state cannot move backwards from {from:?} to {to:?}")]
    Downgrade {
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// Failures reported by a transport implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to connect: {0}")]
    ConnectionFailed(String),

    #[error("Stream is closed")]
    StreamClosed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Status query failed: {0}")]
    Status(String),

    #[error("Remote error: {0}")]
    Remote(String),
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse block node config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
