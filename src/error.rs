//! Error types for pgwire-walreceiver.
//!
//! All errors in this crate are represented by [`ReplicationError`]:
//! - Connect errors (TCP connect, startup, authentication)
//! - Protocol errors (malformed frames, unexpected result shapes, server errors
//!   while negotiating or streaming)
//! - Transport errors (I/O failure, connection closed mid-stream)
//! - Config errors (malformed connection strings)
//! - Task errors (worker terminated, channel closed)
//!
//! Every error is fatal to the streaming session it came from. The crate never
//! retries; the caller restarts a session from its last durable position.

use thiserror::Error;

use crate::lsn::{ParseLsnError, ParseTimelineError};

/// Error type for all pgwire-walreceiver operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    /// The connection could not be established or authenticated.
    #[error("connect error: {0}")]
    Connect(String),

    /// Malformed message, unexpected result, or server-reported failure.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O failure on the replication connection.
    ///
    /// Note: `std::io::Error` is not `Clone`, so we store the message.
    #[error("transport error: {0}")]
    Transport(String),

    /// Invalid configuration value or connection string.
    #[error("config error: {0}")]
    Config(String),

    /// Worker task terminated or its channel closed.
    #[error("task error: {0}")]
    Task(String),
}

impl ReplicationError {
    #[inline]
    pub fn is_connect(&self) -> bool {
        matches!(self, ReplicationError::Connect(_))
    }

    #[inline]
    pub fn is_protocol(&self) -> bool {
        matches!(self, ReplicationError::Protocol(_))
    }

    #[inline]
    pub fn is_transport(&self) -> bool {
        matches!(self, ReplicationError::Transport(_))
    }

    /// Returns `true` if reconnecting with the same configuration may succeed.
    ///
    /// Protocol and config errors need a different start position or settings.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReplicationError::Transport(_) | ReplicationError::Connect(_) | ReplicationError::Task(_)
        )
    }
}

impl From<std::io::Error> for ReplicationError {
    fn from(err: std::io::Error) -> Self {
        ReplicationError::Transport(err.to_string())
    }
}

impl From<ParseLsnError> for ReplicationError {
    fn from(err: ParseLsnError) -> Self {
        ReplicationError::Protocol(err.to_string())
    }
}

impl From<ParseTimelineError> for ReplicationError {
    fn from(err: ParseTimelineError) -> Self {
        ReplicationError::Protocol(err.to_string())
    }
}

/// Result type alias for pgwire-walreceiver operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;
