//! The connection interface a streaming session runs on.
//!
//! [`ReplicationTransport`] is the narrow surface the session needs from a
//! replication connection: simple-query execution for the control commands,
//! and frame-level access to copy-both mode. [`crate::client::PgConnection`]
//! implements it over a tokio byte stream; tests implement it with scripts.

use std::time::Duration;

use bytes::Bytes;

use crate::error::Result;

/// Outcome of a non-blocking frame read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyFrame {
    /// One complete CopyData payload.
    Data(Bytes),
    /// Nothing buffered yet.
    Empty,
    /// The server left copy mode (CopyDone, or an error that ended the copy).
    EndOfCopy,
}

/// Outcome of waiting for the connection to become readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
    /// The wait was cut short by a shutdown request.
    Interrupted,
}

/// Rows of a text-format result set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    pub fn n_fields(&self) -> usize {
        self.columns.len()
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    /// Value at (`row`, `col`); `None` if out of range or NULL.
    pub fn value(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row)?.get(col)?.as_deref()
    }
}

/// One result of a simple-query command, in the order the server produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResult {
    /// CommandComplete without a preceding result set.
    CommandOk { tag: String },
    /// A complete result set.
    Tuples(ResultSet),
    /// The connection entered copy-both mode.
    CopyBoth,
    /// Only the client side of a copy is still open.
    CopyIn,
    /// Only the server side of a copy is still open.
    CopyOut,
    /// ErrorResponse, rendered as text.
    Error(String),
}

impl QueryResult {
    /// Short name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            QueryResult::CommandOk { .. } => "CommandComplete",
            QueryResult::Tuples(_) => "result set",
            QueryResult::CopyBoth => "CopyBothResponse",
            QueryResult::CopyIn => "CopyInResponse",
            QueryResult::CopyOut => "CopyOutResponse",
            QueryResult::Error(_) => "ErrorResponse",
        }
    }
}

/// Connection operations used by [`crate::session::StreamSession`].
///
/// Implementations are used from a single task; no method is called
/// concurrently with another.
#[allow(async_fn_in_trait)]
pub trait ReplicationTransport {
    /// Send a simple query and return its final result. Stops early when the
    /// connection enters a copy mode.
    async fn execute(&mut self, command: &str) -> Result<QueryResult>;

    /// Next pending result of the current command, or `None` once the server
    /// is ready for a new command.
    async fn next_result(&mut self) -> Result<Option<QueryResult>>;

    /// Take one frame from already-received input without blocking.
    fn read_frame(&mut self) -> Result<CopyFrame>;

    /// Read whatever the socket has available into the input buffer without
    /// waiting for more.
    async fn consume_input(&mut self) -> Result<()>;

    /// Send one CopyData frame and flush it.
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Close the client side of the copy (CopyDone).
    async fn end_copy(&mut self) -> Result<()>;

    /// Wait up to `timeout` for input.
    async fn wait_readable(&mut self, timeout: Duration) -> Result<Readiness>;
}
