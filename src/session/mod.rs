//! One streaming phase on a borrowed replication connection.
//!
//! ```text
//!            start() / Streaming            EndOfCopy from primary
//!   Idle ───────────────────────► Streaming ─────────────────────► Ended
//!     │                                                              ▲
//!     └──────────────── start() / command completed ─────────────────┘
//! ```
//!
//! A session never retries and never reconnects. After `Ended`, call
//! [`StreamSession::finish`] to learn the next timeline, then open a new
//! session (on the same connection) if streaming should continue.

pub mod negotiator;

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::error::{ReplicationError, Result};
use crate::lsn::{Lsn, TimelineId};
use crate::protocol::replication::{self, ReplicationMessage};
use crate::state::ReplicationState;
use crate::transport::{CopyFrame, QueryResult, Readiness, ReplicationTransport};

pub use negotiator::{StreamMode, SystemIdentity, TimelineSwitch, identify_system};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Streaming,
    Ended,
}

/// Outcome of [`StreamSession::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// One raw copy-both frame, ready for [`StreamSession::process_message`].
    Frame(Bytes),
    /// Nothing arrived in time, or the wait was interrupted.
    NoData,
    /// The primary ended the stream; the session is now `Ended`.
    EndOfStream,
}

pub struct StreamSession<'c, T: ReplicationTransport> {
    transport: &'c mut T,
    state: SessionState,
    slot: Option<String>,
    timeline: Option<TimelineId>,
    status: ReplicationState,
    streamed: bool,
    last_reply: Option<Instant>,
}

impl<'c, T: ReplicationTransport> StreamSession<'c, T> {
    pub fn new(transport: &'c mut T) -> Self {
        Self {
            transport,
            state: SessionState::Idle,
            slot: None,
            timeline: None,
            status: ReplicationState::new(),
            streamed: false,
            last_reply: None,
        }
    }

    /// Stream through a physical replication slot.
    pub fn with_slot(mut self, slot: impl Into<String>) -> Self {
        self.slot = Some(slot.into());
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn status(&self) -> &ReplicationState {
        &self.status
    }

    /// Timeline requested by [`start`](Self::start).
    pub fn timeline(&self) -> Option<TimelineId> {
        self.timeline
    }

    /// Issue `START_REPLICATION` and enter `Streaming` or `Ended`.
    pub async fn start(&mut self, position: Lsn, timeline: TimelineId) -> Result<StreamMode> {
        if self.state != SessionState::Idle {
            return Err(ReplicationError::Protocol(format!(
                "cannot start streaming: session is {:?}",
                self.state
            )));
        }

        let slot = self.slot.as_deref();
        let mode = negotiator::start_streaming(&mut *self.transport, position, timeline, slot).await?;
        self.timeline = Some(timeline);
        self.state = match mode {
            StreamMode::Streaming => {
                self.streamed = true;
                self.last_reply = None;
                SessionState::Streaming
            }
            StreamMode::Ended => {
                tracing::info!(%position, %timeline, "primary has nothing to stream");
                SessionState::Ended
            }
        };
        Ok(mode)
    }

    /// Pull the next frame from the connection.
    ///
    /// With a non-zero `timeout`, waits at most that long for input. A zero
    /// timeout only picks up what the socket already holds.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Received> {
        if self.state != SessionState::Streaming {
            return Err(ReplicationError::Protocol(format!(
                "cannot receive: session is {:?}",
                self.state
            )));
        }

        match self.transport.read_frame()? {
            CopyFrame::Data(frame) => return Ok(Received::Frame(frame)),
            CopyFrame::EndOfCopy => return self.end_of_copy().await,
            CopyFrame::Empty => {}
        }

        if !timeout.is_zero() {
            match self.transport.wait_readable(timeout).await? {
                Readiness::Ready => {}
                Readiness::TimedOut | Readiness::Interrupted => return Ok(Received::NoData),
            }
        }

        // Now that we've consumed some input, try again
        self.transport.consume_input().await?;
        match self.transport.read_frame()? {
            CopyFrame::Data(frame) => Ok(Received::Frame(frame)),
            CopyFrame::EndOfCopy => self.end_of_copy().await,
            CopyFrame::Empty => Ok(Received::NoData),
        }
    }

    async fn end_of_copy(&mut self) -> Result<Received> {
        match self.transport.next_result().await? {
            Some(QueryResult::CommandOk { .. } | QueryResult::CopyIn) => {
                tracing::info!(
                    wal_end = %self.status.latest_wal_end,
                    "replication terminated by primary"
                );
                self.state = SessionState::Ended;
                Ok(Received::EndOfStream)
            }
            Some(QueryResult::Error(e)) => Err(ReplicationError::Protocol(format!(
                "could not receive data from WAL stream: {e}"
            ))),
            Some(other) => Err(ReplicationError::Protocol(format!(
                "could not receive data from WAL stream: unexpected {}",
                other.kind()
            ))),
            None => Err(ReplicationError::Protocol(
                "could not receive data from WAL stream: no result after end of copy".into(),
            )),
        }
    }

    /// Decode a frame and apply it to the session state.
    ///
    /// A keepalive that asks for a reply is answered before this returns. The
    /// decoded message goes back to the caller, which owns the WAL payload.
    pub async fn process_message(&mut self, frame: Bytes) -> Result<ReplicationMessage> {
        let msg = replication::decode(frame)?;
        match &msg {
            ReplicationMessage::WalData(w) => {
                tracing::debug!(
                    bytes = w.data.len(),
                    data_start = %w.data_start,
                    wal_end = %w.wal_end,
                    send_time = w.server_time_micros,
                    "received WAL block"
                );
            }
            ReplicationMessage::Keepalive(k) => {
                tracing::debug!(
                    wal_end = %k.wal_end,
                    send_time = k.server_time_micros,
                    reply_requested = k.reply_requested,
                    "keepalive"
                );
            }
            ReplicationMessage::Unrecognized { tag } => {
                tracing::debug!(tag = *tag, "ignoring unrecognized replication message");
                return Ok(msg);
            }
        }

        self.status.apply(&msg);
        if msg.requires_reply() {
            self.send_reply(false).await?;
        }
        Ok(msg)
    }

    /// Send a status reply built from the current state.
    pub async fn send_reply(&mut self, request_reply: bool) -> Result<()> {
        let reply = self.status.reply(request_reply);
        tracing::debug!(
            write = %reply.write,
            flush = %reply.flush,
            apply = %reply.apply,
            request_reply,
            "send status reply"
        );
        self.transport.write_frame(&reply.encode()).await?;
        self.last_reply = Some(Instant::now());
        Ok(())
    }

    /// `true` if no status reply went out in this streaming phase yet, or the
    /// last one is at least `interval` old.
    pub fn reply_due(&self, interval: Duration) -> bool {
        self.last_reply.is_none_or(|at| at.elapsed() >= interval)
    }

    /// Close our side of the copy without waiting for the primary. The session
    /// is `Ended` afterwards and cannot be finished.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state != SessionState::Streaming {
            return Ok(());
        }
        tracing::info!(wal_end = %self.status.latest_wal_end, "stop streaming");
        self.state = SessionState::Ended;
        self.streamed = false;
        self.transport.end_copy().await
    }

    /// Complete the end-of-streaming handshake after the primary ended the
    /// stream, and report the next timeline if there is one.
    pub async fn finish(&mut self) -> Result<Option<TimelineSwitch>> {
        if self.state != SessionState::Ended || !self.streamed {
            return Err(ReplicationError::Protocol(format!(
                "cannot finish streaming: session is {:?}",
                self.state
            )));
        }
        self.streamed = false;
        negotiator::end_streaming(&mut *self.transport).await
    }
}
