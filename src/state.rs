//! Positions tracked by a streaming session.

use crate::lsn::Lsn;
use crate::protocol::replication::{ReplicationMessage, StatusReply};

/// Last-known progress of the stream, updated from every server message and
/// read back when building status replies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationState {
    /// WAL end reported by the most recent WAL data or keepalive
    pub latest_wal_end: Lsn,
    /// Send time of the most recent WAL data or keepalive (µs since 2000-01-01)
    pub latest_send_time: i64,
    /// WAL data and keepalive messages applied so far
    pub messages: u64,
    /// WAL payload bytes received so far
    pub wal_bytes: u64,
}

impl ReplicationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a decoded message. Unrecognized frames leave the state untouched.
    pub fn apply(&mut self, msg: &ReplicationMessage) {
        let (wal_end, send_time) = match msg {
            ReplicationMessage::WalData(w) => {
                self.wal_bytes += w.data.len() as u64;
                (w.wal_end, w.server_time_micros)
            }
            ReplicationMessage::Keepalive(k) => (k.wal_end, k.server_time_micros),
            ReplicationMessage::Unrecognized { .. } => return,
        };

        if wal_end < self.latest_wal_end {
            tracing::warn!(
                previous = %self.latest_wal_end,
                reported = %wal_end,
                "primary reported a WAL end behind the previous one"
            );
        }
        self.latest_wal_end = wal_end;
        self.latest_send_time = send_time;
        self.messages += 1;
    }

    /// Status reply for the current state.
    ///
    /// Write, flush and apply all report `latest_wal_end`, and the client time
    /// echoes the primary's last send time.
    pub fn reply(&self, reply_requested: bool) -> StatusReply {
        StatusReply::at(self.latest_wal_end, self.latest_send_time, reply_requested)
    }
}
