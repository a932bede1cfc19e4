//! Control commands around a streaming phase: `IDENTIFY_SYSTEM`,
//! `START_REPLICATION`, and the end-of-streaming handshake that reports the
//! next timeline.

use std::time::Duration;

use crate::error::{ReplicationError, Result};
use crate::lsn::{Lsn, TimelineId};
use crate::transport::{CopyFrame, QueryResult, Readiness, ReplicationTransport};

/// How `START_REPLICATION` was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// The connection is in copy-both mode and WAL will follow.
    Streaming,
    /// The command completed without streaming anything.
    Ended,
}

/// The informational row sent after the primary ends a timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineSwitch {
    pub timeline: TimelineId,
    /// Where the next timeline starts, if the primary sent a parseable position.
    pub start: Option<Lsn>,
}

/// Answer to `IDENTIFY_SYSTEM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemIdentity {
    pub system_id: String,
    pub timeline: TimelineId,
    /// Current WAL flush position of the primary
    pub xlog_pos: Lsn,
    pub db_name: Option<String>,
}

const DRAIN_WAIT: Duration = Duration::from_secs(1);

pub fn start_replication_command(
    position: Lsn,
    timeline: TimelineId,
    slot: Option<&str>,
) -> String {
    match slot {
        Some(slot) => format!(
            "START_REPLICATION SLOT {} PHYSICAL {position} TIMELINE {timeline}",
            quote_ident(slot)
        ),
        None => format!("START_REPLICATION {position} TIMELINE {timeline}"),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Ask the primary to stream WAL from `position` on `timeline`.
pub async fn start_streaming<T: ReplicationTransport>(
    transport: &mut T,
    position: Lsn,
    timeline: TimelineId,
    slot: Option<&str>,
) -> Result<StreamMode> {
    tracing::info!(%position, %timeline, slot = ?slot, "start streaming from primary");

    let cmd = start_replication_command(position, timeline, slot);
    match transport.execute(&cmd).await? {
        QueryResult::CommandOk { .. } => Ok(StreamMode::Ended),
        QueryResult::CopyBoth => Ok(StreamMode::Streaming),
        QueryResult::Error(e) => Err(ReplicationError::Protocol(format!(
            "could not start WAL streaming: {e}"
        ))),
        other => Err(ReplicationError::Protocol(format!(
            "unexpected {} in response to START_REPLICATION",
            other.kind()
        ))),
    }
}

/// Finish a streaming phase after the primary has left copy mode.
///
/// Sends CopyDone, then reads the trailing results: an optional one-row result
/// set naming the next timeline, exactly one CommandComplete, and nothing
/// more. Returns `None` when the primary did not name a next timeline (it was
/// shut down).
pub async fn end_streaming<T: ReplicationTransport>(
    transport: &mut T,
) -> Result<Option<TimelineSwitch>> {
    transport.end_copy().await?;

    let mut res = transport.next_result().await?;
    while matches!(res, Some(QueryResult::CopyOut)) {
        drain_copy_out(transport).await?;
        res = transport.next_result().await?;
    }

    let mut switch = None;
    if let Some(QueryResult::Tuples(rs)) = &res {
        if rs.n_fields() < 2 || rs.n_rows() != 1 {
            return Err(ReplicationError::Protocol(format!(
                "unexpected result set after end-of-streaming: {} rows and {} fields",
                rs.n_rows(),
                rs.n_fields()
            )));
        }
        let timeline = TimelineId::parse(rs.value(0, 0).unwrap_or_default())?;
        let start = rs.value(0, 1).and_then(|s| Lsn::parse(s).ok());
        tracing::info!(%timeline, start = ?start, "primary switched to a new timeline");
        switch = Some(TimelineSwitch { timeline, start });

        // the result set should be followed by CommandComplete
        res = transport.next_result().await?;
    }

    match res {
        Some(QueryResult::CommandOk { .. }) => {}
        Some(QueryResult::Error(e)) => {
            return Err(ReplicationError::Protocol(format!(
                "error while ending WAL streaming: {e}"
            )));
        }
        Some(other) => {
            return Err(ReplicationError::Protocol(format!(
                "unexpected {} after end-of-streaming",
                other.kind()
            )));
        }
        None => {
            return Err(ReplicationError::Protocol(
                "missing CommandComplete after end-of-streaming".into(),
            ));
        }
    }

    if let Some(extra) = transport.next_result().await? {
        return Err(ReplicationError::Protocol(format!(
            "unexpected result after CommandComplete: {}",
            extra.kind()
        )));
    }

    Ok(switch)
}

/// Discard CopyData until the server closes its side of the copy.
async fn drain_copy_out<T: ReplicationTransport>(transport: &mut T) -> Result<()> {
    loop {
        match transport.read_frame()? {
            CopyFrame::Data(_) => {}
            CopyFrame::EndOfCopy => return Ok(()),
            CopyFrame::Empty => match transport.wait_readable(DRAIN_WAIT).await? {
                Readiness::Ready => transport.consume_input().await?,
                Readiness::TimedOut => {}
                Readiness::Interrupted => {
                    return Err(ReplicationError::Protocol(
                        "interrupted while draining copy data after end-of-streaming".into(),
                    ));
                }
            },
        }
    }
}

/// Run `IDENTIFY_SYSTEM`.
pub async fn identify_system<T: ReplicationTransport>(transport: &mut T) -> Result<SystemIdentity> {
    let rs = match transport.execute("IDENTIFY_SYSTEM").await? {
        QueryResult::Tuples(rs) => rs,
        QueryResult::Error(e) => {
            return Err(ReplicationError::Protocol(format!(
                "could not identify system: {e}"
            )));
        }
        other => {
            return Err(ReplicationError::Protocol(format!(
                "unexpected {} in response to IDENTIFY_SYSTEM",
                other.kind()
            )));
        }
    };

    if rs.n_fields() < 3 || rs.n_rows() != 1 {
        return Err(ReplicationError::Protocol(format!(
            "invalid IDENTIFY_SYSTEM response: {} rows and {} fields",
            rs.n_rows(),
            rs.n_fields()
        )));
    }

    let identity = SystemIdentity {
        system_id: rs.value(0, 0).unwrap_or_default().to_string(),
        timeline: TimelineId::parse(rs.value(0, 1).unwrap_or_default())?,
        xlog_pos: Lsn::parse(rs.value(0, 2).unwrap_or_default())?,
        db_name: rs.value(0, 3).map(str::to_string),
    };
    tracing::debug!(
        system_id = %identity.system_id,
        timeline = %identity.timeline,
        xlog_pos = %identity.xlog_pos,
        "identified primary"
    );
    Ok(identity)
}
