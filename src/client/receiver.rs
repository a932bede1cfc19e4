use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, Result};
use crate::lsn::{Lsn, TimelineId};
use crate::protocol::replication::ReplicationMessage;
use crate::session::{Received, StreamMode, StreamSession, identify_system};

use super::connection::PgConnection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalEvent {
    WalData {
        data_start: Lsn,
        wal_end: Lsn,
        server_time_micros: i64,
        /// Bytes from `data_start` to the next WAL page boundary
        next_page_boundary: u64,
        data: Bytes,
    },
    KeepAlive {
        wal_end: Lsn,
        server_time_micros: i64,
        reply_requested: bool,
    },
    /// The primary ended the previous timeline; streaming continues on
    /// `timeline` from `start`.
    TimelineSwitch { timeline: TimelineId, start: Lsn },
    /// Streaming is over. `next_timeline` is set when the primary named one but
    /// following it is disabled.
    Ended { next_timeline: Option<TimelineId> },
}

impl WalEvent {
    fn from_message(msg: ReplicationMessage) -> Option<Self> {
        match msg {
            ReplicationMessage::WalData(w) => Some(WalEvent::WalData {
                data_start: w.data_start,
                wal_end: w.wal_end,
                server_time_micros: w.server_time_micros,
                next_page_boundary: w.next_page_boundary,
                data: w.data,
            }),
            ReplicationMessage::Keepalive(k) => Some(WalEvent::KeepAlive {
                wal_end: k.wal_end,
                server_time_micros: k.server_time_micros,
                reply_requested: k.reply_requested,
            }),
            ReplicationMessage::Unrecognized { .. } => None,
        }
    }
}

pub type WalEventReceiver = mpsc::Receiver<Result<WalEvent>>;

/// Streams WAL from a primary on a background task.
pub struct WalReceiver {
    rx: WalEventReceiver,
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WalReceiver {
    /// Connect to the primary and start the streaming task.
    ///
    /// Connection and authentication errors are returned here; anything later
    /// arrives through [`recv`](Self::recv).
    pub async fn connect(cfg: ReplicationConfig) -> Result<Self> {
        let (tx, rx) = mpsc::channel(cfg.buffer_events.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);

        let conn = PgConnection::connect(&cfg)
            .await?
            .with_interrupt(stop_rx.clone());

        let join = tokio::spawn(async move {
            let mut worker = Worker {
                cfg,
                stop_rx,
                out: tx,
            };
            if let Err(e) = worker.run_to_end(conn).await {
                tracing::error!("WAL receiver terminated with error: {e}");
            }
        });

        Ok(Self { rx, stop_tx, join })
    }

    /// Receive the next event (or the error that ended streaming).
    pub async fn recv(&mut self) -> Result<WalEvent> {
        match self.rx.recv().await {
            Some(Ok(ev)) => Ok(ev),
            Some(Err(e)) => Err(e),
            None => Err(ReplicationError::Task("WAL receiver channel closed".into())),
        }
    }

    /// Ask the worker to stop. Events already queued can still be received.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Wait for the worker task to exit.
    pub async fn join(self) -> Result<()> {
        self.join
            .await
            .map_err(|e| ReplicationError::Task(format!("join error: {e}")))
    }
}

struct Worker {
    cfg: ReplicationConfig,
    stop_rx: watch::Receiver<bool>,
    out: mpsc::Sender<Result<WalEvent>>,
}

impl Worker {
    async fn run_to_end(&mut self, mut conn: PgConnection<TcpStream>) -> Result<()> {
        match self.run(&mut conn).await {
            Ok(()) => {
                let _ = conn.close().await;
                Ok(())
            }
            Err(e) => {
                let _ = self.out.send(Err(e.clone())).await;
                Err(e)
            }
        }
    }

    async fn run(&mut self, conn: &mut PgConnection<TcpStream>) -> Result<()> {
        let (mut position, mut timeline) = match (self.cfg.start_lsn, self.cfg.timeline) {
            (Some(pos), Some(tli)) => (pos, tli),
            (pos, tli) => {
                let id = identify_system(&mut *conn).await?;
                (pos.unwrap_or(id.xlog_pos), tli.unwrap_or(id.timeline))
            }
        };

        loop {
            let mut session = StreamSession::new(&mut *conn);
            if let Some(slot) = &self.cfg.slot {
                session = session.with_slot(slot.clone());
            }

            if session.start(position, timeline).await? == StreamMode::Ended {
                self.emit(WalEvent::Ended {
                    next_timeline: None,
                })
                .await;
                return Ok(());
            }

            if !self.stream(&mut session).await? {
                return Ok(());
            }

            let last = session.status().latest_wal_end;
            match session.finish().await? {
                Some(switch) if self.cfg.follow_timeline_switch => {
                    timeline = switch.timeline;
                    position = switch.start.unwrap_or(last);
                    tracing::info!(%timeline, %position, "following timeline switch");
                    let ev = WalEvent::TimelineSwitch {
                        timeline,
                        start: position,
                    };
                    if !self.emit(ev).await {
                        return Ok(());
                    }
                }
                switch => {
                    self.emit(WalEvent::Ended {
                        next_timeline: switch.map(|s| s.timeline),
                    })
                    .await;
                    return Ok(());
                }
            }
        }
    }

    /// Pump one streaming phase. Returns `false` if streaming was stopped
    /// locally, `true` if the primary ended it.
    async fn stream(
        &mut self,
        session: &mut StreamSession<'_, PgConnection<TcpStream>>,
    ) -> Result<bool> {
        loop {
            if *self.stop_rx.borrow() {
                session.stop().await?;
                return Ok(false);
            }

            // nothing to report until this phase has seen a message
            if session.status().messages > 0 && session.reply_due(self.cfg.status_interval) {
                session.send_reply(false).await?;
            }

            match session.receive(self.cfg.wait_timeout).await? {
                Received::Frame(frame) => {
                    let msg = session.process_message(frame).await?;
                    if let Some(ev) = WalEvent::from_message(msg)
                        && !self.emit(ev).await
                    {
                        tracing::debug!("event consumer dropped, stopping");
                        session.stop().await?;
                        return Ok(false);
                    }
                }
                Received::NoData => {}
                Received::EndOfStream => return Ok(true),
            }
        }
    }

    /// `false` once the consumer is gone.
    async fn emit(&self, ev: WalEvent) -> bool {
        self.out.send(Ok(ev)).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn backend(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut b = Vec::with_capacity(payload.len() + 5);
        b.put_u8(tag);
        b.put_i32(payload.len() as i32 + 4);
        b.extend_from_slice(payload);
        b
    }

    fn rows(names: &[&str], values: &[&str], tag: &str) -> Vec<u8> {
        let mut p = Vec::new();
        p.put_i16(names.len() as i16);
        for n in names {
            p.extend_from_slice(n.as_bytes());
            p.put_u8(0);
            p.extend_from_slice(&[0u8; 18]);
        }
        let mut out = backend(b'T', &p);

        let mut p = Vec::new();
        p.put_i16(values.len() as i16);
        for v in values {
            p.put_i32(v.len() as i32);
            p.extend_from_slice(v.as_bytes());
        }
        out.extend(backend(b'D', &p));
        out.extend(backend(b'C', format!("{tag}\0").as_bytes()));
        out
    }

    fn copy_data(frame: &[u8]) -> Vec<u8> {
        backend(b'd', frame)
    }

    fn wal_frame(start: u64, end: u64, data: &[u8]) -> Vec<u8> {
        let mut f = vec![b'w'];
        f.put_u64(start);
        f.put_u64(end);
        f.put_i64(1_000);
        f.extend_from_slice(data);
        f
    }

    fn keepalive_frame(end: u64, reply: bool) -> Vec<u8> {
        let mut f = vec![b'k'];
        f.put_u64(end);
        f.put_i64(2_000);
        f.put_u8(reply as u8);
        f
    }

    struct FakePrimary {
        sock: TcpStream,
        /// status replies seen so far (write position)
        replies: Vec<u64>,
    }

    impl FakePrimary {
        async fn accept(listener: &TcpListener) -> Self {
            let (mut sock, _) = listener.accept().await.unwrap();
            let len = sock.read_i32().await.unwrap();
            let mut startup = vec![0u8; len as usize - 4];
            sock.read_exact(&mut startup).await.unwrap();

            let mut out = backend(b'R', &0i32.to_be_bytes());
            out.extend(backend(b'Z', b"I"));
            sock.write_all(&out).await.unwrap();
            Self {
                sock,
                replies: Vec::new(),
            }
        }

        async fn read(&mut self) -> (u8, Vec<u8>) {
            let tag = self.sock.read_u8().await.unwrap();
            let len = self.sock.read_i32().await.unwrap();
            let mut body = vec![0u8; len as usize - 4];
            self.sock.read_exact(&mut body).await.unwrap();
            (tag, body)
        }

        /// Next message with `tag`, recording status replies on the way.
        async fn expect(&mut self, tag: u8) -> Vec<u8> {
            loop {
                let (t, body) = self.read().await;
                if t == b'd' && body.first() == Some(&b'r') {
                    assert_eq!(body.len(), 34);
                    self.replies
                        .push(u64::from_be_bytes(body[1..9].try_into().unwrap()));
                    if tag != b'd' {
                        continue;
                    }
                }
                assert_eq!(t, tag, "unexpected frontend message {}", t as char);
                return body;
            }
        }

        async fn send(&mut self, bytes: &[u8]) {
            self.sock.write_all(bytes).await.unwrap();
        }
    }

    async fn listener() -> (TcpListener, ReplicationConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cfg = ReplicationConfig {
            port: listener.local_addr().unwrap().port(),
            wait_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        (listener, cfg)
    }

    #[tokio::test]
    async fn streams_and_follows_timeline_switch() {
        let (listener, cfg) = listener().await;

        let primary = tokio::spawn(async move {
            let mut p = FakePrimary::accept(&listener).await;

            assert_eq!(p.expect(b'Q').await, b"IDENTIFY_SYSTEM\0");
            let mut out = rows(
                &["systemid", "timeline", "xlogpos", "dbname"],
                &["7301", "1", "0/3000000"],
                "IDENTIFY_SYSTEM",
            );
            out.extend(backend(b'Z', b"I"));
            p.send(&out).await;

            assert_eq!(p.expect(b'Q').await, b"START_REPLICATION 0/3000000 TIMELINE 1\0");
            p.send(&backend(b'W', &[0, 0, 0])).await;

            let mut out = copy_data(&wal_frame(0x300_0000, 0x300_0004, b"DATA"));
            out.extend(copy_data(&keepalive_frame(0x300_0010, true)));
            p.send(&out).await;

            // wait for the requested reply before ending the timeline
            while !p.replies.contains(&0x300_0010) {
                p.expect(b'd').await;
            }
            p.send(&backend(b'c', &[])).await;

            p.expect(b'c').await;
            let mut out = rows(&["next_tli", "next_tli_startpos"], &["2", "0/3000010"], "SELECT");
            out.extend(backend(b'C', b"START_STREAMING\0"));
            out.extend(backend(b'Z', b"I"));
            p.send(&out).await;

            assert_eq!(p.expect(b'Q').await, b"START_REPLICATION 0/3000010 TIMELINE 2\0");
            let mut out = backend(b'C', b"START_STREAMING\0");
            out.extend(backend(b'Z', b"I"));
            p.send(&out).await;

            p.expect(b'X').await;
            assert!(
                p.replies.iter().all(|&pos| pos >= 0x300_0004),
                "reply behind received WAL: {:x?}",
                p.replies
            );
        });

        let mut rx = WalReceiver::connect(cfg).await.unwrap();

        match rx.recv().await.unwrap() {
            WalEvent::WalData {
                data_start,
                next_page_boundary,
                data,
                ..
            } => {
                assert_eq!(data_start, Lsn(0x300_0000));
                assert_eq!(next_page_boundary, 0);
                assert_eq!(&data[..], b"DATA");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            rx.recv().await.unwrap(),
            WalEvent::KeepAlive {
                wal_end: Lsn(0x300_0010),
                server_time_micros: 2_000,
                reply_requested: true,
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            WalEvent::TimelineSwitch {
                timeline: TimelineId(2),
                start: Lsn(0x300_0010),
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            WalEvent::Ended {
                next_timeline: None
            }
        );

        primary.await.unwrap();
        rx.join().await.unwrap();
    }

    #[tokio::test]
    async fn stop_ends_copy_and_closes() {
        let (listener, mut cfg) = listener().await;
        cfg.start_lsn = Some(Lsn(0x100_0000));
        cfg.timeline = Some(TimelineId(1));
        cfg.slot = Some("standby_1".into());
        cfg.wait_timeout = Duration::from_secs(30);

        let primary = tokio::spawn(async move {
            let mut p = FakePrimary::accept(&listener).await;
            assert_eq!(
                p.expect(b'Q').await,
                b"START_REPLICATION SLOT \"standby_1\" PHYSICAL 0/1000000 TIMELINE 1\0"
            );
            p.send(&backend(b'W', &[0, 0, 0])).await;
            p.send(&copy_data(&keepalive_frame(0x100_0000, false))).await;

            p.expect(b'c').await;
            p.expect(b'X').await;
        });

        let mut rx = WalReceiver::connect(cfg).await.unwrap();
        assert!(matches!(rx.recv().await.unwrap(), WalEvent::KeepAlive { .. }));

        rx.stop();
        primary.await.unwrap();

        let err = rx.recv().await.unwrap_err();
        assert!(matches!(err, ReplicationError::Task(_)));
        rx.join().await.unwrap();
    }

    #[tokio::test]
    async fn server_error_is_delivered() {
        let (listener, mut cfg) = listener().await;
        cfg.start_lsn = Some(Lsn(0x900_0000));
        cfg.timeline = Some(TimelineId(1));

        let primary = tokio::spawn(async move {
            let mut p = FakePrimary::accept(&listener).await;
            p.expect(b'Q').await;
            let mut out = backend(
                b'E',
                b"SERROR\0C58P01\0Mrequested WAL segment has already been removed\0\0",
            );
            out.extend(backend(b'Z', b"I"));
            p.send(&out).await;
        });

        let mut rx = WalReceiver::connect(cfg).await.unwrap();
        let err = rx.recv().await.unwrap_err();
        assert!(err.is_protocol());
        assert!(err.to_string().contains("already been removed"));

        primary.await.unwrap();
        rx.join().await.unwrap();
    }

    #[tokio::test]
    async fn connect_failure_is_reported_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let cfg = ReplicationConfig {
            port,
            ..Default::default()
        };
        let err = WalReceiver::connect(cfg).await.err().unwrap();
        assert!(err.is_connect());
    }
}
