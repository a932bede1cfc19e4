use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::auth::{self, codes};
use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, Result};
use crate::protocol::framing::{
    BackendMessage, write_copy_data, write_copy_done, write_password_message, write_query,
    write_startup_message, write_terminate,
};
use crate::protocol::messages::{
    parse_auth_request, parse_command_complete, parse_data_row, parse_error_response,
    parse_row_description,
};
use crate::transport::{CopyFrame, QueryResult, Readiness, ReplicationTransport, ResultSet};

const READ_CHUNK: usize = 64 * 1024;

/// Which sides of a COPY are still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyState {
    Inactive,
    Both,
    /// The server sent CopyDone; we may still send.
    InOnly,
    /// We sent CopyDone; the server may still send.
    OutOnly,
}

/// A replication-mode connection to a PostgreSQL primary.
///
/// Owns the byte stream and an input buffer. Results are produced in the same
/// order and shape libpq would report them, which is what the session layer
/// relies on when it walks the end-of-streaming handshake.
pub struct PgConnection<S = TcpStream> {
    stream: S,
    buf: BytesMut,
    copy: CopyState,
    /// ErrorResponse that ended a COPY, reported by the next `next_result`.
    pending_error: Option<String>,
    /// The server closed the socket. Buffered messages are still delivered.
    eof: bool,
    interrupt: Option<watch::Receiver<bool>>,
}

impl PgConnection<TcpStream> {
    /// Open a TCP connection and run the replication startup handshake.
    pub async fn connect(cfg: &ReplicationConfig) -> Result<Self> {
        let addr = (cfg.host.as_str(), cfg.port);
        let tcp = tokio::time::timeout(cfg.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                ReplicationError::Connect(format!(
                    "timed out connecting to {}:{} after {:?}",
                    cfg.host, cfg.port, cfg.connect_timeout
                ))
            })?
            .map_err(|e| {
                ReplicationError::Connect(format!(
                    "could not connect to {}:{}: {e}",
                    cfg.host, cfg.port
                ))
            })?;
        tcp.set_nodelay(true)?;

        tracing::debug!(host = %cfg.host, port = cfg.port, "connected, starting handshake");
        Self::handshake(tcp, cfg).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> PgConnection<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(READ_CHUNK),
            copy: CopyState::Inactive,
            pending_error: None,
            eof: false,
            interrupt: None,
        }
    }

    /// Send the startup packet on an already-open stream and authenticate.
    ///
    /// Returns once the server reports ReadyForQuery.
    pub async fn handshake(stream: S, cfg: &ReplicationConfig) -> Result<Self> {
        let mut conn = Self::new(stream);
        let params = [
            ("user", cfg.user.as_str()),
            ("replication", "true"),
            ("application_name", cfg.application_name.as_str()),
            ("client_encoding", "UTF8"),
        ];
        let res = async {
            write_startup_message(&mut conn.stream, &params).await?;
            conn.authenticate(cfg).await
        }
        .await;

        match res {
            Ok(()) => Ok(conn),
            Err(ReplicationError::Transport(e)) => Err(ReplicationError::Connect(e)),
            Err(e) => Err(e),
        }
    }

    /// Make [`wait_readable`](ReplicationTransport::wait_readable) return
    /// `Interrupted` once `stop` becomes `true`.
    pub fn with_interrupt(mut self, stop: watch::Receiver<bool>) -> Self {
        self.interrupt = Some(stop);
        self
    }

    /// Send Terminate and drop the connection.
    pub async fn close(mut self) -> Result<()> {
        write_terminate(&mut self.stream).await
    }

    async fn authenticate(&mut self, cfg: &ReplicationConfig) -> Result<()> {
        loop {
            let msg = self.next_message().await?;
            match msg.tag {
                b'R' => {
                    let (code, rest) = parse_auth_request(&msg.payload)?;
                    match code {
                        codes::OK => {}
                        codes::CLEARTEXT => {
                            let mut p = Vec::from(cfg.password.as_bytes());
                            p.push(0);
                            write_password_message(&mut self.stream, &p).await?;
                        }
                        #[cfg(feature = "md5")]
                        codes::MD5 => {
                            let salt: [u8; 4] = rest.try_into().map_err(|_| {
                                ReplicationError::Protocol("md5 auth salt missing".into())
                            })?;
                            let mut p = auth::md5_password(&cfg.user, &cfg.password, &salt)
                                .into_bytes();
                            p.push(0);
                            write_password_message(&mut self.stream, &p).await?;
                        }
                        codes::SASL => self.authenticate_sasl(cfg, rest).await?,
                        other => {
                            return Err(ReplicationError::Connect(format!(
                                "unsupported authentication method (code {other})"
                            )));
                        }
                    }
                }
                b'E' => {
                    return Err(ReplicationError::Connect(parse_error_response(
                        &msg.payload,
                    )));
                }
                b'Z' => return Ok(()),
                // ParameterStatus, BackendKeyData, NoticeResponse
                _ => {}
            }
        }
    }

    #[cfg(feature = "scram")]
    async fn authenticate_sasl(&mut self, cfg: &ReplicationConfig, offered: &[u8]) -> Result<()> {
        use crate::auth::scram::{MECHANISM, ScramSha256};

        let offered = auth::sasl_mechanisms(offered);
        if !offered.iter().any(|m| m == MECHANISM) {
            return Err(ReplicationError::Connect(format!(
                "server does not offer {MECHANISM}: {offered:?}"
            )));
        }

        let mut scram = ScramSha256::new(&cfg.user);
        let first = scram.client_first();

        // SASLInitialResponse: mechanism\0 + int32 len + client-first
        let mut init = Vec::with_capacity(MECHANISM.len() + 5 + first.len());
        init.extend_from_slice(MECHANISM.as_bytes());
        init.push(0);
        init.extend_from_slice(&(first.len() as i32).to_be_bytes());
        init.extend_from_slice(first.as_bytes());
        write_password_message(&mut self.stream, &init).await?;

        let server_first = self.sasl_message(codes::SASL_CONTINUE).await?;
        let client_final =
            scram.client_final(&cfg.password, &String::from_utf8_lossy(&server_first))?;
        write_password_message(&mut self.stream, client_final.as_bytes()).await?;

        let server_final = self.sasl_message(codes::SASL_FINAL).await?;
        scram.verify_server_final(&String::from_utf8_lossy(&server_final))
    }

    #[cfg(not(feature = "scram"))]
    async fn authenticate_sasl(
        &mut self,
        _cfg: &ReplicationConfig,
        _offered: &[u8],
    ) -> Result<()> {
        Err(ReplicationError::Connect(
            "server requires SASL authentication but the `scram` feature is disabled".into(),
        ))
    }

    #[cfg(feature = "scram")]
    async fn sasl_message(&mut self, want: i32) -> Result<Bytes> {
        loop {
            let msg = self.next_message().await?;
            match msg.tag {
                b'R' => {
                    let (code, rest) = parse_auth_request(&msg.payload)?;
                    if code != want {
                        return Err(ReplicationError::Connect(format!(
                            "unexpected authentication code {code}, expected {want}"
                        )));
                    }
                    return Ok(Bytes::copy_from_slice(rest));
                }
                b'E' => {
                    return Err(ReplicationError::Connect(parse_error_response(
                        &msg.payload,
                    )));
                }
                _ => {}
            }
        }
    }

    async fn fill_buf(&mut self) -> Result<()> {
        if self.eof {
            return Err(closed());
        }
        self.buf.reserve(READ_CHUNK);
        let n = self.stream.read_buf(&mut self.buf).await?;
        if n == 0 {
            self.eof = true;
            return Err(closed());
        }
        Ok(())
    }

    async fn next_message(&mut self) -> Result<BackendMessage> {
        loop {
            if let Some(msg) = BackendMessage::try_parse(&mut self.buf)? {
                return Ok(msg);
            }
            self.fill_buf().await?;
        }
    }

    /// Read backend messages up to the end of the next result.
    async fn parse_result(&mut self) -> Result<Option<QueryResult>> {
        let mut tuples: Option<ResultSet> = None;
        loop {
            let msg = self.next_message().await?;
            match msg.tag {
                b'T' => {
                    tuples = Some(ResultSet {
                        columns: parse_row_description(&msg.payload)?,
                        rows: Vec::new(),
                    });
                }
                b'D' => {
                    let rs = tuples.as_mut().ok_or_else(|| {
                        ReplicationError::Protocol("DataRow without RowDescription".into())
                    })?;
                    rs.rows.push(parse_data_row(&msg.payload)?);
                }
                b'C' => {
                    return Ok(Some(match tuples.take() {
                        Some(rs) => QueryResult::Tuples(rs),
                        None => QueryResult::CommandOk {
                            tag: parse_command_complete(&msg.payload),
                        },
                    }));
                }
                // EmptyQueryResponse
                b'I' => return Ok(Some(QueryResult::CommandOk { tag: String::new() })),
                b'W' => {
                    self.copy = CopyState::Both;
                    return Ok(Some(QueryResult::CopyBoth));
                }
                b'G' => {
                    self.copy = CopyState::InOnly;
                    return Ok(Some(QueryResult::CopyIn));
                }
                b'H' => {
                    self.copy = CopyState::OutOnly;
                    return Ok(Some(QueryResult::CopyOut));
                }
                b'E' => return Ok(Some(QueryResult::Error(parse_error_response(&msg.payload)))),
                b'Z' => return Ok(None),
                b'N' | b'S' | b'K' => {}
                other => {
                    return Err(ReplicationError::Protocol(format!(
                        "unexpected message type 0x{other:02x}"
                    )));
                }
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ReplicationTransport for PgConnection<S> {
    async fn execute(&mut self, command: &str) -> Result<QueryResult> {
        if self.copy != CopyState::Inactive {
            return Err(ReplicationError::Protocol(
                "cannot run a command while COPY is in progress".into(),
            ));
        }
        tracing::trace!(command, "execute");
        write_query(&mut self.stream, command).await?;

        let mut last: Option<QueryResult> = None;
        while let Some(res) = self.next_result().await? {
            match res {
                QueryResult::CopyBoth | QueryResult::CopyIn | QueryResult::CopyOut => {
                    return Ok(res);
                }
                // the first error wins over anything that follows it
                _ if matches!(last, Some(QueryResult::Error(_))) => {}
                _ => last = Some(res),
            }
        }
        last.ok_or_else(|| ReplicationError::Protocol(format!("no result for {command}")))
    }

    async fn next_result(&mut self) -> Result<Option<QueryResult>> {
        if let Some(e) = self.pending_error.take() {
            return Ok(Some(QueryResult::Error(e)));
        }
        match self.copy {
            CopyState::Both => Ok(Some(QueryResult::CopyBoth)),
            CopyState::InOnly => Ok(Some(QueryResult::CopyIn)),
            CopyState::OutOnly => Ok(Some(QueryResult::CopyOut)),
            CopyState::Inactive => self.parse_result().await,
        }
    }

    fn read_frame(&mut self) -> Result<CopyFrame> {
        if !matches!(self.copy, CopyState::Both | CopyState::OutOnly) {
            return Err(ReplicationError::Protocol(
                "cannot read copy data: no COPY in progress".into(),
            ));
        }
        loop {
            let Some(msg) = BackendMessage::try_parse(&mut self.buf)? else {
                if self.eof {
                    return Err(closed());
                }
                return Ok(CopyFrame::Empty);
            };
            match msg.tag {
                b'd' => return Ok(CopyFrame::Data(msg.payload)),
                b'c' => {
                    self.copy = match self.copy {
                        CopyState::Both => CopyState::InOnly,
                        _ => CopyState::Inactive,
                    };
                    return Ok(CopyFrame::EndOfCopy);
                }
                b'E' => {
                    self.pending_error = Some(parse_error_response(&msg.payload));
                    self.copy = CopyState::Inactive;
                    return Ok(CopyFrame::EndOfCopy);
                }
                b'N' | b'S' => {}
                other => {
                    return Err(ReplicationError::Protocol(format!(
                        "unexpected message type 0x{other:02x} during COPY"
                    )));
                }
            }
        }
    }

    async fn consume_input(&mut self) -> Result<()> {
        if self.eof {
            return Ok(());
        }
        self.buf.reserve(READ_CHUNK);
        match tokio::time::timeout(Duration::ZERO, self.stream.read_buf(&mut self.buf)).await {
            Err(_) => Ok(()),
            // what is already buffered may still hold the server's last error
            Ok(Ok(0)) => {
                self.eof = true;
                Ok(())
            }
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        if !matches!(self.copy, CopyState::Both | CopyState::InOnly) {
            return Err(ReplicationError::Protocol(
                "cannot send copy data: no COPY in progress".into(),
            ));
        }
        write_copy_data(&mut self.stream, frame).await
    }

    async fn end_copy(&mut self) -> Result<()> {
        self.copy = match self.copy {
            CopyState::Both => CopyState::OutOnly,
            CopyState::InOnly => CopyState::Inactive,
            _ => {
                return Err(ReplicationError::Protocol(
                    "cannot end copy: no COPY in progress".into(),
                ));
            }
        };
        write_copy_done(&mut self.stream).await
    }

    async fn wait_readable(&mut self, timeout: Duration) -> Result<Readiness> {
        if self.eof {
            return Ok(Readiness::Ready);
        }
        self.buf.reserve(READ_CHUNK);
        let read = tokio::time::timeout(timeout, self.stream.read_buf(&mut self.buf));
        tokio::select! {
            biased;
            () = interrupted(self.interrupt.as_mut()) => Ok(Readiness::Interrupted),
            res = read => match res {
                Err(_) => Ok(Readiness::TimedOut),
                Ok(Ok(0)) => {
                    self.eof = true;
                    Ok(Readiness::Ready)
                }
                Ok(Ok(_)) => Ok(Readiness::Ready),
                Ok(Err(e)) => Err(e.into()),
            },
        }
    }
}

/// Resolves once the stop flag is set. Never resolves without a flag, or after
/// its sender is gone.
async fn interrupted(stop: Option<&mut watch::Receiver<bool>>) {
    if let Some(rx) = stop {
        let stopped = rx.wait_for(|stop| *stop).await.is_ok();
        if stopped {
            return;
        }
    }
    std::future::pending::<()>().await
}

fn closed() -> ReplicationError {
    ReplicationError::Transport("server closed the connection unexpectedly".into())
}
