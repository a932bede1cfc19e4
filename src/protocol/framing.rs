use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{ReplicationError, Result};

/// Protocol 3.0
pub const PROTOCOL_VERSION: i32 = 196_608;

/// Upper bound on a single backend message. WAL data frames are at most a few
/// hundred KiB; anything near this limit means the stream is desynchronized.
const MAX_BACKEND_MESSAGE_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct BackendMessage {
    pub tag: u8,
    pub payload: Bytes, // payload excludes the 4-byte length field
}

impl BackendMessage {
    /// Split one complete message off the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` holds only part of a message; nothing is
    /// consumed in that case.
    pub fn try_parse(buf: &mut BytesMut) -> Result<Option<BackendMessage>> {
        if buf.len() < 5 {
            return Ok(None);
        }
        let tag = buf[0];
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if len < 4 || len as usize > MAX_BACKEND_MESSAGE_LEN {
            // the byte stream is out of step; the connection is unusable
            return Err(ReplicationError::Transport(format!(
                "invalid backend message length {len} (tag 0x{tag:02x})"
            )));
        }
        let total = 1 + len as usize;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }
        let mut msg = buf.split_to(total);
        msg.advance(5);
        Ok(Some(BackendMessage {
            tag,
            payload: msg.freeze(),
        }))
    }
}

/// Tagged frontend message: tag, self-inclusive length, payload.
fn frontend_message(tag: u8, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(payload.len() + 5);
    buf.put_u8(tag);
    buf.put_i32(payload.len() as i32 + 4);
    buf.extend_from_slice(payload);
    buf
}

async fn send<W: AsyncWrite + Unpin>(wr: &mut W, buf: &[u8]) -> Result<()> {
    wr.write_all(buf).await?;
    wr.flush().await?;
    Ok(())
}

pub async fn write_startup_message<W: AsyncWrite + Unpin>(
    wr: &mut W,
    params: &[(&str, &str)],
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_i32(0); // length placeholder
    buf.put_i32(PROTOCOL_VERSION);

    for (k, v) in params {
        buf.extend_from_slice(k.as_bytes());
        buf.put_u8(0);
        buf.extend_from_slice(v.as_bytes());
        buf.put_u8(0);
    }
    buf.put_u8(0); // terminator

    let len = buf.len() as i32;
    buf[0..4].copy_from_slice(&len.to_be_bytes());

    send(wr, &buf).await
}

pub async fn write_query<W: AsyncWrite + Unpin>(wr: &mut W, sql: &str) -> Result<()> {
    let mut payload = Vec::with_capacity(sql.len() + 1);
    payload.extend_from_slice(sql.as_bytes());
    payload.push(0);
    send(wr, &frontend_message(b'Q', &payload)).await
}

pub async fn write_password_message<W: AsyncWrite + Unpin>(
    wr: &mut W,
    payload: &[u8],
) -> Result<()> {
    send(wr, &frontend_message(b'p', payload)).await
}

pub async fn write_copy_data<W: AsyncWrite + Unpin>(wr: &mut W, payload: &[u8]) -> Result<()> {
    send(wr, &frontend_message(b'd', payload)).await
}

pub async fn write_copy_done<W: AsyncWrite + Unpin>(wr: &mut W) -> Result<()> {
    send(wr, &frontend_message(b'c', &[])).await
}

pub async fn write_terminate<W: AsyncWrite + Unpin>(wr: &mut W) -> Result<()> {
    send(wr, &frontend_message(b'X', &[])).await
}
