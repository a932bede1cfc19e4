use bytes::{Buf, Bytes};

use crate::error::{ReplicationError, Result};
use crate::lsn::Lsn;

/// WAL page size of the primary. Payload consumers use it to locate page
/// headers inside WAL data blocks.
pub const PAGE_SIZE: u64 = 8192;

/// Tag byte + data start + WAL end + send time.
pub const WAL_DATA_HEADER_LEN: usize = 25;
/// Tag byte + WAL end + send time + reply flag.
pub const KEEPALIVE_LEN: usize = 18;
/// Tag byte + write/flush/apply + client time + reply flag.
pub const STATUS_REPLY_LEN: usize = 34;

pub const TAG_WAL_DATA: u8 = b'w';
pub const TAG_KEEPALIVE: u8 = b'k';
pub const TAG_STATUS_REPLY: u8 = b'r';

/// A block of WAL sent by the primary (`XLogData`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalData {
    /// WAL position of the first payload byte
    pub data_start: Lsn,
    /// Current end of WAL on the primary
    pub wal_end: Lsn,
    /// Primary's clock, microseconds since 2000-01-01
    pub server_time_micros: i64,
    /// Distance from `data_start` to the next page boundary
    pub next_page_boundary: u64,
    /// Raw WAL bytes, uninterpreted
    pub data: Bytes,
}

impl WalData {
    /// Position just past the last payload byte.
    #[inline]
    pub fn data_end(&self) -> Lsn {
        Lsn(self.data_start.0.wrapping_add(self.data.len() as u64))
    }
}

/// Primary heartbeat (`Primary keepalive message`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pub wal_end: Lsn,
    pub server_time_micros: i64,
    /// The primary wants a status reply right away.
    pub reply_requested: bool,
}

/// A decoded copy-both frame from the primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationMessage {
    WalData(WalData),
    Keepalive(Keepalive),
    /// A frame type this client does not understand. Ignored by the session.
    Unrecognized { tag: u8 },
}

impl ReplicationMessage {
    #[inline]
    pub fn is_wal_data(&self) -> bool {
        matches!(self, ReplicationMessage::WalData(_))
    }

    #[inline]
    pub fn is_keepalive(&self) -> bool {
        matches!(self, ReplicationMessage::Keepalive(_))
    }

    #[inline]
    pub fn requires_reply(&self) -> bool {
        matches!(
            self,
            ReplicationMessage::Keepalive(Keepalive {
                reply_requested: true,
                ..
            })
        )
    }

    /// WAL end reported by the primary, if the frame carries one.
    pub fn wal_end(&self) -> Option<Lsn> {
        match self {
            ReplicationMessage::WalData(w) => Some(w.wal_end),
            ReplicationMessage::Keepalive(k) => Some(k.wal_end),
            ReplicationMessage::Unrecognized { .. } => None,
        }
    }
}

/// Bytes from `data_start` to the next multiple of [`PAGE_SIZE`], zero when
/// already aligned.
#[inline]
pub fn next_page_boundary(data_start: Lsn) -> u64 {
    PAGE_SIZE.wrapping_sub(data_start.0) & (PAGE_SIZE - 1)
}

/// Decode one copy-both frame (the CopyData content, tag byte included).
pub fn decode(frame: Bytes) -> Result<ReplicationMessage> {
    let Some(&tag) = frame.first() else {
        return Err(ReplicationError::Protocol("empty CopyData frame".into()));
    };

    match tag {
        TAG_WAL_DATA => {
            if frame.len() < WAL_DATA_HEADER_LEN {
                return Err(ReplicationError::Protocol(format!(
                    "WAL data frame too short: {} bytes (need at least {WAL_DATA_HEADER_LEN})",
                    frame.len()
                )));
            }
            let mut hdr = &frame[1..WAL_DATA_HEADER_LEN];
            let data_start = Lsn(hdr.get_u64());
            let wal_end = Lsn(hdr.get_u64());
            let server_time_micros = hdr.get_i64();

            Ok(ReplicationMessage::WalData(WalData {
                data_start,
                wal_end,
                server_time_micros,
                next_page_boundary: next_page_boundary(data_start),
                data: frame.slice(WAL_DATA_HEADER_LEN..),
            }))
        }
        TAG_KEEPALIVE => {
            if frame.len() != KEEPALIVE_LEN {
                return Err(ReplicationError::Protocol(format!(
                    "keepalive frame has {} bytes (expected {KEEPALIVE_LEN})",
                    frame.len()
                )));
            }
            let mut b = &frame[1..];
            let wal_end = Lsn(b.get_u64());
            let server_time_micros = b.get_i64();
            let reply_requested = b.get_u8() != 0;

            Ok(ReplicationMessage::Keepalive(Keepalive {
                wal_end,
                server_time_micros,
                reply_requested,
            }))
        }
        other => Ok(ReplicationMessage::Unrecognized { tag: other }),
    }
}

/// Standby status update sent back to the primary.
///
/// All three positions are reported from the same value by the session: this
/// client does not persist or replay WAL, so it cannot claim independent
/// flush/apply progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReply {
    pub write: Lsn,
    pub flush: Lsn,
    pub apply: Lsn,
    /// Microseconds since 2000-01-01
    pub client_time_micros: i64,
    /// Ask the primary to answer with a keepalive immediately.
    pub reply_requested: bool,
}

impl StatusReply {
    /// Reply reporting `position` as written, flushed and applied.
    pub fn at(position: Lsn, client_time_micros: i64, reply_requested: bool) -> Self {
        StatusReply {
            write: position,
            flush: position,
            apply: position,
            client_time_micros,
            reply_requested,
        }
    }

    pub fn encode(&self) -> [u8; STATUS_REPLY_LEN] {
        let mut out = [0u8; STATUS_REPLY_LEN];
        out[0] = TAG_STATUS_REPLY;
        out[1..9].copy_from_slice(&self.write.0.to_be_bytes());
        out[9..17].copy_from_slice(&self.flush.0.to_be_bytes());
        out[17..25].copy_from_slice(&self.apply.0.to_be_bytes());
        out[25..33].copy_from_slice(&self.client_time_micros.to_be_bytes());
        out[33] = u8::from(self.reply_requested);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wal_frame(start: u64, end: u64, time: i64, payload: &[u8]) -> Bytes {
        let mut v = vec![b'w'];
        v.extend_from_slice(&start.to_be_bytes());
        v.extend_from_slice(&end.to_be_bytes());
        v.extend_from_slice(&time.to_be_bytes());
        v.extend_from_slice(payload);
        Bytes::from(v)
    }

    fn keepalive_frame(end: u64, time: i64, flag: u8) -> Bytes {
        let mut v = vec![b'k'];
        v.extend_from_slice(&end.to_be_bytes());
        v.extend_from_slice(&time.to_be_bytes());
        v.push(flag);
        Bytes::from(v)
    }

    // ==================== WAL data ====================

    #[test]
    fn decode_wal_data_example() {
        let msg = decode(wal_frame(16, 32, 1000, b"DATA")).unwrap();
        let ReplicationMessage::WalData(w) = msg else {
            panic!("expected WalData");
        };
        assert_eq!(w.data_start, Lsn(16));
        assert_eq!(w.wal_end, Lsn(32));
        assert_eq!(w.server_time_micros, 1000);
        assert_eq!(w.data.len(), 4);
        assert_eq!(&w.data[..], b"DATA");
        assert_eq!(w.next_page_boundary, 8176);
        assert_eq!(w.data_end(), Lsn(20));
    }

    #[test]
    fn decode_wal_data_header_only() {
        let msg = decode(wal_frame(1, 2, 3, b"")).unwrap();
        match msg {
            ReplicationMessage::WalData(w) => assert!(w.data.is_empty()),
            _ => panic!("expected WalData"),
        }
    }

    #[test]
    fn decode_wal_data_high_bits() {
        let msg = decode(wal_frame(0x0123456789ABCDEF, 0xFEDCBA9876543210, -12345, b"x")).unwrap();
        let ReplicationMessage::WalData(w) = msg else {
            panic!("expected WalData");
        };
        assert_eq!(w.data_start.0, 0x0123456789ABCDEF);
        assert_eq!(w.wal_end.0, 0xFEDCBA9876543210);
        assert_eq!(w.server_time_micros, -12345);
    }

    #[test]
    fn decode_wal_data_too_short() {
        let mut v = vec![b'w'];
        v.extend_from_slice(&[0u8; 23]);
        let err = decode(Bytes::from(v)).unwrap_err();
        assert!(err.is_protocol());
        assert!(err.to_string().contains("too short"));
    }

    #[test]
    fn page_boundary_is_aligned_distance() {
        for start in [0u64, 1, 16, 8191, 8192, 8193, 0x1_0000_1FFF, u64::MAX] {
            let d = next_page_boundary(Lsn(start));
            assert!(d < PAGE_SIZE, "start={start} d={d}");
            assert_eq!(start.wrapping_add(d) % PAGE_SIZE, 0, "start={start}");
        }
        assert_eq!(next_page_boundary(Lsn(8192)), 0);
        assert_eq!(next_page_boundary(Lsn(8191)), 1);
    }

    // ==================== Keepalive ====================

    #[test]
    fn decode_keepalive_reply_requested() {
        let msg = decode(keepalive_frame(100, 200, 1)).unwrap();
        assert_eq!(
            msg,
            ReplicationMessage::Keepalive(Keepalive {
                wal_end: Lsn(100),
                server_time_micros: 200,
                reply_requested: true,
            })
        );
        assert!(msg.requires_reply());
        assert_eq!(msg.wal_end(), Some(Lsn(100)));
    }

    #[test]
    fn decode_keepalive_nonzero_flag_is_true() {
        let msg = decode(keepalive_frame(0, 0, 42)).unwrap();
        assert!(msg.requires_reply());
        let msg = decode(keepalive_frame(0, 0, 0)).unwrap();
        assert!(msg.is_keepalive());
        assert!(!msg.requires_reply());
    }

    #[test]
    fn decode_keepalive_wrong_length() {
        let short = keepalive_frame(1, 2, 0).slice(..17);
        assert!(decode(short).unwrap_err().to_string().contains("keepalive"));

        let mut long = keepalive_frame(1, 2, 0).to_vec();
        long.push(0);
        assert!(decode(Bytes::from(long)).unwrap_err().is_protocol());
    }

    // ==================== Other tags ====================

    #[test]
    fn decode_empty_frame() {
        let err = decode(Bytes::new()).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn decode_unknown_tag_is_not_an_error() {
        let msg = decode(Bytes::from_static(b"Xabc")).unwrap();
        assert_eq!(msg, ReplicationMessage::Unrecognized { tag: b'X' });
        assert_eq!(msg.wal_end(), None);
        assert!(!msg.is_wal_data());
    }

    // ==================== Status reply ====================

    #[test]
    fn encode_status_reply_layout() {
        let p = StatusReply::at(Lsn(0x123456789ABCDEF0), 987654321, false).encode();

        assert_eq!(p.len(), STATUS_REPLY_LEN);
        assert_eq!(p[0], b'r');
        let lsn_bytes = &0x123456789ABCDEF0u64.to_be_bytes();
        assert_eq!(&p[1..9], lsn_bytes);
        assert_eq!(&p[9..17], lsn_bytes);
        assert_eq!(&p[17..25], lsn_bytes);
        assert_eq!(&p[25..33], &987654321i64.to_be_bytes());
        assert_eq!(p[33], 0);
    }

    #[test]
    fn encode_status_reply_distinct_positions_and_flag() {
        let reply = StatusReply {
            write: Lsn(3),
            flush: Lsn(2),
            apply: Lsn(1),
            client_time_micros: -1,
            reply_requested: true,
        };
        let p = reply.encode();
        assert_eq!(&p[1..9], &3u64.to_be_bytes());
        assert_eq!(&p[9..17], &2u64.to_be_bytes());
        assert_eq!(&p[17..25], &1u64.to_be_bytes());
        assert_eq!(&p[25..33], &[0xFF; 8]);
        assert_eq!(p[33], 1);
    }

    #[test]
    fn wal_header_survives_reencoding() {
        let frame = wal_frame(0xAB_CDEF_0123, 0xAB_CDEF_9999, 1_700_000_000, b"payload");
        let ReplicationMessage::WalData(w) = decode(frame.clone()).unwrap() else {
            panic!("expected WalData");
        };
        let again = wal_frame(w.data_start.0, w.wal_end.0, w.server_time_micros, &w.data);
        assert_eq!(again, frame);
    }
}
