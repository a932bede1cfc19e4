use bytes::Buf;

use crate::error::{ReplicationError, Result};

/// Render an ErrorResponse/NoticeResponse body as `message (SQLSTATE code)`.
pub fn parse_error_response(payload: &[u8]) -> String {
    // fields: (code_byte, cstring) ... 0
    let mut b = payload;
    let mut msg = None;
    let mut sqlstate = None;

    while let Some((&code, rest)) = b.split_first() {
        if code == 0 {
            break;
        }
        let Some(pos) = rest.iter().position(|&x| x == 0) else {
            break;
        };
        let s = String::from_utf8_lossy(&rest[..pos]).into_owned();
        match code {
            b'M' => msg = Some(s),
            b'C' => sqlstate = Some(s),
            _ => {}
        }
        b = &rest[pos + 1..];
    }

    match (msg, sqlstate) {
        (Some(m), Some(c)) => format!("{m} (SQLSTATE {c})"),
        (Some(m), None) => m,
        _ => "unknown server error".to_string(),
    }
}

pub fn parse_auth_request(payload: &[u8]) -> Result<(i32, &[u8])> {
    if payload.len() < 4 {
        return Err(ReplicationError::Protocol("auth request too short".into()));
    }
    let mut b = payload;
    let code = b.get_i32();
    Ok((code, b))
}

/// Column names from a RowDescription.
pub fn parse_row_description(payload: &[u8]) -> Result<Vec<String>> {
    let mut b = payload;
    if b.remaining() < 2 {
        return Err(ReplicationError::Protocol("RowDescription too short".into()));
    }
    let count = b.get_i16();
    let mut names = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        let name = take_cstring(&mut b)
            .ok_or_else(|| ReplicationError::Protocol("RowDescription: bad column name".into()))?;
        // table oid, column attnum, type oid, type len, type mod, format
        if b.remaining() < 18 {
            return Err(ReplicationError::Protocol(
                "RowDescription: truncated field description".into(),
            ));
        }
        b.advance(18);
        names.push(name);
    }
    Ok(names)
}

/// Column values of a DataRow, text format. `None` is SQL NULL.
pub fn parse_data_row(payload: &[u8]) -> Result<Vec<Option<String>>> {
    let mut b = payload;
    if b.remaining() < 2 {
        return Err(ReplicationError::Protocol("DataRow too short".into()));
    }
    let count = b.get_i16();
    let mut values = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        if b.remaining() < 4 {
            return Err(ReplicationError::Protocol("DataRow: truncated length".into()));
        }
        let len = b.get_i32();
        if len < 0 {
            values.push(None);
            continue;
        }
        let len = len as usize;
        if b.remaining() < len {
            return Err(ReplicationError::Protocol("DataRow: truncated value".into()));
        }
        values.push(Some(String::from_utf8_lossy(&b[..len]).into_owned()));
        b.advance(len);
    }
    Ok(values)
}

/// Command tag of a CommandComplete (`START_STREAMING`, `SELECT 1`, ...).
pub fn parse_command_complete(payload: &[u8]) -> String {
    let end = payload.iter().position(|&x| x == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

fn take_cstring(b: &mut &[u8]) -> Option<String> {
    let pos = b.iter().position(|&x| x == 0)?;
    let s = String::from_utf8_lossy(&b[..pos]).into_owned();
    b.advance(pos + 1);
    Some(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn parse_error_prefers_message() {
        // 'M' "hello" \0 'C' "12345" \0 \0
        let payload = [
            b'M', b'h', b'e', b'l', b'l', b'o', 0, b'C', b'1', b'2', b'3', b'4', b'5', 0, 0,
        ];
        let s = parse_error_response(&payload);
        assert!(s.contains("hello"));
        assert!(s.contains("SQLSTATE 12345"));
    }

    #[test]
    fn parse_error_without_message() {
        assert_eq!(parse_error_response(b"SERROR\0\0"), "unknown server error");
    }

    #[test]
    fn row_description_names() {
        let mut p = Vec::new();
        p.put_i16(2);
        for name in ["next_tli", "next_tli_startpos"] {
            p.extend_from_slice(name.as_bytes());
            p.put_u8(0);
            p.extend_from_slice(&[0u8; 18]);
        }
        assert_eq!(
            parse_row_description(&p).unwrap(),
            vec!["next_tli".to_string(), "next_tli_startpos".to_string()]
        );
    }

    #[test]
    fn row_description_truncated() {
        let mut p = Vec::new();
        p.put_i16(1);
        p.extend_from_slice(b"a\0");
        p.extend_from_slice(&[0u8; 10]);
        assert!(parse_row_description(&p).is_err());
    }

    #[test]
    fn data_row_values_and_nulls() {
        let mut p = Vec::new();
        p.put_i16(3);
        p.put_i32(1);
        p.extend_from_slice(b"7");
        p.put_i32(-1);
        p.put_i32(9);
        p.extend_from_slice(b"0/3000000");
        assert_eq!(
            parse_data_row(&p).unwrap(),
            vec![Some("7".into()), None, Some("0/3000000".into())]
        );
    }

    #[test]
    fn data_row_truncated_value() {
        let mut p = Vec::new();
        p.put_i16(1);
        p.put_i32(5);
        p.extend_from_slice(b"ab");
        assert!(parse_data_row(&p).unwrap_err().is_protocol());
    }

    #[test]
    fn command_complete_tag() {
        assert_eq!(parse_command_complete(b"START_STREAMING\0"), "START_STREAMING");
        assert_eq!(parse_command_complete(b"SELECT 1"), "SELECT 1");
    }
}
