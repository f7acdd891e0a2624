use crate::{protocol::Value, RedisError, RedisResult};
use bytes::{Buf, BytesMut};

/// A restartable streaming RESP2 parser.
///
/// Bytes are appended with [`feed`](Parser::feed); [`next`](Parser::next)
/// yields one decoded [`Value`] per call until the buffer no longer holds
/// a complete frame. A frame may arrive split across arbitrarily many
/// `feed` calls; no bytes are consumed before a frame is complete.
#[derive(Debug, Default)]
pub struct Parser {
    buf: BytesMut,
}

impl Parser {
    /// A parser with an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(16 * 1024),
        }
    }

    /// Appends bytes to the internal buffer. Never fails.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered, not yet consumed bytes.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decodes the next complete frame.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    ///
    /// # Errors
    ///
    /// `RedisError::Protocol` if the buffered bytes violate RESP2; the
    /// stream is unrecoverable from that point on.
    pub fn next(&mut self) -> RedisResult<Option<Value>> {
        match parse_value(&self.buf, 0)? {
            Some((value, consumed)) => {
                self.buf.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

// Attempts to decode one value starting at `pos`; returns the value and
// the position one past its last byte.
fn parse_value(buf: &[u8], pos: usize) -> RedisResult<Option<(Value, usize)>> {
    let Some(&prefix) = buf.get(pos) else {
        return Ok(None);
    };
    let Some(line_end) = find_crlf(buf, pos + 1) else {
        return match prefix {
            b'+' | b'-' | b':' | b'$' | b'*' => Ok(None),
            other => Err(invalid_prefix(other)),
        };
    };
    let line = &buf[pos + 1..line_end];
    let after_line = line_end + 2;
    match prefix {
        b'+' => Ok(Some((Value::SimpleString(line.to_vec()), after_line))),
        b'-' => Ok(Some((parse_error_line(line), after_line))),
        b':' => Ok(Some((Value::Integer(parse_i64(line)?), after_line))),
        b'$' => {
            let len = parse_i64(line)?;
            if len == -1 {
                return Ok(Some((Value::Nil, after_line)));
            }
            let len = usize::try_from(len)
                .map_err(|_| RedisError::protocol(format!("negative bulk length {len}")))?;
            let payload_end = after_line + len;
            if buf.len() < payload_end + 2 {
                return Ok(None);
            }
            if &buf[payload_end..payload_end + 2] != b"\r\n" {
                return Err(RedisError::protocol(
                    "bulk length header does not match payload (missing CRLF)",
                ));
            }
            Ok(Some((
                Value::BulkString(buf[after_line..payload_end].to_vec()),
                payload_end + 2,
            )))
        }
        b'*' => {
            let len = parse_i64(line)?;
            if len == -1 {
                return Ok(Some((Value::Nil, after_line)));
            }
            let len = usize::try_from(len)
                .map_err(|_| RedisError::protocol(format!("negative array length {len}")))?;
            let mut values = Vec::with_capacity(len);
            let mut cursor = after_line;
            for _ in 0..len {
                match parse_value(buf, cursor)? {
                    Some((value, next)) => {
                        values.push(value);
                        cursor = next;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Value::Array(values), cursor)))
        }
        other => Err(invalid_prefix(other)),
    }
}

fn parse_error_line(line: &[u8]) -> Value {
    let text = String::from_utf8_lossy(line);
    match text.split_once(' ') {
        Some((kind, message)) => Value::Error {
            kind: kind.to_string(),
            message: message.to_string(),
        },
        None => Value::Error {
            kind: text.to_string(),
            message: String::new(),
        },
    }
}

fn parse_i64(line: &[u8]) -> RedisResult<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            RedisError::protocol(format!(
                "non-numeric length or integer field {:?}",
                String::from_utf8_lossy(line)
            ))
        })
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    if buf.len() < from + 2 {
        return None;
    }
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| from + i)
}

fn invalid_prefix(byte: u8) -> RedisError {
    RedisError::protocol(format!("invalid frame prefix byte 0x{byte:02x}"))
}
