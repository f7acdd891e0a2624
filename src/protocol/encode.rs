use crate::{
    protocol::{Arg, Command, Value},
    RedisError, RedisResult,
};
use bytes::{BufMut, BytesMut};

const CRLF: &[u8] = b"\r\n";

/// How reply bytes that are not valid UTF-8 are treated when decoding
/// is in force.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DecodePolicy {
    /// Fail with `RedisError::Decode`, keeping the original bytes.
    #[default]
    Strict,
    /// Substitute the replacement character for invalid sequences.
    Replace,
    /// Drop invalid sequences.
    Ignore,
}

impl DecodePolicy {
    pub(crate) fn from_name(name: &str) -> Option<Self> {
        match name {
            "strict" => Some(Self::Strict),
            "replace" => Some(Self::Replace),
            "ignore" => Some(Self::Ignore),
            _ => None,
        }
    }
}

/// Produces the exact byte frames the server expects and applies the
/// configured text policy to replies.
#[derive(Clone, Copy, Debug, Default)]
pub struct Encoder {
    policy: DecodePolicy,
    auto_decode: bool,
}

impl Encoder {
    pub(crate) fn new(policy: DecodePolicy, auto_decode: bool) -> Self {
        Self {
            policy,
            auto_decode,
        }
    }

    /// Encodes a command as a RESP2 array of bulk strings.
    ///
    /// Wire format: `*N\r\n` followed by `$L\r\n<payload>\r\n` per
    /// argument, with the command name as the first element.
    #[must_use]
    pub fn encode_command(&self, cmd: &Command) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(64);
        self.encode_command_into(cmd, &mut buf);
        buf.to_vec()
    }

    pub(crate) fn encode_command_into(&self, cmd: &Command, buf: &mut BytesMut) {
        // a command name may contain a space ("SCRIPT LOAD"); each word is
        // its own bulk string on the wire
        let name_parts: Vec<&str> = cmd.name.split(' ').filter(|s| !s.is_empty()).collect();
        put_header(buf, b'*', (name_parts.len() + cmd.args.len()) as i64);
        for part in name_parts {
            put_bulk(buf, part.as_bytes());
        }
        for arg in &cmd.args {
            match arg {
                Arg::Bytes(b) => put_bulk(buf, b),
                Arg::Text(s) => put_bulk(buf, s.as_bytes()),
                Arg::Int(i) => put_bulk(buf, i.to_string().as_bytes()),
                Arg::Float(f) => put_bulk(buf, f.to_string().as_bytes()),
            }
        }
    }

    /// Applies the text policy to a decoded reply.
    ///
    /// With auto-decode in force (the connection default, overridable per
    /// call), bulk and simple string payloads are validated as UTF-8 and
    /// normalized under the policy; arrays are processed element-wise.
    ///
    /// # Errors
    ///
    /// `RedisError::Decode` under the strict policy for invalid bytes.
    pub fn postprocess(&self, value: Value, decode_override: Option<bool>) -> RedisResult<Value> {
        let decode = decode_override.unwrap_or(self.auto_decode);
        if decode {
            self.decode_value(value)
        } else {
            Ok(value)
        }
    }

    fn decode_value(&self, value: Value) -> RedisResult<Value> {
        match value {
            Value::BulkString(b) => Ok(Value::BulkString(self.decode_bytes(b)?)),
            Value::SimpleString(b) => Ok(Value::SimpleString(self.decode_bytes(b)?)),
            Value::Array(values) => Ok(Value::Array(
                values
                    .into_iter()
                    .map(|v| self.decode_value(v))
                    .collect::<RedisResult<Vec<Value>>>()?,
            )),
            other => Ok(other),
        }
    }

    fn decode_bytes(&self, bytes: Vec<u8>) -> RedisResult<Vec<u8>> {
        match std::str::from_utf8(&bytes) {
            Ok(_) => Ok(bytes),
            Err(_) => match self.policy {
                DecodePolicy::Strict => Err(RedisError::Decode {
                    reason: "reply is not valid UTF-8".to_string(),
                    bytes,
                }),
                DecodePolicy::Replace => {
                    Ok(String::from_utf8_lossy(&bytes).into_owned().into_bytes())
                }
                DecodePolicy::Ignore => Ok(strip_invalid_utf8(&bytes)),
            },
        }
    }
}

fn put_header(buf: &mut BytesMut, prefix: u8, n: i64) {
    buf.put_u8(prefix);
    buf.put_slice(n.to_string().as_bytes());
    buf.put_slice(CRLF);
}

fn put_bulk(buf: &mut BytesMut, payload: &[u8]) {
    put_header(buf, b'$', payload.len() as i64);
    buf.put_slice(payload);
    buf.put_slice(CRLF);
}

fn strip_invalid_utf8(mut bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    loop {
        match std::str::from_utf8(bytes) {
            Ok(s) => {
                out.extend_from_slice(s.as_bytes());
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.extend_from_slice(&bytes[..valid]);
                let skip = e.error_len().unwrap_or(bytes.len() - valid);
                bytes = &bytes[valid + skip..];
            }
        }
    }
}
