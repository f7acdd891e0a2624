use crate::{RedisError, RedisResult};

/// The algebraic type emitted by the reply parser and consumed by the
/// layers above.
///
/// Bulk strings preserve the exact bytes the server sent; no text decoding
/// happens at this layer. The nil bulk reply (`$-1`) and the nil array
/// reply (`*-1`) both surface as [`Value::Nil`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// The nil reply.
    Nil,
    /// A simple (status) string, e.g. `+OK`.
    SimpleString(Vec<u8>),
    /// A server-side error reply; `kind` is the first whitespace-delimited
    /// word, e.g. `WRONGTYPE` or `MOVED`.
    Error {
        /// Error kind token.
        kind: String,
        /// Remainder of the error line.
        message: String,
    },
    /// A signed 64-bit integer reply.
    Integer(i64),
    /// A bulk string reply with its exact payload bytes.
    BulkString(Vec<u8>),
    /// An array reply.
    Array(Vec<Value>),
}

impl Value {
    /// Returns true for the nil reply.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Returns true for the `+OK` status reply.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::SimpleString(s) if s == b"OK")
    }

    /// The payload bytes of a simple or bulk string reply.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::SimpleString(b) | Self::BulkString(b) => Some(b),
            _ => None,
        }
    }

    /// The integer payload, also accepting integers transported as strings.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::SimpleString(b) | Self::BulkString(b) => {
                std::str::from_utf8(b).ok()?.parse().ok()
            }
            _ => None,
        }
    }

    /// Consumes a simple or bulk string reply into its payload bytes.
    ///
    /// # Errors
    ///
    /// `RedisError::Usage` if the value is not a string reply.
    pub fn into_bytes(self) -> RedisResult<Vec<u8>> {
        match self {
            Self::SimpleString(b) | Self::BulkString(b) => Ok(b),
            _ => Err(RedisError::Usage("not a string reply")),
        }
    }

    /// Consumes a simple or bulk string reply into a `String`.
    ///
    /// # Errors
    ///
    /// `RedisError::Decode` if the payload is not valid UTF-8,
    /// `RedisError::Usage` if the value is not a string reply.
    pub fn into_string(self) -> RedisResult<String> {
        String::from_utf8(self.into_bytes()?).map_err(|e| {
            let bytes = e.into_bytes();
            RedisError::Decode {
                reason: "reply is not valid UTF-8".to_string(),
                bytes,
            }
        })
    }

    /// Consumes an array reply into its elements.
    ///
    /// # Errors
    ///
    /// `RedisError::Usage` if the value is not an array reply.
    pub fn into_array(self) -> RedisResult<Vec<Value>> {
        match self {
            Self::Array(values) => Ok(values),
            _ => Err(RedisError::Usage("not an array reply")),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Nil => write!(f, "(nil)"),
            Self::SimpleString(b) | Self::BulkString(b) => {
                write!(f, "{}", String::from_utf8_lossy(b))
            }
            Self::Error { kind, message } => write!(f, "({kind} {message})"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Array(values) => {
                write!(f, "[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
        }
    }
}
