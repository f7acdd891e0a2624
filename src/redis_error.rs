use thiserror::Error;

/// A list specifying categories of [`RedisError`](crate::RedisError).
///
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RedisError {
    /// An argument cannot be encoded as a command argument.
    #[error("Cannot encode command argument: {}", reason)]
    Encode {
        /// What went wrong.
        reason: String,
    },

    /// Reply bytes are not valid under the configured text codec,
    /// original bytes are available.
    #[error("Cannot decode reply bytes: {}", reason)]
    Decode {
        /// What went wrong.
        reason: String,
        /// The offending bytes.
        bytes: Vec<u8>,
    },

    /// The byte stream received from the server violates the wire protocol.
    #[error("Protocol violation: {}", reason)]
    Protocol {
        /// What went wrong.
        reason: String,
    },

    /// Establishing the transport failed.
    #[error("Connection setup failed")]
    Connect {
        /// The causing Error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The transport was closed while an operation was in flight.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// An I/O deadline was exceeded.
    #[error("I/O deadline exceeded")]
    Timeout,

    /// The server rejected the configured credentials.
    #[error("Authentication failed: {}", message)]
    Auth {
        /// The server's error text.
        message: String,
    },

    /// A write command was issued against a read-only replica.
    #[error("Server is read-only: {}", message)]
    ReadOnly {
        /// The server's error text.
        message: String,
    },

    /// The server is still loading its dataset.
    #[error("Server is loading its dataset: {}", message)]
    BusyLoading {
        /// The server's error text.
        message: String,
    },

    /// `EVALSHA` referenced a script that is not in the server's script cache.
    #[error("No matching script in the script cache: {}", message)]
    NoScript {
        /// The server's error text.
        message: String,
    },

    /// The transaction was aborted by the server.
    #[error("Transaction aborted: {}", message)]
    ExecAbort {
        /// The server's error text.
        message: String,
    },

    /// `EXEC` returned nil because a watched key was modified.
    #[error("A watched key was modified before EXEC")]
    Watch,

    /// A server-side error that does not match a more specific category.
    #[error("Server responded with an error: {} {}", kind, message)]
    Response {
        /// The first word of the server's error reply.
        kind: String,
        /// The remainder of the server's error reply.
        message: String,
    },

    /// An operation was attempted on a pool that has been closed.
    #[error("Pool is closed")]
    PoolClosed,

    /// Waiting for a pooled connection exceeded the configured deadline.
    #[error("Timed out waiting for a pooled connection")]
    PoolTimeout,

    /// Protocol violation while the connection is in subscribe mode.
    #[error("Pub/sub error: {}", reason)]
    PubSub {
        /// What went wrong.
        reason: String,
    },

    /// Erroneous connection parameters, e.g. from a malformed connection URL.
    #[error("Erroneous connection parameters")]
    ConnParams {
        /// The causing Error.
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// TLS setup failed because the server name was not valid.
    #[error("TLS setup failed because the server name {:?} is not valid", name)]
    TlsInvalidDnsName {
        /// The offending name.
        name: String,
    },

    /// TLS protocol error.
    #[error(
        "TLS setup failed after setting up the TCP connection; is the server prepared for TLS?"
    )]
    TlsProtocol {
        /// The causing Error.
        #[from]
        source: rustls::Error,
    },

    /// Error caused by wrong usage.
    #[error("Wrong usage: {}", _0)]
    Usage(&'static str),

    /// Error caused by wrong usage.
    #[error("Wrong usage: {}", _0)]
    UsageDetailed(String),

    /// Error occured in communication with the server.
    #[error(transparent)]
    Io {
        /// The causing Error.
        #[from]
        source: std::io::Error,
    },
}

/// Abbreviation of `Result<T, RedisError>`.
pub type RedisResult<T> = std::result::Result<T, RedisError>;

impl RedisError {
    pub(crate) fn protocol<S: Into<String>>(reason: S) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    pub(crate) fn encode<S: Into<String>>(reason: S) -> Self {
        Self::Encode {
            reason: reason.into(),
        }
    }

    pub(crate) fn conn_params(error: Box<dyn std::error::Error + Send + Sync + 'static>) -> Self {
        Self::ConnParams { source: error }
    }

    pub(crate) fn connect<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Self::Connect {
            source: Box::new(error),
        }
    }

    /// Maps the first word of a server error reply to the matching category.
    ///
    /// Unknown kinds become the generic [`RedisError::Response`].
    #[must_use]
    pub fn from_server(kind: &str, message: &str) -> Self {
        match kind {
            "NOAUTH" | "WRONGPASS" => Self::Auth {
                message: message.to_string(),
            },
            "READONLY" => Self::ReadOnly {
                message: message.to_string(),
            },
            "LOADING" => Self::BusyLoading {
                message: message.to_string(),
            },
            "NOSCRIPT" => Self::NoScript {
                message: message.to_string(),
            },
            "EXECABORT" => Self::ExecAbort {
                message: message.to_string(),
            },
            _ => Self::Response {
                kind: kind.to_string(),
                message: message.to_string(),
            },
        }
    }

    /// Returns true if the error indicates that the transport is gone
    /// and the command did not produce a reply.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed | Self::Connect { .. } | Self::Io { .. }
        )
    }

    /// Returns true for deadline expiries that are eligible for the
    /// one-shot reconnect-and-retry of `retry_on_timeout`.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Returns the `(kind, message)` pair of a server-side error, if any.
    ///
    /// This method helps in case you need programmatic access to the raw
    /// error text the server sent.
    #[must_use]
    pub fn server_error(&self) -> Option<(&str, &str)> {
        match self {
            Self::Auth { message } => Some(("NOAUTH", message)),
            Self::ReadOnly { message } => Some(("READONLY", message)),
            Self::BusyLoading { message } => Some(("LOADING", message)),
            Self::NoScript { message } => Some(("NOSCRIPT", message)),
            Self::ExecAbort { message } => Some(("EXECABORT", message)),
            Self::Response { kind, message } => Some((kind, message)),
            _ => None,
        }
    }
}
