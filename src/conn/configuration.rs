use crate::protocol::DecodePolicy;
use std::time::Duration;

// docu is written at the re-export in lib.rs
#[derive(Debug, Clone)]
pub struct ConnectionConfiguration {
    db: u32,
    client_name: Option<String>,
    auto_decode: bool,
    encoding_errors: DecodePolicy,
    connect_timeout: Option<Duration>,
    response_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    health_check_interval: Option<Duration>,
    retry_on_timeout: bool,
    readonly: bool,
}

impl Default for ConnectionConfiguration {
    fn default() -> Self {
        Self {
            db: 0,
            client_name: None,
            auto_decode: false,
            encoding_errors: DecodePolicy::Strict,
            connect_timeout: Some(Self::DEFAULT_CONNECT_TIMEOUT),
            response_timeout: None,
            write_timeout: None,
            health_check_interval: None,
            retry_on_timeout: false,
            readonly: false,
        }
    }
}

impl ConnectionConfiguration {
    /// Default deadline for establishing the transport.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Returns the index of the logical database that is selected after
    /// connecting.
    #[must_use]
    pub fn db(&self) -> u32 {
        self.db
    }
    /// Sets the index of the logical database that is selected after
    /// connecting.
    pub fn set_db(&mut self, db: u32) {
        self.db = db;
    }
    /// Builder-method for setting the logical database index.
    #[must_use]
    pub fn with_db(mut self, db: u32) -> Self {
        self.db = db;
        self
    }

    /// Returns the client name that is announced via `CLIENT SETNAME`.
    #[must_use]
    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }
    /// Sets the client name that is announced via `CLIENT SETNAME`.
    pub fn set_client_name<S: AsRef<str>>(&mut self, name: S) {
        self.client_name = Some(name.as_ref().to_owned());
    }
    /// Builder-method for setting the client name.
    #[must_use]
    pub fn with_client_name<S: AsRef<str>>(mut self, name: S) -> Self {
        self.client_name = Some(name.as_ref().to_owned());
        self
    }

    /// Returns whether bulk string replies are decoded as UTF-8 text.
    #[must_use]
    pub fn is_auto_decode(&self) -> bool {
        self.auto_decode
    }
    /// Defines whether bulk string replies are decoded as UTF-8 text.
    ///
    /// Individual calls can override this per command; binary commands
    /// should do so.
    pub fn set_auto_decode(&mut self, ad: bool) {
        self.auto_decode = ad;
    }
    /// Builder-method for defining whether bulk string replies are decoded
    /// as UTF-8 text.
    #[must_use]
    pub fn with_auto_decode(mut self, ad: bool) -> Self {
        self.auto_decode = ad;
        self
    }

    /// Returns the text decoding policy.
    #[must_use]
    pub fn encoding_errors(&self) -> DecodePolicy {
        self.encoding_errors
    }
    /// Sets the text decoding policy.
    pub fn set_encoding_errors(&mut self, policy: DecodePolicy) {
        self.encoding_errors = policy;
    }
    /// Builder-method for setting the text decoding policy.
    #[must_use]
    pub fn with_encoding_errors(mut self, policy: DecodePolicy) -> Self {
        self.encoding_errors = policy;
        self
    }

    /// Returns the deadline for establishing the transport.
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }
    /// Sets the deadline for establishing the transport.
    pub fn set_connect_timeout(&mut self, t: Option<Duration>) {
        self.connect_timeout = t;
    }
    /// Builder-method for setting the deadline for establishing the
    /// transport.
    #[must_use]
    pub fn with_connect_timeout(mut self, t: Option<Duration>) -> Self {
        self.connect_timeout = t;
        self
    }

    /// Returns the per-command reply deadline.
    #[must_use]
    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout
    }
    /// Sets the per-command reply deadline.
    pub fn set_response_timeout(&mut self, t: Option<Duration>) {
        self.response_timeout = t;
    }
    /// Builder-method for setting the per-command reply deadline.
    #[must_use]
    pub fn with_response_timeout(mut self, t: Option<Duration>) -> Self {
        self.response_timeout = t;
        self
    }

    /// Returns the deadline for a single write to the transport.
    #[must_use]
    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }
    /// Sets the deadline for a single write to the transport.
    pub fn set_write_timeout(&mut self, t: Option<Duration>) {
        self.write_timeout = t;
    }
    /// Builder-method for setting the deadline for a single write to the
    /// transport.
    #[must_use]
    pub fn with_write_timeout(mut self, t: Option<Duration>) -> Self {
        self.write_timeout = t;
        self
    }

    /// Returns the idle age after which a pooled connection is pinged
    /// before being handed out.
    #[must_use]
    pub fn health_check_interval(&self) -> Option<Duration> {
        self.health_check_interval
    }
    /// Sets the idle age after which a pooled connection is pinged before
    /// being handed out.
    pub fn set_health_check_interval(&mut self, t: Option<Duration>) {
        self.health_check_interval = t;
    }
    /// Builder-method for setting the health check interval.
    #[must_use]
    pub fn with_health_check_interval(mut self, t: Option<Duration>) -> Self {
        self.health_check_interval = t;
        self
    }

    /// Returns whether a timed-out command is retried once after a
    /// reconnect.
    #[must_use]
    pub fn is_retry_on_timeout(&self) -> bool {
        self.retry_on_timeout
    }
    /// Defines whether a timed-out command is retried once after a
    /// reconnect.
    ///
    /// Only the connection's own configured deadlines trigger the retry;
    /// transport failures never do.
    pub fn set_retry_on_timeout(&mut self, retry: bool) {
        self.retry_on_timeout = retry;
    }
    /// Builder-method for defining whether a timed-out command is retried
    /// once after a reconnect.
    #[must_use]
    pub fn with_retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    /// Returns whether `READONLY` is issued after connecting.
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }
    /// Defines whether `READONLY` is issued after connecting (for reads
    /// against a cluster replica).
    pub fn set_readonly(&mut self, readonly: bool) {
        self.readonly = readonly;
    }
    /// Builder-method for defining whether `READONLY` is issued after
    /// connecting.
    #[must_use]
    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }
}
