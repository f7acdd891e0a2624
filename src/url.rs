//! Constants for use in connection URLs.
//!
//! Connections and pools are configured with an instance of
//! [`ConnectParams`](crate::ConnectParams) plus a
//! [`ConnectionConfiguration`](crate::ConnectionConfiguration); both can be
//! derived from a URL.
//!
//! Such a URL is supposed to have the form
//!
//! ```text
//! <scheme>://[<username>[:<password>]@]<host>[:<port>][/<db>][<options>]
//! ```
//! where
//! > `<scheme>` = `redis` | `rediss` | `unix`
//! > `<username>` = the name of the user to authenticate (optional)
//! > `<password>` = the password of that user
//! > `<host>` = the host where the server can be found
//! > `<port>` = the port at which the server can be found on `<host>`
//! >            (default: 6379)
//! > `<db>` = the index of the logical database to select
//! > `<options>` = `?<key>[=<value>][{&<key>[=<value>]}]`
//!
//! With the `unix` scheme the authority is empty and the path names the
//! filesystem socket, e.g. `unix:///var/run/redis.sock?db=3`.
//!
//! __Supported options are:__
//! - `db=<index>` selects the logical database (alternative to the path)
//! - `client_name=<name>` is announced to the server via `CLIENT SETNAME`
//! - `auto_decode=<bool>` decodes bulk string replies as UTF-8 text
//! - `encoding_errors=strict|replace|ignore` the text decoding policy
//! - `connect_timeout=<seconds>` deadline for establishing the transport
//! - `response_timeout=<seconds>` per-command reply deadline
//! - `health_check_interval=<seconds>` idle age after which a pooled
//!   connection is pinged before being handed out
//! - `retry_on_timeout=<bool>` retry a timed-out command once after a
//!   reconnect
//! - `readonly=<bool>` issue `READONLY` after connecting (replica reads)
//! - `min_size=<n>` / `max_size=<n>` pool bounds
//! - `acquire_timeout=<seconds>` deadline for waiting on an exhausted pool
//! - the [TLS](https://en.wikipedia.org/wiki/Transport_Layer_Security)
//!   options
//!
//! __The TLS options are:__
//! - `tls_certificate_dir=<value>`: points to a folder with pem files that
//!   contain certificates; all pem files in that folder are evaluated
//! - `tls_certificate_env=<value>`: denotes an environment variable that
//!   contains certificates
//! - `use_mozillas_root_certificates` (no value): use the root certificates
//!   from [`https://mkcert.org/`](https://mkcert.org/)
//! - `insecure_omit_server_certificate_check` (no value): lets the client
//!   omit the validation of the server's identity. Don't use this option in
//!   productive setups!
//!
//! __To configure TLS__, use the scheme `rediss`; without any explicit
//! TLS option the Mozilla root certificates are used for server
//! validation.
//!
//! __For a plain connection without TLS__, use the scheme `redis` or
//! `unix` and none of the TLS options.

/// Protocol without TLS.
pub const REDIS: &str = "redis";

/// Protocol with TLS.
pub const REDISS: &str = "rediss";

/// Protocol over a local filesystem socket.
pub const UNIX: &str = "unix";

/// Option-key for selecting the logical database.
pub const DB: &str = "db";

/// Option-key for the client name announced via `CLIENT SETNAME`.
pub const CLIENT_NAME: &str = "client_name";

/// Option-key for decoding bulk string replies as UTF-8 text.
pub const AUTO_DECODE: &str = "auto_decode";

/// Option-key for the text decoding policy (`strict`, `replace`, `ignore`).
pub const ENCODING_ERRORS: &str = "encoding_errors";

/// Option-key for the transport-establishment deadline in seconds.
pub const CONNECT_TIMEOUT: &str = "connect_timeout";

/// Option-key for the per-command reply deadline in seconds.
pub const RESPONSE_TIMEOUT: &str = "response_timeout";

/// Option-key for the idle age (in seconds) after which a pooled
/// connection is pinged before being handed out.
pub const HEALTH_CHECK_INTERVAL: &str = "health_check_interval";

/// Option-key for retrying a timed-out command once after a reconnect.
pub const RETRY_ON_TIMEOUT: &str = "retry_on_timeout";

/// Option-key for issuing `READONLY` after connecting.
pub const READONLY: &str = "readonly";

/// Option-key for the minimum number of pooled connections.
pub const MIN_SIZE: &str = "min_size";

/// Option-key for the maximum number of pooled connections.
pub const MAX_SIZE: &str = "max_size";

/// Option-key for the deadline (in seconds) for waiting on an exhausted
/// pool.
pub const ACQUIRE_TIMEOUT: &str = "acquire_timeout";

/// Option-key for denoting a folder in which server certificates can be
/// found.
pub const TLS_CERTIFICATE_DIR: &str = "tls_certificate_dir";

/// Option-key for denoting an environment variable in which a server
/// certificate can be found.
pub const TLS_CERTIFICATE_ENV: &str = "tls_certificate_env";

/// Option-key (no value) for using the root certificates from
/// [`https://mkcert.org/`](https://mkcert.org/).
pub const USE_MOZILLAS_ROOT_CERTIFICATES: &str = "use_mozillas_root_certificates";

/// Option-key (no value) for omitting the validation of the server's
/// identity.
pub const INSECURE_OMIT_SERVER_CERTIFICATE_CHECK: &str = "insecure_omit_server_certificate_check";
