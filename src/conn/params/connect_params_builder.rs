use crate::{
    conn::params::connect_params::{Addr, ConnectParams, ServerCerts, Tls},
    RedisError, RedisResult,
};
use secstr::SecUtf8;
use std::path::PathBuf;

/// Default port of the server.
pub const DEFAULT_PORT: u16 = 6379;

/// A builder for [`ConnectParams`].
///
/// An instance can be directly created, or from a URL
/// (see [`IntoConnectParamsBuilder`](crate::IntoConnectParamsBuilder)
/// and module [`url`](crate::url)).
///
/// ```rust
/// use redisconnect::ConnectParams;
///
/// let connect_params = ConnectParams::builder()
///    .hostname("the_host")
///    .port(6380)
///    .password("my_passwd")
///    .build()
///    .unwrap();
/// ```
#[derive(Clone, Debug, Default)]
pub struct ConnectParamsBuilder {
    hostname: Option<String>,
    port: Option<u16>,
    unix_socket: Option<PathBuf>,
    username: Option<String>,
    password: Option<SecUtf8>,
    tls: Tls,
}

impl ConnectParamsBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the hostname.
    pub fn hostname<H: AsRef<str>>(&mut self, hostname: H) -> &mut Self {
        self.hostname = Some(hostname.as_ref().to_owned());
        self
    }

    /// Sets the port.
    pub fn port(&mut self, port: u16) -> &mut Self {
        self.port = Some(port);
        self
    }

    /// Sets a filesystem socket path; takes precedence over hostname/port.
    pub fn unix_socket<P: Into<PathBuf>>(&mut self, path: P) -> &mut Self {
        self.unix_socket = Some(path.into());
        self
    }

    /// Sets the user name for authentication.
    pub fn username<U: AsRef<str>>(&mut self, username: U) -> &mut Self {
        self.username = Some(username.as_ref().to_owned());
        self
    }

    /// Sets the password.
    pub fn password<P: AsRef<str>>(&mut self, pw: P) -> &mut Self {
        self.password = Some(SecUtf8::from(pw.as_ref()));
        self
    }

    /// Unsets the password.
    pub fn unset_password(&mut self) -> &mut Self {
        self.password = None;
        self
    }

    /// Makes the driver use TLS with server validation based on the given
    /// certificate source.
    ///
    /// Multiple calls accumulate certificate sources.
    pub fn tls_with(&mut self, server_certs: ServerCerts) -> &mut Self {
        match self.tls {
            Tls::Off | Tls::Insecure => {
                self.tls = Tls::Secure(vec![server_certs]);
            }
            Tls::Secure(ref mut certs) => certs.push(server_certs),
        }
        self
    }

    /// Makes the driver use TLS without server validation - dangerous!
    pub fn tls_without_server_verification(&mut self) -> &mut Self {
        self.tls = Tls::Insecure;
        self
    }

    /// Constructs a `ConnectParams` from the builder.
    ///
    /// # Errors
    ///
    /// `RedisError::Usage` if no address was provided, or if TLS options
    /// were combined with a filesystem socket.
    pub fn build(&self) -> RedisResult<ConnectParams> {
        let addr = if let Some(ref path) = self.unix_socket {
            if !matches!(self.tls, Tls::Off) {
                return Err(RedisError::Usage(
                    "TLS is not supported on filesystem sockets",
                ));
            }
            Addr::Unix(path.clone())
        } else {
            Addr::Tcp {
                host: self
                    .hostname
                    .clone()
                    .ok_or(RedisError::Usage("hostname is missing"))?,
                port: self.port.unwrap_or(DEFAULT_PORT),
            }
        };
        Ok(ConnectParams::new(
            addr,
            self.username.clone(),
            self.password.clone(),
            self.tls.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectParamsBuilder;
    use crate::conn::params::connect_params::{Addr, ServerCerts, Tls};

    #[test]
    fn builds_tcp_params_with_default_port() {
        let params = ConnectParamsBuilder::new()
            .hostname("localhost")
            .build()
            .unwrap();
        assert_eq!(
            *params.addr(),
            Addr::Tcp {
                host: "localhost".to_string(),
                port: 6379
            }
        );
        assert!(!params.is_tls());
    }

    #[test]
    fn accumulates_cert_sources() {
        let mut builder = ConnectParamsBuilder::new();
        builder
            .hostname("h")
            .tls_with(ServerCerts::RootCertificates)
            .tls_with(ServerCerts::Directory("/tmp/certs".to_string()));
        let params = builder.build().unwrap();
        assert!(params.is_tls());
    }

    #[test]
    fn rejects_tls_on_unix_sockets() {
        let mut builder = ConnectParamsBuilder::new();
        builder.unix_socket("/var/run/redis.sock");
        builder.tls_without_server_verification();
        assert!(builder.build().is_err());
        assert!(matches!(builder.tls, Tls::Insecure));
    }

    #[test]
    fn missing_hostname_is_an_error() {
        assert!(ConnectParamsBuilder::new().build().is_err());
    }
}
