//! Connection parameters
use crate::{conn::params::connect_params_builder::ConnectParamsBuilder, RedisError, RedisResult};
use rustls::{
    client::{ServerCertVerified, ServerCertVerifier, ServerName},
    Certificate, ClientConfig, OwnedTrustAnchor, RootCertStore,
};
use secstr::SecUtf8;
use std::{io::Read, path::PathBuf};

/// The server address: a TCP endpoint or a local filesystem socket.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Addr {
    /// TCP, optionally TLS-wrapped (see [`Tls`]).
    Tcp {
        /// The host name or IP address.
        host: String,
        /// The port, default 6379.
        port: u16,
    },
    /// A local filesystem socket.
    Unix(PathBuf),
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// An immutable struct with all information necessary to open a new
/// connection to a server.
///
/// # Instantiating a `ConnectParams` using the `ConnectParamsBuilder`
///
/// See [`ConnectParamsBuilder`](crate::ConnectParamsBuilder) for details.
///
/// # Instantiating a `ConnectParams` from a URL
///
/// See module [`url`](crate::url) for details about the supported URLs.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectParams {
    addr: Addr,
    username: Option<String>,
    password: Option<SecUtf8>,
    tls: Tls,
}

/// Describes whether and how TLS is to be used.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum Tls {
    /// Plain TCP connection.
    #[default]
    Off,
    /// TLS without server validation - dangerous!
    Insecure,
    /// TLS with server validation.
    Secure(Vec<ServerCerts>),
}

/// Describes where server certificates can be found.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ServerCerts {
    /// Path to a folder; all pem files in that folder are evaluated.
    Directory(String),
    /// Name of an environment variable that contains certificates.
    Environment(String),
    /// The certificate itself, in PEM format.
    Direct(String),
    /// The root certificates from <https://mkcert.org/>.
    RootCertificates,
}

impl ConnectParams {
    pub(crate) fn new(
        addr: Addr,
        username: Option<String>,
        password: Option<SecUtf8>,
        tls: Tls,
    ) -> Self {
        Self {
            addr,
            username,
            password,
            tls,
        }
    }

    /// Returns a new builder for `ConnectParams`.
    #[must_use]
    pub fn builder() -> ConnectParamsBuilder {
        ConnectParamsBuilder::new()
    }

    /// The server address.
    #[must_use]
    pub fn addr(&self) -> &Addr {
        &self.addr
    }

    /// The host, for TCP addresses.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        match self.addr {
            Addr::Tcp { ref host, .. } => Some(host),
            Addr::Unix(_) => None,
        }
    }

    /// Whether TLS or a plain connection is to be used.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        !matches!(self.tls, Tls::Off)
    }

    /// The user to authenticate, if credentials are configured.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// The password.
    #[must_use]
    pub fn password(&self) -> Option<&SecUtf8> {
        self.password.as_ref()
    }

    pub(crate) fn rustls_clientconfig(&self) -> RedisResult<ClientConfig> {
        match self.tls {
            Tls::Off => Err(RedisError::Usage(
                "rustls_clientconfig called with Tls::Off - \
                    this should have been prevented earlier",
            )),
            Tls::Insecure => {
                let config = ClientConfig::builder()
                    .with_safe_defaults()
                    .with_custom_certificate_verifier(std::sync::Arc::new(
                        NoCertificateVerification,
                    ))
                    .with_no_client_auth();
                Ok(config)
            }
            Tls::Secure(ref server_certs) => {
                let mut root_store = RootCertStore::empty();
                for server_cert in server_certs {
                    match server_cert {
                        ServerCerts::RootCertificates => {
                            root_store.add_trust_anchors(
                                webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
                                    OwnedTrustAnchor::from_subject_spki_name_constraints(
                                        ta.subject,
                                        ta.spki,
                                        ta.name_constraints,
                                    )
                                }),
                            );
                        }
                        ServerCerts::Direct(pem) => {
                            let (n_ok, n_err) =
                                root_store.add_parsable_certificates(&[pem.clone().into_bytes()]);
                            if n_ok == 0 {
                                info!("None of the directly provided server certificates was accepted");
                            } else if n_err > 0 {
                                info!("Not all directly provided server certificates were accepted");
                            }
                        }
                        ServerCerts::Environment(env_var) => match std::env::var(env_var) {
                            Ok(value) => {
                                let (n_ok, n_err) =
                                    root_store.add_parsable_certificates(&[value.into_bytes()]);
                                if n_ok == 0 {
                                    info!("None of the env-provided server certificates was accepted");
                                } else if n_err > 0 {
                                    info!("Not all env-provided server certificates were accepted");
                                }
                            }
                            Err(e) => {
                                return Err(RedisError::conn_params(
                                    format!("Environment variable {env_var} not found, reason: {e}")
                                        .into(),
                                ));
                            }
                        },
                        ServerCerts::Directory(trust_anchor_dir) => {
                            let trust_anchor_files: Vec<PathBuf> =
                                std::fs::read_dir(trust_anchor_dir)?
                                    .filter_map(Result::ok)
                                    .filter(|dir_entry| {
                                        dir_entry
                                            .file_type()
                                            .map(|ft| ft.is_file())
                                            .unwrap_or(false)
                                    })
                                    .filter(|dir_entry| {
                                        let path = dir_entry.path();
                                        let ext = path.extension();
                                        Some(AsRef::<std::ffi::OsStr>::as_ref("pem")) == ext
                                    })
                                    .map(|dir_entry| dir_entry.path())
                                    .collect();

                            let mut t_ok = 0;
                            let mut t_err = 0;
                            for trust_anchor_file in trust_anchor_files {
                                trace!("Trying trust anchor file {:?}", trust_anchor_file);
                                let mut buf = Vec::<u8>::new();
                                std::fs::File::open(trust_anchor_file)?.read_to_end(&mut buf)?;
                                let (n_ok, n_err) = root_store.add_parsable_certificates(&[buf]);
                                t_ok += n_ok;
                                t_err += n_err;
                            }
                            if t_ok == 0 {
                                info!("None of the server certificates in the given folder was accepted");
                            } else if t_err > 0 {
                                info!("Not all server certificates in the given folder were accepted");
                            }
                        }
                    }
                }
                if root_store.is_empty() {
                    return Err(RedisError::conn_params(
                        "no usable server certificates were configured".into(),
                    ));
                }
                Ok(ClientConfig::builder()
                    .with_safe_defaults()
                    .with_root_certificates(root_store)
                    .with_no_client_auth())
            }
        }
    }
}

impl std::fmt::Display for ConnectParams {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.addr {
            Addr::Tcp { ref host, port } => {
                write!(
                    f,
                    "redis{}://{}{}:{}",
                    if self.is_tls() { "s" } else { "" },
                    self.username
                        .as_deref()
                        .map(|u| format!("{u}@"))
                        .unwrap_or_default(),
                    host,
                    port
                )
            }
            Addr::Unix(ref path) => write!(f, "unix://{}", path.display()),
        }
    }
}

struct NoCertificateVerification;
impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::{Addr, ConnectParams, Tls};

    #[test]
    fn display_hides_password() {
        let params = ConnectParams::new(
            Addr::Tcp {
                host: "localhost".to_string(),
                port: 6379,
            },
            Some("app".to_string()),
            Some("secret".into()),
            Tls::Off,
        );
        let display = format!("{params}");
        assert_eq!(display, "redis://app@localhost:6379");
        assert!(!display.contains("secret"));
    }
}
