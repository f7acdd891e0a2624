// The duplex byte transport, split into a read half for the background
// read task and a write half guarded by the connection's write lock.

use crate::{
    conn::params::connect_params::{Addr, ConnectParams},
    RedisError, RedisResult,
};
use rustls::client::ServerName;
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Instant,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
};
use tokio_rustls::{client::TlsStream, TlsConnector};

pub(crate) enum TransportReader {
    Tcp(OwnedReadHalf),
    Tls(ReadHalf<TlsStream<TcpStream>>),
    #[cfg(unix)]
    Unix(tokio::net::unix::OwnedReadHalf),
}

pub(crate) enum TransportWriter {
    Tcp(OwnedWriteHalf),
    Tls(WriteHalf<TlsStream<TcpStream>>),
    #[cfg(unix)]
    Unix(tokio::net::unix::OwnedWriteHalf),
}

// Establishes the transport, with or without TLS, depending on the given
// connection parameters.
pub(crate) async fn connect(
    params: &ConnectParams,
    timeout: Option<std::time::Duration>,
) -> RedisResult<(TransportReader, TransportWriter)> {
    let start = Instant::now();
    trace!("Transport: connecting to {}", params.addr());
    let connecting = connect_inner(params);
    let pair = match timeout {
        Some(deadline) => tokio::time::timeout(deadline, connecting)
            .await
            .map_err(|_| {
                RedisError::connect(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connecting to {} timed out", params.addr()),
                ))
            })??,
        None => connecting.await?,
    };
    trace!(
        "Transport of type {} is initialized ({} µs)",
        pair.1.s_type(),
        Instant::now().duration_since(start).as_micros(),
    );
    Ok(pair)
}

async fn connect_inner(
    params: &ConnectParams,
) -> RedisResult<(TransportReader, TransportWriter)> {
    match params.addr() {
        Addr::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port))
                .await
                .map_err(RedisError::connect)?;
            stream.set_nodelay(true).map_err(RedisError::connect)?;
            if params.is_tls() {
                let config = params.rustls_clientconfig()?;
                let connector = TlsConnector::from(std::sync::Arc::new(config));
                let server_name = ServerName::try_from(host.as_str()).map_err(|_| {
                    RedisError::TlsInvalidDnsName {
                        name: host.clone(),
                    }
                })?;
                let tls_stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(RedisError::connect)?;
                let (r, w) = tokio::io::split(tls_stream);
                Ok((TransportReader::Tls(r), TransportWriter::Tls(w)))
            } else {
                let (r, w) = stream.into_split();
                Ok((TransportReader::Tcp(r), TransportWriter::Tcp(w)))
            }
        }
        #[cfg(unix)]
        Addr::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(path)
                .await
                .map_err(RedisError::connect)?;
            let (r, w) = stream.into_split();
            Ok((TransportReader::Unix(r), TransportWriter::Unix(w)))
        }
        #[cfg(not(unix))]
        Addr::Unix(_) => Err(RedisError::Usage(
            "filesystem sockets are not supported on this platform",
        )),
    }
}

impl TransportWriter {
    // Returns a descriptor of the chosen type
    pub fn s_type(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "Plain TCP",
            Self::Tls(_) => "TLS TCP",
            #[cfg(unix)]
            Self::Unix(_) => "Unix socket",
        }
    }
}

impl AsyncRead for TransportReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut ReadBuf,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Tcp(r) => Pin::new(r).poll_read(cx, buf),
            Self::Tls(r) => Pin::new(r).poll_read(cx, buf),
            #[cfg(unix)]
            Self::Unix(r) => Pin::new(r).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TransportWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Self::Tcp(w) => Pin::new(w).poll_write(cx, buf),
            Self::Tls(w) => Pin::new(w).poll_write(cx, buf),
            #[cfg(unix)]
            Self::Unix(w) => Pin::new(w).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Tcp(w) => Pin::new(w).poll_flush(cx),
            Self::Tls(w) => Pin::new(w).poll_flush(cx),
            #[cfg(unix)]
            Self::Unix(w) => Pin::new(w).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Tcp(w) => Pin::new(w).poll_shutdown(cx),
            Self::Tls(w) => Pin::new(w).poll_shutdown(cx),
            #[cfg(unix)]
            Self::Unix(w) => Pin::new(w).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for TransportReader {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            Self::Tcp(_) => "TransportReader::Tcp",
            Self::Tls(_) => "TransportReader::Tls",
            #[cfg(unix)]
            Self::Unix(_) => "TransportReader::Unix",
        })
    }
}

impl std::fmt::Debug for TransportWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            Self::Tcp(_) => "TransportWriter::Tcp",
            Self::Tls(_) => "TransportWriter::Tls",
            #[cfg(unix)]
            Self::Unix(_) => "TransportWriter::Unix",
        })
    }
}
