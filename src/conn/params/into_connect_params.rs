use crate::{conn::params::cp_url, ConnectParams, RedisResult};

/// A trait implemented by types that can be converted into a
/// [`ConnectParams`].
///
/// URL options beyond the address, credentials, and TLS configuration are
/// honored by [`Pool::from_url`](crate::Pool::from_url), which also derives
/// the connection configuration and the pool bounds from the URL.
pub trait IntoConnectParams {
    /// Converts the value into a `ConnectParams`.
    ///
    /// # Errors
    ///
    /// `RedisError::ConnParams` for malformed input.
    fn into_connect_params(self) -> RedisResult<ConnectParams>;
}

impl IntoConnectParams for ConnectParams {
    fn into_connect_params(self) -> RedisResult<ConnectParams> {
        Ok(self)
    }
}

impl IntoConnectParams for &str {
    fn into_connect_params(self) -> RedisResult<ConnectParams> {
        cp_url::parse_url(self).map(|parsed| parsed.params)
    }
}

impl IntoConnectParams for String {
    fn into_connect_params(self) -> RedisResult<ConnectParams> {
        self.as_str().into_connect_params()
    }
}
