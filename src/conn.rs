// The connection to the server, and the parameters for creating one.

mod configuration;
mod connection;
mod params;
mod transport;

pub(crate) use connection::{DispatchOutcome, PushDispatch};

pub use {
    configuration::ConnectionConfiguration,
    connection::{Connection, ConnectionStatus, ReconnectHook},
    params::{
        connect_params::{Addr, ConnectParams, ServerCerts, Tls},
        connect_params_builder::ConnectParamsBuilder,
        into_connect_params::IntoConnectParams,
    },
};

pub(crate) use params::cp_url;
