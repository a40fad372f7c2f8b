use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Indicates the configuration document is neither JSON nor YAML.
    #[error("unsupported configuration format: {0}")]
    ErrUnsupportedConfig(String),

    /// Indicates a configuration key carries a value the engine cannot
    /// run with.
    #[error("invalid configuration value: {0}")]
    ErrInvalidConfig(String),

    /// Indicates an endpoint that cannot be turned into a socket address.
    #[error("invalid endpoint address: {0}")]
    ErrInvalidAddress(String),

    /// Indicates the OS refused to bind a local endpoint.
    #[error("failed to bind {0}")]
    ErrBindFailed(String),

    /// Indicates a dial did not complete within the connect timeout.
    #[error("failed to connect to {0}")]
    ErrConnectFailed(String),

    /// Indicates a fragment was only partially written.
    #[error("short send: {sent} of {requested} bytes")]
    ErrSendShort { sent: usize, requested: usize },

    /// Indicates a send did not complete within the send timeout.
    #[error("send to {0} timed out")]
    ErrSendTimeout(String),

    /// Indicates the configured connection cap was reached.
    #[error("connection limit of {0} reached")]
    ErrMaxConnections(usize),

    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
