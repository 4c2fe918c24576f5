//! Error types shared across the canvas crates.

use miette::Diagnostic;

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error, Diagnostic)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    #[diagnostic(code(canvas::config::read))]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write config file {path}")]
    #[diagnostic(code(canvas::config::write))]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported config format: {0}")]
    #[diagnostic(
        code(canvas::config::format),
        help("use a .json or .toml file extension")
    )]
    UnsupportedFormat(String),

    #[error("failed to parse config: {0}")]
    #[diagnostic(code(canvas::config::parse))]
    Parse(String),

    #[error("invalid value for {key}: {message}")]
    #[diagnostic(code(canvas::config::invalid))]
    Invalid { key: &'static str, message: String },
}

/// Errors from the transport channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Diagnostic)]
#[non_exhaustive]
pub enum TransportError {
    #[error("transport is not connected")]
    #[diagnostic(code(canvas::transport::not_connected))]
    NotConnected,

    #[error("transport has been destroyed")]
    #[diagnostic(code(canvas::transport::destroyed))]
    Destroyed,

    #[error("access to room {0} denied")]
    #[diagnostic(code(canvas::transport::denied))]
    AccessDenied(String),

    #[error("failed to encode message: {0}")]
    #[diagnostic(code(canvas::transport::encode))]
    Encode(String),

    #[error("failed to decode message: {0}")]
    #[diagnostic(code(canvas::transport::decode))]
    Decode(String),
}

impl From<postcard::Error> for TransportError {
    fn from(err: postcard::Error) -> Self {
        TransportError::Decode(err.to_string())
    }
}
