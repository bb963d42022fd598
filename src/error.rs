//! LwM2M client core error types.
//!
//! # Error Classification
//!
//! Errors produced by the registration core fall into a small taxonomy:
//!
//! - **Validation**: a Server object instance is malformed; rejected before
//!   the server is ever activated and never retried
//! - **Network**: transient transport trouble (timeouts, connect failures);
//!   retried through the scheduler's backoff, the connection is suspended
//!   rather than destroyed
//! - **Rejected**: the server refused an Update; forces a full Register
//! - **Forbidden**: the server refused the Register itself; terminal for the
//!   current activation attempt
//! - **Internal**: invariant violations; the operation is aborted and the
//!   server entry keeps its prior state
//!
//! Only `Internal`, `Validation` and the API-level negatives (`Offline`,
//! `ServerNotFound`) are expected to reach callers of the public API; the
//! others are absorbed by the registration driver and turned into
//! scheduling decisions.

use thiserror::Error;

use crate::protocol::Ssid;

/// LwM2M client core errors.
#[derive(Error, Debug)]
pub enum Lwm2mError {
    /// Malformed Server object instance or inconsistent object set.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transient network failure.
    #[error("Network error: {0}")]
    Network(String),

    /// The server rejected the request at the application level.
    #[error("Request rejected by server")]
    Rejected,

    /// Registration was explicitly refused by the server.
    #[error("Registration forbidden by server")]
    Forbidden,

    /// Invariant violation or missing internal state.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Operation requires the client to be online.
    #[error("Client is offline")]
    Offline,

    /// No (active) server entry with the given SSID.
    #[error("Server not found: SSID {0}")]
    ServerNotFound(Ssid),

    /// Binding mode string outside the valid set.
    #[error("Invalid binding mode: {0:?}")]
    InvalidBinding(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for LwM2M core operations
pub type Result<T> = std::result::Result<T, Lwm2mError>;

impl From<toml::de::Error> for Lwm2mError {
    fn from(err: toml::de::Error) -> Self {
        Lwm2mError::Config(err.to_string())
    }
}

impl From<crate::transport::TransportError> for Lwm2mError {
    fn from(err: crate::transport::TransportError) -> Self {
        Lwm2mError::Network(err.to_string())
    }
}

impl From<crate::transport::ExchangeError> for Lwm2mError {
    fn from(err: crate::transport::ExchangeError) -> Self {
        use crate::transport::ExchangeError;

        match err {
            ExchangeError::Network(msg) => Lwm2mError::Network(msg),
            ExchangeError::Rejected => Lwm2mError::Rejected,
            ExchangeError::Forbidden => Lwm2mError::Forbidden,
            ExchangeError::Other(msg) => Lwm2mError::Internal(msg),
        }
    }
}
