//! Transport layer abstraction for the LwM2M client core.
//!
//! The registration core never touches the network directly. It consumes
//! three narrow contracts:
//!
//! - [`SocketFactory`]: creates a [`ServerSocket`] for a transport
//! - [`ServerSocket`]: bind / connect / close one socket, keeping
//!   resumption state in a caller-owned [`NontransientState`]
//! - [`RegistrationExchange`]: the CoAP-level Register, Update and
//!   De-register exchanges, reporting a small [`ExchangeError`] taxonomy
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            ServerManager                 │
//! │   (registration state machine)          │
//! └──────────┬───────────────────┬──────────┘
//!            │                   │
//!            ▼                   ▼
//! ┌─────────────────┐ ┌──────────────────────┐
//! │  SocketFactory  │ │ RegistrationExchange │
//! │  (UDP, mock)    │ │  (CoAP, mock)        │
//! └─────────────────┘ └──────────────────────┘
//! ```
//!
//! Trait methods return boxed futures so the contracts stay object safe.

pub mod mock;
mod udp;
mod uri;

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;

use crate::protocol::{ConnectionType, EndpointPath, RegisterRequest, UpdateRequest};

pub use udp::{AddressFamily, UdpServerSocket, UdpSocketFactory};
pub use uri::{ServerUri, UriScheme};

/// Identity of a socket, unique per factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SocketId(u64);

impl SocketId {
    /// Wrap a raw identifier
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw identifier
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection state that survives socket teardown and recreation.
///
/// Kept per server and transport for the lifetime of the server entry;
/// deactivation for reconnect never clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NontransientState {
    /// Address chosen among multiple DNS results last time
    pub preferred_endpoint: Option<SocketAddr>,
    /// Secure session cache for resumption
    pub session_cache: Option<Bytes>,
    /// Local port the socket was bound to last time
    pub last_local_port: Option<u16>,
}

/// Outcome of connecting a socket with respect to session resumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resumption {
    /// No security layer, nothing to resume
    NotSecure,
    /// Previous secure session resumed
    Resumed,
    /// A brand new secure session was negotiated
    NewSession,
}

/// Socket-level failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Transport or security mode not supported by the factory.
    #[error("Unsupported transport: {0}")]
    Unsupported(String),

    /// Server URI cannot be used.
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// Host name resolution failed.
    #[error("Could not resolve {0}")]
    Resolve(String),

    /// Binding the local address failed.
    #[error("Could not bind to port {port:?}: {reason}")]
    Bind {
        /// Requested port, `None` for ephemeral
        port: Option<u16>,
        /// Failure description
        reason: String,
    },

    /// Connecting to the remote endpoint failed.
    #[error("Could not connect to {host}:{port}: {reason}")]
    Connect {
        /// Remote host
        host: String,
        /// Remote port
        port: u16,
        /// Failure description
        reason: String,
    },

    /// Operation requires a connected socket.
    #[error("Socket not connected")]
    NotConnected,

    /// I/O error.
    #[error("IO error: {0}")]
    Io(String),
}

impl TransportError {
    /// Whether retrying cannot help
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unsupported(_) | Self::InvalidUri(_))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Failures of a Register / Update / De-register exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// Timeout or socket failure.
    #[error("Network error: {0}")]
    Network(String),

    /// Server rejected the request; a full Register is needed.
    #[error("Request rejected")]
    Rejected,

    /// Server refused the registration.
    #[error("Forbidden")]
    Forbidden,

    /// Any other failure.
    #[error("Exchange failed: {0}")]
    Other(String),
}

impl From<TransportError> for ExchangeError {
    fn from(err: TransportError) -> Self {
        ExchangeError::Network(err.to_string())
    }
}

/// One socket towards an LwM2M server.
///
/// Implementations own the OS resources; closing keeps the object around
/// so it can be bound and connected again.
pub trait ServerSocket: Send {
    /// Identity used to map incoming traffic back to a server
    fn id(&self) -> SocketId;

    /// Bind the local side, `None` meaning an ephemeral port.
    fn bind(&mut self, local_port: Option<u16>) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Connect to `remote`, reading and updating resumption `state`.
    fn connect<'a>(
        &'a mut self,
        remote: &'a ServerUri,
        state: &'a mut NontransientState,
    ) -> BoxFuture<'a, Result<Resumption, TransportError>>;

    /// Port the socket is bound to
    fn local_port(&self) -> Result<u16, TransportError>;

    /// Whether the socket is connected
    fn is_connected(&self) -> bool;

    /// Disconnect and release OS resources
    fn close(&mut self);
}

/// Creates sockets for a given transport.
pub trait SocketFactory: Send + Sync {
    /// Create an unbound, unconnected socket for `remote`
    fn create(
        &self,
        conn_type: ConnectionType,
        remote: &ServerUri,
    ) -> Result<Box<dyn ServerSocket>, TransportError>;
}

/// CoAP-level registration exchanges.
pub trait RegistrationExchange: Send + Sync {
    /// Send Register, returning the Location path assigned by the server
    fn register<'a>(
        &'a self,
        socket: &'a mut dyn ServerSocket,
        request: &'a RegisterRequest,
    ) -> BoxFuture<'a, Result<EndpointPath, ExchangeError>>;

    /// Send Update to an existing registration
    fn update<'a>(
        &'a self,
        socket: &'a mut dyn ServerSocket,
        endpoint: &'a EndpointPath,
        request: &'a UpdateRequest,
    ) -> BoxFuture<'a, Result<(), ExchangeError>>;

    /// Send De-register
    fn deregister<'a>(
        &'a self,
        socket: &'a mut dyn ServerSocket,
        endpoint: &'a EndpointPath,
    ) -> BoxFuture<'a, Result<(), ExchangeError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_fatality() {
        assert!(TransportError::Unsupported("DTLS".to_string()).is_fatal());
        assert!(TransportError::InvalidUri("x".to_string()).is_fatal());
        assert!(!TransportError::NotConnected.is_fatal());
        assert!(!TransportError::Connect {
            host: "example.com".to_string(),
            port: 5683,
            reason: "refused".to_string(),
        }
        .is_fatal());
    }

    #[test]
    fn test_exchange_error_from_transport() {
        let err: ExchangeError = TransportError::NotConnected.into();
        assert!(matches!(err, ExchangeError::Network(_)));
    }

    #[test]
    fn test_socket_id_display() {
        assert_eq!(SocketId::new(7).to_string(), "#7");
    }
}
