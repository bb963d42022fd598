//! Per-transport connection lifecycle.
//!
//! ```text
//!             bring_online()
//!  NoSocket ───────────────────▶ Online
//!     ▲                          │   ▲
//!     │ cleanup()      suspend() │   │ bring_online()
//!     │                          ▼   │
//!     └──────────────────────── Suspended
//! ```
//!
//! A suspended connection keeps its socket object so it can be reconnected
//! in place. Resumption material lives outside the connection, in the
//! server entry's [`NontransientState`], and survives every transition.

use crate::protocol::{ConnectionMode, ConnectionType};
use crate::sched::JobHandle;
use crate::transport::{
    NontransientState, Resumption, ServerSocket, ServerUri, SocketFactory, SocketId,
    TransportError,
};

/// Socket ownership state of a connection
#[derive(Default)]
pub(crate) enum SocketState {
    /// Never connected, or cleaned up
    #[default]
    NoSocket,
    /// Socket exists but is closed
    Suspended(Box<dyn ServerSocket>),
    /// Socket is connected and usable
    Online(Box<dyn ServerSocket>),
}

impl std::fmt::Debug for SocketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSocket => write!(f, "NoSocket"),
            Self::Suspended(socket) => write!(f, "Suspended({})", socket.id()),
            Self::Online(socket) => write!(f, "Online({})", socket.id()),
        }
    }
}

/// Local bind preferences
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BindConfig {
    /// Port to always bind to; failing to bind it is an error
    pub static_port: Option<u16>,
}

/// One transport of one active server
#[derive(Debug)]
pub(crate) struct ServerConnection {
    conn_type: ConnectionType,
    pub(crate) mode: ConnectionMode,
    socket: SocketState,
    pub(crate) queue_close: Option<JobHandle>,
}

impl ServerConnection {
    pub(crate) fn new(conn_type: ConnectionType) -> Self {
        Self {
            conn_type,
            mode: ConnectionMode::Disabled,
            socket: SocketState::NoSocket,
            queue_close: None,
        }
    }

    pub(crate) fn conn_type(&self) -> ConnectionType {
        self.conn_type
    }

    pub(crate) fn socket_state(&self) -> &SocketState {
        &self.socket
    }

    pub(crate) fn is_online(&self) -> bool {
        matches!(&self.socket, SocketState::Online(socket) if socket.is_connected())
    }

    pub(crate) fn has_socket(&self) -> bool {
        !matches!(self.socket, SocketState::NoSocket)
    }

    pub(crate) fn online_socket_mut(&mut self) -> Option<&mut Box<dyn ServerSocket>> {
        match &mut self.socket {
            SocketState::Online(socket) if socket.is_connected() => Some(socket),
            _ => None,
        }
    }

    pub(crate) fn online_socket_id(&self) -> Option<SocketId> {
        match &self.socket {
            SocketState::Online(socket) if socket.is_connected() => Some(socket.id()),
            _ => None,
        }
    }

    /// Create (if needed), bind and connect the socket.
    ///
    /// Bind policy: a static port preference is mandatory when set;
    /// otherwise the last bound port is tried first, falling back to an
    /// ephemeral port. The bound port is recorded in `state` for the next
    /// attempt.
    pub(crate) async fn bring_online(
        &mut self,
        factory: &dyn SocketFactory,
        remote: &ServerUri,
        state: &mut NontransientState,
        bind: BindConfig,
    ) -> Result<Resumption, TransportError> {
        let mut socket = match std::mem::take(&mut self.socket) {
            SocketState::NoSocket => factory.create(self.conn_type, remote)?,
            SocketState::Suspended(socket) | SocketState::Online(socket) => socket,
        };
        socket.close();

        match Self::bind_and_connect(socket.as_mut(), remote, state, bind).await {
            Ok(resumption) => {
                match socket.local_port() {
                    Ok(port) => state.last_local_port = Some(port),
                    Err(e) => {
                        tracing::warn!("could not read local port of {} socket: {}", self.conn_type, e);
                        state.last_local_port = None;
                    },
                }
                tracing::debug!(
                    "{} socket {} connected to {} ({:?})",
                    self.conn_type,
                    socket.id(),
                    remote,
                    resumption
                );
                self.socket = SocketState::Online(socket);
                Ok(resumption)
            },
            Err(e) => {
                socket.close();
                self.socket = SocketState::Suspended(socket);
                Err(e)
            },
        }
    }

    async fn bind_and_connect(
        socket: &mut dyn ServerSocket,
        remote: &ServerUri,
        state: &mut NontransientState,
        bind: BindConfig,
    ) -> Result<Resumption, TransportError> {
        if let Some(port) = bind.static_port {
            socket.bind(Some(port)).await?;
        } else if let Some(port) = state.last_local_port {
            if let Err(e) = socket.bind(Some(port)).await {
                tracing::warn!("could not reuse local port {}: {}; using ephemeral port", port, e);
                socket.bind(None).await?;
            }
        } else {
            socket.bind(None).await?;
        }
        socket.connect(remote, state).await
    }

    /// Close the socket but keep it for reconnecting
    pub(crate) fn suspend(&mut self) {
        self.socket = match std::mem::take(&mut self.socket) {
            SocketState::NoSocket => SocketState::NoSocket,
            SocketState::Suspended(mut socket) | SocketState::Online(mut socket) => {
                socket.close();
                SocketState::Suspended(socket)
            },
        };
    }

    /// Close and drop the socket
    pub(crate) fn cleanup(&mut self) {
        if let SocketState::Suspended(mut socket) | SocketState::Online(mut socket) =
            std::mem::take(&mut self.socket)
        {
            socket.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockNetwork;

    fn uri() -> ServerUri {
        ServerUri::parse("coap://server.example.com").unwrap()
    }

    #[tokio::test]
    async fn test_bring_online_records_port() {
        let network = MockNetwork::new();
        let factory = network.socket_factory();
        let mut conn = ServerConnection::new(ConnectionType::Udp);
        let mut state = NontransientState::default();

        conn.bring_online(factory.as_ref(), &uri(), &mut state, BindConfig::default())
            .await
            .unwrap();
        assert!(conn.is_online());
        assert_eq!(state.last_local_port, Some(50000));
        assert!(state.preferred_endpoint.is_some());
    }

    #[tokio::test]
    async fn test_suspend_and_reconnect_reuses_socket_and_port() {
        let network = MockNetwork::new();
        let factory = network.socket_factory();
        let mut conn = ServerConnection::new(ConnectionType::Udp);
        let mut state = NontransientState::default();

        conn.bring_online(factory.as_ref(), &uri(), &mut state, BindConfig::default())
            .await
            .unwrap();
        let id = conn.online_socket_id().unwrap();

        conn.suspend();
        assert!(!conn.is_online());
        assert!(conn.has_socket());
        assert!(conn.online_socket_id().is_none());

        conn.bring_online(factory.as_ref(), &uri(), &mut state, BindConfig::default())
            .await
            .unwrap();
        assert_eq!(conn.online_socket_id(), Some(id));
        assert_eq!(network.sockets_created(), 1);
        assert_eq!(network.bound_ports(), vec![50000, 50000]);
    }

    #[tokio::test]
    async fn test_busy_last_port_falls_back_to_ephemeral() {
        let network = MockNetwork::new();
        network.set_port_busy(40000, true);
        let factory = network.socket_factory();
        let mut conn = ServerConnection::new(ConnectionType::Udp);
        let mut state = NontransientState {
            last_local_port: Some(40000),
            ..NontransientState::default()
        };

        conn.bring_online(factory.as_ref(), &uri(), &mut state, BindConfig::default())
            .await
            .unwrap();
        assert_eq!(state.last_local_port, Some(50000));
    }

    #[tokio::test]
    async fn test_busy_static_port_is_an_error() {
        let network = MockNetwork::new();
        network.set_port_busy(40000, true);
        let factory = network.socket_factory();
        let mut conn = ServerConnection::new(ConnectionType::Udp);
        let mut state = NontransientState::default();
        let bind = BindConfig {
            static_port: Some(40000),
        };

        let err = conn
            .bring_online(factory.as_ref(), &uri(), &mut state, bind)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Bind { port: Some(40000), .. }));
        assert!(!conn.is_online());
        assert!(network.bound_ports().is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_suspends() {
        let network = MockNetwork::new();
        network.fail_next_connects(1);
        let factory = network.socket_factory();
        let mut conn = ServerConnection::new(ConnectionType::Udp);
        let mut state = NontransientState::default();

        assert!(conn
            .bring_online(factory.as_ref(), &uri(), &mut state, BindConfig::default())
            .await
            .is_err());
        assert!(matches!(conn.socket_state(), SocketState::Suspended(_)));

        conn.cleanup();
        assert!(!conn.has_socket());
        // nontransient state is untouched by cleanup
        assert!(state.preferred_endpoint.is_none());
    }
}
