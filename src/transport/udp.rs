//! UDP transport implementation backed by tokio.
//!
//! Plain CoAP only: `coaps` URIs and SMS sockets are reported as
//! unsupported so that the caller treats them as fatal rather than
//! retrying forever.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;

use super::{
    NontransientState, Resumption, ServerSocket, ServerUri, SocketFactory, SocketId,
    TransportError, UriScheme,
};
use crate::protocol::ConnectionType;

/// Address family used for local binding and DNS result filtering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// IPv4 (default)
    #[default]
    Ipv4,
    /// IPv6
    Ipv6,
}

impl AddressFamily {
    fn unspecified(self) -> IpAddr {
        match self {
            Self::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Self::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Self::Ipv4 => addr.is_ipv4(),
            Self::Ipv6 => addr.is_ipv6(),
        }
    }
}

/// Creates tokio UDP sockets
#[derive(Debug, Default)]
pub struct UdpSocketFactory {
    family: AddressFamily,
    next_id: AtomicU64,
}

impl UdpSocketFactory {
    /// Create a factory binding sockets in `family`
    pub fn new(family: AddressFamily) -> Self {
        Self {
            family,
            next_id: AtomicU64::new(1),
        }
    }
}

impl SocketFactory for UdpSocketFactory {
    fn create(
        &self,
        conn_type: ConnectionType,
        remote: &ServerUri,
    ) -> Result<Box<dyn ServerSocket>, TransportError> {
        if conn_type != ConnectionType::Udp {
            return Err(TransportError::Unsupported(format!("{conn_type} sockets")));
        }
        match remote.scheme {
            UriScheme::Coap => {},
            UriScheme::Coaps => {
                return Err(TransportError::Unsupported("CoAP over DTLS".to_string()));
            },
            UriScheme::Sms => {
                return Err(TransportError::InvalidUri(format!("{remote} is not a UDP URI")));
            },
        }

        let id = SocketId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        Ok(Box::new(UdpServerSocket::new(id, self.family)))
    }
}

/// UDP socket towards one server
#[derive(Debug)]
pub struct UdpServerSocket {
    id: SocketId,
    family: AddressFamily,
    socket: Option<UdpSocket>,
    connected: bool,
}

impl UdpServerSocket {
    /// Create an unbound socket
    pub fn new(id: SocketId, family: AddressFamily) -> Self {
        Self {
            id,
            family,
            socket: None,
            connected: false,
        }
    }

    /// Underlying tokio socket, for exchanging datagrams
    pub fn socket(&self) -> Option<&UdpSocket> {
        self.socket.as_ref().filter(|_| self.connected)
    }

    async fn bind_inner(&mut self, local_port: Option<u16>) -> Result<(), TransportError> {
        let addr = SocketAddr::new(self.family.unspecified(), local_port.unwrap_or(0));
        let socket = UdpSocket::bind(addr).await.map_err(|e| TransportError::Bind {
            port: local_port,
            reason: e.to_string(),
        })?;
        self.socket = Some(socket);
        self.connected = false;
        Ok(())
    }

    async fn connect_inner(
        &mut self,
        remote: &ServerUri,
        state: &mut NontransientState,
    ) -> Result<Resumption, TransportError> {
        if self.socket.is_none() {
            self.bind_inner(None).await?;
        }

        let candidates: Vec<SocketAddr> = tokio::net::lookup_host((remote.host.as_str(), remote.port))
            .await
            .map_err(|e| TransportError::Resolve(format!("{}: {}", remote.host, e)))?
            .filter(|addr| self.family.accepts(addr))
            .collect();

        let target = state
            .preferred_endpoint
            .filter(|preferred| candidates.contains(preferred))
            .or_else(|| candidates.first().copied())
            .ok_or_else(|| {
                TransportError::Resolve(format!("{}: no {:?} address", remote.host, self.family))
            })?;

        let socket = self.socket.as_ref().ok_or(TransportError::NotConnected)?;
        socket.connect(target).await.map_err(|e| TransportError::Connect {
            host: remote.host.clone(),
            port: remote.port,
            reason: e.to_string(),
        })?;

        self.connected = true;
        state.preferred_endpoint = Some(target);
        Ok(Resumption::NotSecure)
    }
}

impl ServerSocket for UdpServerSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn bind(&mut self, local_port: Option<u16>) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(self.bind_inner(local_port))
    }

    fn connect<'a>(
        &'a mut self,
        remote: &'a ServerUri,
        state: &'a mut NontransientState,
    ) -> BoxFuture<'a, Result<Resumption, TransportError>> {
        Box::pin(self.connect_inner(remote, state))
    }

    fn local_port(&self) -> Result<u16, TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotConnected)?;
        Ok(socket.local_addr()?.port())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close(&mut self) {
        self.socket = None;
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(raw: &str) -> ServerUri {
        ServerUri::parse(raw).unwrap()
    }

    #[test]
    fn test_factory_rejects_unsupported() {
        let factory = UdpSocketFactory::new(AddressFamily::Ipv4);
        let err = factory
            .create(ConnectionType::Udp, &uri("coaps://example.com"))
            .err()
            .unwrap();
        assert!(err.is_fatal());
        let err = factory
            .create(ConnectionType::Sms, &uri("sms://+48123"))
            .err()
            .unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_factory_assigns_unique_ids() {
        let factory = UdpSocketFactory::new(AddressFamily::Ipv4);
        let a = factory.create(ConnectionType::Udp, &uri("coap://127.0.0.1")).unwrap();
        let b = factory.create(ConnectionType::Udp, &uri("coap://127.0.0.1")).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_udp_connect_records_endpoint_and_port() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_port = server.local_addr().unwrap().port();

        let factory = UdpSocketFactory::new(AddressFamily::Ipv4);
        let remote = uri(&format!("coap://127.0.0.1:{server_port}"));
        let mut socket = factory.create(ConnectionType::Udp, &remote).unwrap();
        let mut state = NontransientState::default();

        socket.bind(None).await.unwrap();
        let resumption = socket.connect(&remote, &mut state).await.unwrap();
        assert_eq!(resumption, Resumption::NotSecure);
        assert!(socket.is_connected());
        assert_eq!(state.preferred_endpoint.unwrap().port(), server_port);
        assert_ne!(socket.local_port().unwrap(), 0);

        socket.close();
        assert!(!socket.is_connected());
        assert!(socket.local_port().is_err());
    }
}
