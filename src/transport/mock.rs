//! In-memory transport for tests and simulations.
//!
//! [`MockNetwork`] hands out a [`SocketFactory`] and a
//! [`RegistrationExchange`] that share one scriptable state: connects can
//! be made to fail, local ports can be marked busy, exchange responses can
//! be queued, and every request is recorded for later inspection.
//!
//! ```rust,ignore
//! use lwm2m::transport::mock::MockNetwork;
//! use lwm2m::transport::ExchangeError;
//!
//! let network = MockNetwork::new();
//! network.push_update_response(Err(ExchangeError::Rejected));
//! let manager = ServerManager::new(config, dm, network.socket_factory(), network.exchange());
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures::future::{self, BoxFuture};

use super::{
    ExchangeError, NontransientState, RegistrationExchange, Resumption, ServerSocket,
    ServerUri, SocketFactory, SocketId, TransportError,
};
use crate::protocol::{ConnectionType, EndpointPath, RegisterRequest, UpdateRequest};

/// First port handed out for ephemeral binds
const EPHEMERAL_PORT_BASE: u16 = 50000;

/// Address every mock host resolves to (TEST-NET-1)
const MOCK_HOST_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));

/// A request observed by the mock exchange
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedRequest {
    /// Register
    Register {
        /// Socket the request went through
        socket: SocketId,
        /// Remote host of that socket
        host: String,
        /// Request parameters
        request: RegisterRequest,
    },
    /// Update
    Update {
        /// Socket the request went through
        socket: SocketId,
        /// Remote host of that socket
        host: String,
        /// Registration addressed
        endpoint: EndpointPath,
        /// Request parameters
        request: UpdateRequest,
    },
    /// De-register
    Deregister {
        /// Socket the request went through
        socket: SocketId,
        /// Remote host of that socket
        host: String,
        /// Registration addressed
        endpoint: EndpointPath,
    },
}

impl RecordedRequest {
    /// Remote host the request was sent to
    pub fn host(&self) -> &str {
        match self {
            Self::Register { host, .. } | Self::Update { host, .. } | Self::Deregister { host, .. } => {
                host
            },
        }
    }
}

#[derive(Debug)]
struct NetworkState {
    next_socket_id: u64,
    next_ephemeral_port: u16,
    failing_connects: usize,
    unreachable: HashSet<String>,
    busy_ports: HashSet<u16>,
    new_sessions: bool,
    register_responses: VecDeque<Result<EndpointPath, ExchangeError>>,
    update_responses: VecDeque<Result<(), ExchangeError>>,
    deregister_responses: VecDeque<Result<(), ExchangeError>>,
    registrations: u64,
    requests: Vec<RecordedRequest>,
    hosts: HashMap<SocketId, String>,
    sockets_created: usize,
    connects: usize,
    closes: usize,
    bound_ports: Vec<u16>,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            next_socket_id: 1,
            next_ephemeral_port: EPHEMERAL_PORT_BASE,
            failing_connects: 0,
            unreachable: HashSet::new(),
            busy_ports: HashSet::new(),
            new_sessions: false,
            register_responses: VecDeque::new(),
            update_responses: VecDeque::new(),
            deregister_responses: VecDeque::new(),
            registrations: 0,
            requests: Vec::new(),
            hosts: HashMap::new(),
            sockets_created: 0,
            connects: 0,
            closes: 0,
            bound_ports: Vec::new(),
        }
    }
}

/// Shared, scriptable network state
#[derive(Debug, Clone, Default)]
pub struct MockNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MockNetwork {
    /// Create a network where everything succeeds
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Socket factory bound to this network
    pub fn socket_factory(&self) -> Arc<MockSocketFactory> {
        Arc::new(MockSocketFactory {
            network: self.clone(),
        })
    }

    /// Registration exchange bound to this network
    pub fn exchange(&self) -> Arc<MockExchange> {
        Arc::new(MockExchange {
            network: self.clone(),
        })
    }

    /// Make the next `count` connect attempts fail
    pub fn fail_next_connects(&self, count: usize) {
        self.lock().failing_connects = count;
    }

    /// Make every connect to `host` fail until reset
    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut state = self.lock();
        if unreachable {
            state.unreachable.insert(host.to_string());
        } else {
            state.unreachable.remove(host);
        }
    }

    /// Make binds to `port` fail until reset
    pub fn set_port_busy(&self, port: u16, busy: bool) {
        let mut state = self.lock();
        if busy {
            state.busy_ports.insert(port);
        } else {
            state.busy_ports.remove(&port);
        }
    }

    /// Report every secure connect as a brand new session
    pub fn report_new_sessions(&self, enabled: bool) {
        self.lock().new_sessions = enabled;
    }

    /// Queue the outcome of the next Register
    pub fn push_register_response(&self, response: Result<EndpointPath, ExchangeError>) {
        self.lock().register_responses.push_back(response);
    }

    /// Queue the outcome of the next Update
    pub fn push_update_response(&self, response: Result<(), ExchangeError>) {
        self.lock().update_responses.push_back(response);
    }

    /// Queue the outcome of the next De-register
    pub fn push_deregister_response(&self, response: Result<(), ExchangeError>) {
        self.lock().deregister_responses.push_back(response);
    }

    /// Every request seen so far, in order
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    /// Forget recorded requests
    pub fn clear_requests(&self) {
        self.lock().requests.clear();
    }

    /// Number of Register requests seen
    pub fn register_count(&self) -> usize {
        self.count(|r| matches!(r, RecordedRequest::Register { .. }))
    }

    /// Number of Update requests seen
    pub fn update_count(&self) -> usize {
        self.count(|r| matches!(r, RecordedRequest::Update { .. }))
    }

    /// Number of De-register requests seen
    pub fn deregister_count(&self) -> usize {
        self.count(|r| matches!(r, RecordedRequest::Deregister { .. }))
    }

    fn count(&self, predicate: impl Fn(&RecordedRequest) -> bool) -> usize {
        self.lock().requests.iter().filter(|r| predicate(r)).count()
    }

    /// Number of sockets created
    pub fn sockets_created(&self) -> usize {
        self.lock().sockets_created
    }

    /// Number of successful connects
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    /// Number of socket closes
    pub fn closes(&self) -> usize {
        self.lock().closes
    }

    /// Local ports bound so far, in order
    pub fn bound_ports(&self) -> Vec<u16> {
        self.lock().bound_ports.clone()
    }

    /// Remote host of a socket created by this network
    pub fn host_of(&self, socket: SocketId) -> Option<String> {
        self.lock().hosts.get(&socket).cloned()
    }
}

/// [`SocketFactory`] creating [`MockSocket`]s
#[derive(Debug)]
pub struct MockSocketFactory {
    network: MockNetwork,
}

impl SocketFactory for MockSocketFactory {
    fn create(
        &self,
        _conn_type: ConnectionType,
        remote: &ServerUri,
    ) -> Result<Box<dyn ServerSocket>, TransportError> {
        let mut state = self.network.lock();
        let id = SocketId::new(state.next_socket_id);
        state.next_socket_id += 1;
        state.sockets_created += 1;
        state.hosts.insert(id, remote.host.clone());
        drop(state);

        Ok(Box::new(MockSocket {
            id,
            network: self.network.clone(),
            local_port: None,
            connected: false,
        }))
    }
}

/// Socket living in a [`MockNetwork`]
#[derive(Debug)]
pub struct MockSocket {
    id: SocketId,
    network: MockNetwork,
    local_port: Option<u16>,
    connected: bool,
}

impl MockSocket {
    fn bind_now(&mut self, port: Option<u16>) -> Result<(), TransportError> {
        let mut state = self.network.lock();
        let port = match port {
            Some(port) if state.busy_ports.contains(&port) => {
                return Err(TransportError::Bind {
                    port: Some(port),
                    reason: "address in use".to_string(),
                });
            },
            Some(port) => port,
            None => {
                let port = state.next_ephemeral_port;
                state.next_ephemeral_port = state.next_ephemeral_port.wrapping_add(1).max(EPHEMERAL_PORT_BASE);
                port
            },
        };
        state.bound_ports.push(port);
        self.local_port = Some(port);
        Ok(())
    }

    fn connect_now(
        &mut self,
        remote: &ServerUri,
        nontransient: &mut NontransientState,
    ) -> Result<Resumption, TransportError> {
        if self.local_port.is_none() {
            self.bind_now(None)?;
        }

        let mut state = self.network.lock();
        state.hosts.insert(self.id, remote.host.clone());
        let refused = |reason: &str| TransportError::Connect {
            host: remote.host.clone(),
            port: remote.port,
            reason: reason.to_string(),
        };
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(refused("scripted failure"));
        }
        if state.unreachable.contains(&remote.host) {
            return Err(refused("host unreachable"));
        }
        state.connects += 1;
        self.connected = true;
        nontransient.preferred_endpoint = Some(SocketAddr::new(MOCK_HOST_ADDR, remote.port));

        if !remote.scheme.is_secure() {
            return Ok(Resumption::NotSecure);
        }
        if state.new_sessions || nontransient.session_cache.is_none() {
            nontransient.session_cache = Some(Bytes::from(format!("session-{}", self.id.get())));
            Ok(Resumption::NewSession)
        } else {
            Ok(Resumption::Resumed)
        }
    }
}

impl ServerSocket for MockSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn bind(&mut self, local_port: Option<u16>) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(future::ready(self.bind_now(local_port)))
    }

    fn connect<'a>(
        &'a mut self,
        remote: &'a ServerUri,
        state: &'a mut NontransientState,
    ) -> BoxFuture<'a, Result<Resumption, TransportError>> {
        Box::pin(future::ready(self.connect_now(remote, state)))
    }

    fn local_port(&self) -> Result<u16, TransportError> {
        self.local_port.ok_or(TransportError::NotConnected)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close(&mut self) {
        if self.local_port.is_some() || self.connected {
            self.network.lock().closes += 1;
        }
        self.local_port = None;
        self.connected = false;
    }
}

/// [`RegistrationExchange`] answering from the scripted queues
#[derive(Debug)]
pub struct MockExchange {
    network: MockNetwork,
}

impl MockExchange {
    fn host(state: &NetworkState, socket: SocketId) -> String {
        state.hosts.get(&socket).cloned().unwrap_or_default()
    }
}

fn not_connected() -> ExchangeError {
    ExchangeError::Network("socket not connected".to_string())
}

impl RegistrationExchange for MockExchange {
    fn register<'a>(
        &'a self,
        socket: &'a mut dyn ServerSocket,
        request: &'a RegisterRequest,
    ) -> BoxFuture<'a, Result<EndpointPath, ExchangeError>> {
        if !socket.is_connected() {
            return Box::pin(future::ready(Err(not_connected())));
        }
        let mut state = self.network.lock();
        let host = Self::host(&state, socket.id());
        state.requests.push(RecordedRequest::Register {
            socket: socket.id(),
            host,
            request: request.clone(),
        });
        state.registrations += 1;
        let counter = state.registrations;
        let response = state
            .register_responses
            .pop_front()
            .unwrap_or_else(|| Ok(EndpointPath::new(["rd".to_string(), counter.to_string()])));
        Box::pin(future::ready(response))
    }

    fn update<'a>(
        &'a self,
        socket: &'a mut dyn ServerSocket,
        endpoint: &'a EndpointPath,
        request: &'a UpdateRequest,
    ) -> BoxFuture<'a, Result<(), ExchangeError>> {
        if !socket.is_connected() {
            return Box::pin(future::ready(Err(not_connected())));
        }
        let mut state = self.network.lock();
        let host = Self::host(&state, socket.id());
        state.requests.push(RecordedRequest::Update {
            socket: socket.id(),
            host,
            endpoint: endpoint.clone(),
            request: request.clone(),
        });
        let response = state.update_responses.pop_front().unwrap_or(Ok(()));
        Box::pin(future::ready(response))
    }

    fn deregister<'a>(
        &'a self,
        socket: &'a mut dyn ServerSocket,
        endpoint: &'a EndpointPath,
    ) -> BoxFuture<'a, Result<(), ExchangeError>> {
        if !socket.is_connected() {
            return Box::pin(future::ready(Err(not_connected())));
        }
        let mut state = self.network.lock();
        let host = Self::host(&state, socket.id());
        state.requests.push(RecordedRequest::Deregister {
            socket: socket.id(),
            host,
            endpoint: endpoint.clone(),
        });
        let response = state.deregister_responses.pop_front().unwrap_or(Ok(()));
        Box::pin(future::ready(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BindingMode, UpdateParameters};
    use crate::dm::DmSnapshot;

    fn uri(raw: &str) -> ServerUri {
        ServerUri::parse(raw).unwrap()
    }

    fn register_request() -> RegisterRequest {
        let params = UpdateParameters {
            lifetime_s: 60,
            binding_mode: BindingMode::U,
            dm: DmSnapshot::default(),
        };
        RegisterRequest::new("ep", "1.0", None, &params)
    }

    #[tokio::test]
    async fn test_busy_port_and_ephemeral_bind() {
        let network = MockNetwork::new();
        network.set_port_busy(6000, true);
        let factory = network.socket_factory();
        let mut socket = factory
            .create(ConnectionType::Udp, &uri("coap://server"))
            .unwrap();

        assert!(socket.bind(Some(6000)).await.is_err());
        socket.bind(None).await.unwrap();
        assert_eq!(socket.local_port().unwrap(), EPHEMERAL_PORT_BASE);
        assert_eq!(network.bound_ports(), vec![EPHEMERAL_PORT_BASE]);
    }

    #[tokio::test]
    async fn test_scripted_connect_failures() {
        let network = MockNetwork::new();
        network.fail_next_connects(1);
        let factory = network.socket_factory();
        let remote = uri("coap://server");
        let mut socket = factory.create(ConnectionType::Udp, &remote).unwrap();
        let mut state = NontransientState::default();

        assert!(socket.connect(&remote, &mut state).await.is_err());
        assert!(!socket.is_connected());
        assert_eq!(
            socket.connect(&remote, &mut state).await.unwrap(),
            Resumption::NotSecure
        );
        assert_eq!(network.connects(), 1);
        assert!(state.preferred_endpoint.is_some());
    }

    #[tokio::test]
    async fn test_secure_session_resumption() {
        let network = MockNetwork::new();
        let factory = network.socket_factory();
        let remote = uri("coaps://server");
        let mut socket = factory.create(ConnectionType::Udp, &remote).unwrap();
        let mut state = NontransientState::default();

        assert_eq!(socket.connect(&remote, &mut state).await.unwrap(), Resumption::NewSession);
        socket.close();
        assert_eq!(socket.connect(&remote, &mut state).await.unwrap(), Resumption::Resumed);

        network.report_new_sessions(true);
        socket.close();
        assert_eq!(socket.connect(&remote, &mut state).await.unwrap(), Resumption::NewSession);
    }

    #[tokio::test]
    async fn test_exchange_records_and_scripts() {
        let network = MockNetwork::new();
        let factory = network.socket_factory();
        let exchange = network.exchange();
        let remote = uri("coap://server");
        let mut socket = factory.create(ConnectionType::Udp, &remote).unwrap();
        let request = register_request();

        // not connected yet
        let err = exchange.register(socket.as_mut(), &request).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Network(_)));
        assert_eq!(network.register_count(), 0);

        let mut state = NontransientState::default();
        socket.connect(&remote, &mut state).await.unwrap();
        let path = exchange.register(socket.as_mut(), &request).await.unwrap();
        assert_eq!(path.to_string(), "/rd/1");

        network.push_update_response(Err(ExchangeError::Rejected));
        let err = exchange
            .update(socket.as_mut(), &path, &UpdateRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err, ExchangeError::Rejected);

        exchange.deregister(socket.as_mut(), &path).await.unwrap();
        let requests = network.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.host() == "server"));
        assert_eq!(network.deregister_count(), 1);
    }
}
