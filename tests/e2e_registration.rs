//! End-to-end registration lifecycle tests.
//!
//! These drive a `ServerManager` against the in-memory transport with
//! paused tokio time, covering multi-server activation, Update timing,
//! failure recovery and reconnects beyond the unit test level.

use std::sync::Arc;
use std::time::Duration;

use lwm2m::config::ClientConfig;
use lwm2m::dm::{InMemoryDataModel, SecurityInstance, ServerInstance, ServerObject};
use lwm2m::protocol::{BindingMode, ConnectionType, Ssid, Target};
use lwm2m::servers::ServerManager;
use lwm2m::transport::mock::{MockNetwork, RecordedRequest};
use lwm2m::transport::ExchangeError;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn ssid(raw: u16) -> Ssid {
    Ssid::new(raw).unwrap()
}

fn single_server(uri: &str) -> Arc<InMemoryDataModel> {
    let servers = ServerObject::new(vec![ServerInstance::new(1, 60, "U")]).unwrap();
    Arc::new(InMemoryDataModel::new(servers, vec![SecurityInstance::server(1, uri)]).unwrap())
}

fn fleet() -> Arc<InMemoryDataModel> {
    let servers = ServerObject::new(vec![
        ServerInstance::new(1, 60, "U"),
        ServerInstance::new(2, 300, "UQ"),
    ])
    .unwrap();
    Arc::new(
        InMemoryDataModel::new(
            servers,
            vec![
                SecurityInstance::server(1, "coap://one.example.com"),
                SecurityInstance::server(2, "coap://two.example.com"),
                SecurityInstance::bootstrap("coap://bootstrap.example.com"),
            ],
        )
        .unwrap(),
    )
}

async fn start(network: &MockNetwork, dm: Arc<InMemoryDataModel>) -> ServerManager {
    init_tracing();
    let mut manager = ServerManager::new(
        ClientConfig::default(),
        dm,
        network.socket_factory(),
        network.exchange(),
    )
    .unwrap();
    manager.start();
    manager.run_pending().await;
    manager
}

/// Step paused time one second at a time, running due jobs after each step
async fn step(manager: &mut ServerManager, seconds: u64) {
    for _ in 0..seconds {
        tokio::time::advance(Duration::from_secs(1)).await;
        manager.run_pending().await;
    }
}

/// Test every configured server is activated and regular servers register
#[tokio::test(start_paused = true)]
async fn test_fleet_activation() {
    let network = MockNetwork::new();
    let manager = start(&network, fleet()).await;

    assert!(manager.is_active(ssid(1)));
    assert!(manager.is_active(ssid(2)));
    assert!(manager.is_active(Ssid::BOOTSTRAP));

    // Bootstrap Server is connected but never registered with
    assert_eq!(network.register_count(), 2);
    assert!(network
        .requests()
        .iter()
        .all(|request| request.host() != "bootstrap.example.com"));

    assert_eq!(manager.actual_binding_mode(ssid(2)).unwrap(), BindingMode::UQ);
    assert_eq!(manager.online_sockets().len(), 3);
}

/// Test sockets map back to their owning server
#[tokio::test(start_paused = true)]
async fn test_find_by_socket() {
    let network = MockNetwork::new();
    let manager = start(&network, fleet()).await;

    for online in manager.online_sockets() {
        assert_eq!(manager.find_by_socket(online.conn_type, online.socket), Some(online.ssid));
        assert_eq!(manager.find_by_socket(ConnectionType::Sms, online.socket), None);
    }
}

/// Test the status report serializes to JSON
#[tokio::test(start_paused = true)]
async fn test_status_json() {
    let network = MockNetwork::new();
    let manager = start(&network, single_server("coap://server.example.com")).await;

    let status = serde_json::to_value(manager.status()).unwrap();
    let server = &status[0];
    assert_eq!(server["ssid"], 1);
    assert_eq!(server["active"], true);
    assert_eq!(server["binding_mode"], "U");
    assert_eq!(server["endpoint_path"], "/rd/1");
    assert_eq!(server["expires_in_s"], 60);
    assert_eq!(server["connections"][0]["conn_type"], "udp");
    assert_eq!(server["connections"][0]["socket"], "online");
    assert_eq!(server["connections"][1]["mode"], "disabled");
}

/// Test a lifetime change is sent as an Update carrying only `lt`
#[tokio::test(start_paused = true)]
async fn test_lifetime_change_sends_minimal_update() {
    let network = MockNetwork::new();
    let dm = single_server("coap://server.example.com");
    let mut manager = start(&network, dm.clone()).await;
    network.clear_requests();

    dm.update_servers(|servers| {
        if let Some(instance) = servers.get_mut(ssid(1)) {
            instance.lifetime = Some(300);
        }
    })
    .unwrap();
    manager.schedule_registration_update(Target::Server(ssid(1))).unwrap();
    manager.run_pending().await;

    match network.requests().as_slice() {
        [RecordedRequest::Update { request, .. }] => {
            assert_eq!(request.query_args(), vec!["lt=300".to_string()]);
        },
        other => panic!("unexpected requests: {other:?}"),
    }
    assert_eq!(manager.status()[0].expires_in_s, Some(300));
}

/// Test a rejected Update leads to a fresh Register without De-register
#[tokio::test(start_paused = true)]
async fn test_rejected_update_reregisters() {
    let network = MockNetwork::new();
    let mut manager = start(&network, single_server("coap://server.example.com")).await;

    network.push_update_response(Err(ExchangeError::Rejected));
    manager.schedule_registration_update(Target::All).unwrap();
    manager.run_pending().await;

    assert_eq!(network.update_count(), 1);
    assert_eq!(network.deregister_count(), 0);
    assert_eq!(network.register_count(), 2);
    assert!(!manager.registration_expired(ssid(1)));
    assert_eq!(manager.status()[0].endpoint_path.as_deref(), Some("/rd/2"));
}

/// Test transient failures retry until the lifetime runs out, then the
/// server re-registers once it is reachable again
#[tokio::test(start_paused = true)]
async fn test_unreachable_server_expires_and_recovers() {
    let network = MockNetwork::new();
    let mut manager = start(&network, single_server("coap://server.example.com")).await;

    // lifetime 60 s, margin min(30 s, 93 s): first Update at 30 s
    network.push_update_response(Err(ExchangeError::Network("timeout".to_string())));
    network.set_unreachable("server.example.com", true);
    step(&mut manager, 30).await;
    assert_eq!(network.update_count(), 1);
    assert!(!manager.registration_expired(ssid(1)));

    // retries at 31, 33, 37, 45 and 61 s; the last one finds the lifetime gone
    step(&mut manager, 30).await;
    assert!(manager.is_active(ssid(1)));
    step(&mut manager, 1).await;
    assert!(manager.registration_expired(ssid(1)));
    assert!(!manager.is_active(ssid(1)));
    assert_eq!(network.register_count(), 1);

    network.set_unreachable("server.example.com", false);
    step(&mut manager, 1).await;
    assert!(manager.is_active(ssid(1)));
    assert!(!manager.registration_expired(ssid(1)));
    assert_eq!(network.register_count(), 2);
}

/// Test a reconnect reuses the local port and keeps the registration
#[tokio::test(start_paused = true)]
async fn test_reconnect_reuses_local_port() {
    let network = MockNetwork::new();
    let mut manager = start(&network, single_server("coap://server.example.com")).await;
    let port = network.bound_ports()[0];

    manager.schedule_reconnect(Target::All).unwrap();
    manager.run_pending().await;

    assert_eq!(network.bound_ports(), vec![port, port]);
    assert_eq!(network.connects(), 2);
    assert_eq!(network.register_count(), 1);
    assert!(!manager.registration_expired(ssid(1)));
}

/// Test a lost DTLS session forces a fresh Register after reconnecting
#[tokio::test(start_paused = true)]
async fn test_new_secure_session_reregisters() {
    let network = MockNetwork::new();
    let mut manager = start(&network, single_server("coaps://server.example.com")).await;
    assert_eq!(network.register_count(), 1);

    // session resumed: nothing to do
    manager.schedule_reconnect(Target::All).unwrap();
    manager.run_pending().await;
    assert_eq!(network.register_count(), 1);

    network.report_new_sessions(true);
    manager.schedule_reconnect(Target::All).unwrap();
    manager.run_pending().await;
    assert_eq!(network.register_count(), 2);
}

/// Test removing a server from the data model tears it down silently
#[tokio::test(start_paused = true)]
async fn test_removed_server_is_dropped() {
    let network = MockNetwork::new();
    let dm = fleet();
    let mut manager = start(&network, dm.clone()).await;

    dm.remove_security(ssid(2));
    manager.schedule_reconnect(Target::All).unwrap();
    manager.run_pending().await;

    assert!(!manager.is_active(ssid(2)));
    assert!(manager.status().iter().all(|status| status.ssid != ssid(2)));
    assert_eq!(network.deregister_count(), 0);
    assert!(manager.is_active(ssid(1)));
}

/// Test disabling without timeout keeps the server down until enabled
#[tokio::test(start_paused = true)]
async fn test_disable_until_enabled() {
    let network = MockNetwork::new();
    let mut manager = start(&network, single_server("coap://server.example.com")).await;

    manager.disable_server_with_timeout(ssid(1), None).unwrap();
    manager.run_pending().await;
    assert_eq!(network.deregister_count(), 1);
    assert!(!manager.is_active(ssid(1)));

    step(&mut manager, 3600).await;
    assert!(!manager.is_active(ssid(1)));
    assert!(manager.status()[0].disabled);

    manager.enable_server(ssid(1)).unwrap();
    manager.run_pending().await;
    assert!(manager.is_active(ssid(1)));
    assert_eq!(network.register_count(), 2);
}

/// Test Updates keep the registration alive over several lifetimes
#[tokio::test(start_paused = true)]
async fn test_periodic_updates() {
    let network = MockNetwork::new();
    let mut manager = start(&network, single_server("coap://server.example.com")).await;

    step(&mut manager, 30 * 4).await;
    assert_eq!(network.update_count(), 4);
    assert_eq!(network.register_count(), 1);
    assert!(!manager.registration_expired(ssid(1)));
}
