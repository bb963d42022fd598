//! Server entries: one per configured SSID.

use crate::protocol::{BindingMode, ConnectionType, Ssid};
use crate::sched::JobHandle;
use crate::transport::NontransientState;

use super::connection::ServerConnection;
use super::registration::RegistrationInfo;

/// Connection and registration state owned by an active server
#[derive(Debug)]
pub(crate) struct ActiveServer {
    pub(crate) primary_conn_type: Option<ConnectionType>,
    connections: [ServerConnection; 2],
    pub(crate) registration: RegistrationInfo,
}

impl ActiveServer {
    pub(crate) fn new() -> Self {
        Self {
            primary_conn_type: None,
            connections: ConnectionType::ALL.map(ServerConnection::new),
            registration: RegistrationInfo::default(),
        }
    }

    pub(crate) fn connection(&self, conn_type: ConnectionType) -> &ServerConnection {
        &self.connections[conn_type.index()]
    }

    pub(crate) fn connection_mut(&mut self, conn_type: ConnectionType) -> &mut ServerConnection {
        &mut self.connections[conn_type.index()]
    }

    pub(crate) fn connections(&self) -> impl Iterator<Item = &ServerConnection> {
        self.connections.iter()
    }

    pub(crate) fn connections_mut(&mut self) -> impl Iterator<Item = &mut ServerConnection> {
        self.connections.iter_mut()
    }

    /// Whether the Registration Interface transport is selected and online
    pub(crate) fn primary_connection_valid(&self) -> bool {
        self.primary_conn_type
            .is_some_and(|conn_type| self.connection(conn_type).is_online())
    }

    /// Binding Mode rebuilt from the current connection modes
    pub(crate) fn actual_binding_mode(&self) -> crate::error::Result<BindingMode> {
        BindingMode::from_connection_modes(
            self.connection(ConnectionType::Udp).mode,
            self.connection(ConnectionType::Sms).mode,
        )
    }
}

/// One configured server
#[derive(Debug)]
pub(crate) struct ServerEntry {
    ssid: Ssid,
    nontransient: [NontransientState; 2],
    /// Activate, Deactivate or Update job; at most one is pending
    pub(crate) next_action: Option<JobHandle>,
    pub(crate) active: Option<ActiveServer>,
    /// Inactive with no automatic reactivation
    pub(crate) disabled: bool,
}

impl ServerEntry {
    /// New inactive entry
    pub(crate) fn new(ssid: Ssid) -> Self {
        Self {
            ssid,
            nontransient: Default::default(),
            next_action: None,
            active: None,
            disabled: false,
        }
    }

    pub(crate) fn ssid(&self) -> Ssid {
        self.ssid
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub(crate) fn nontransient(&self, conn_type: ConnectionType) -> &NontransientState {
        &self.nontransient[conn_type.index()]
    }

    /// Active part together with the resumption state of `conn_type`
    pub(crate) fn split_mut(
        &mut self,
        conn_type: ConnectionType,
    ) -> (Option<&mut ActiveServer>, &mut NontransientState) {
        (self.active.as_mut(), &mut self.nontransient[conn_type.index()])
    }
}
