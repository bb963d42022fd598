//! Register, Update and De-register against one active server.
//!
//! Each attempt is evaluated from scratch:
//!
//! | Primary connection | Registration | Data model  | Outcome             |
//! |--------------------|--------------|-------------|---------------------|
//! | not online         | any          | any         | needs Register      |
//! | online             | expired      | any         | needs Register      |
//! | online             | valid        | unchanged   | success, no traffic |
//! | online             | valid        | changed     | Update              |
//!
//! Transport failures are absorbed here and turned into outcomes; the
//! callers decide about retries.

use crate::error::{Lwm2mError, Result};
use crate::protocol::{
    ConnectionMode, ConnectionType, RegisterRequest, Ssid, UpdateParameters, UpdateRequest,
};
use crate::transport::ExchangeError;

use super::{now, ServerManager};

/// Outcome of an Update attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdateResult {
    /// Registration is current
    Success,
    /// A full Register is required
    NeedsRegistration,
    /// Transient failure; retry later
    Failed,
}

/// Outcome of making sure a valid registration exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegistrationResult {
    /// Registered (or Updated, or nothing to do)
    Success,
    /// The server refused the Register
    Forbidden,
    /// Anything else
    Failed,
}

impl ServerManager {
    /// Parameters the next Register/Update would carry
    fn update_params(&self, ssid: Ssid) -> Result<UpdateParameters> {
        let info = self
            .dm
            .server(ssid)
            .ok_or_else(|| Lwm2mError::Validation(format!("no Server instance for SSID {ssid}")))?;
        let active = self
            .servers
            .find_active(ssid)
            .ok_or(Lwm2mError::ServerNotFound(ssid))?;
        let binding_mode = active.actual_binding_mode().unwrap_or(info.binding);
        Ok(UpdateParameters {
            lifetime_s: info.lifetime_s,
            binding_mode,
            dm: self.dm.snapshot(),
        })
    }

    fn needs_update(&self, ssid: Ssid, params: &UpdateParameters) -> bool {
        self.servers.find_active(ssid).is_none_or(|active| {
            !UpdateRequest::between(active.registration.last_update_params(), params).is_empty()
        })
    }

    fn invalidate_registration(&mut self, ssid: Ssid) {
        if let Some(active) = self.servers.find_active_mut(ssid) {
            active.registration.invalidate();
        }
    }

    /// Whether the primary connection is selected and online; logs and
    /// invalidates the registration when it is not.
    fn check_primary_connection(&mut self, ssid: Ssid) -> bool {
        let valid = self
            .servers
            .find_active(ssid)
            .is_some_and(|active| active.primary_connection_valid());
        if !valid {
            tracing::info!(
                "No valid existing connection to Registration Interface for SSID {}, needs re-registration",
                ssid
            );
            self.invalidate_registration(ssid);
        }
        valid
    }

    /// Send an Update over the primary connection
    async fn send_update(&mut self, ssid: Ssid, params: UpdateParameters) -> UpdateResult {
        let Some(active) = self.servers.find_active_mut(ssid) else {
            return UpdateResult::Failed;
        };
        let Some(conn_type) = active.primary_conn_type else {
            return UpdateResult::NeedsRegistration;
        };
        let request = UpdateRequest::between(active.registration.last_update_params(), &params);
        let endpoint = active.registration.endpoint_path().clone();
        let Some(socket) = active.connection_mut(conn_type).online_socket_mut() else {
            return UpdateResult::NeedsRegistration;
        };

        tracing::debug!("sending Update to SSID {} at {}: {:?}", ssid, endpoint, request.query_args());
        let result = self.exchange.update(socket.as_mut(), &endpoint, &request).await;

        match result {
            Ok(()) => {
                if let Some(active) = self.servers.find_active_mut(ssid) {
                    active.registration.update(None, params, now());
                }
                self.schedule_queue_mode_close(ssid, conn_type);
                UpdateResult::Success
            },
            Err(ExchangeError::Rejected) => {
                tracing::debug!("update rejected for SSID {}; needs re-registration", ssid);
                self.invalidate_registration(ssid);
                UpdateResult::NeedsRegistration
            },
            Err(ExchangeError::Network(e)) => {
                tracing::error!(
                    "network communication error while updating registration for SSID {}: {}",
                    ssid,
                    e
                );
                // suspend rather than reconnect: the scheduler's backoff
                // paces the next attempt
                if let Some(active) = self.servers.find_active_mut(ssid) {
                    active.connection_mut(conn_type).suspend();
                }
                UpdateResult::Failed
            },
            Err(e) => {
                tracing::error!("could not send registration update for SSID {}: {}", ssid, e);
                UpdateResult::Failed
            },
        }
    }

    /// Send a Register over the primary connection
    async fn send_register(&mut self, ssid: Ssid, params: UpdateParameters) -> Result<()> {
        let request = RegisterRequest::new(
            &self.config.endpoint_name,
            &self.config.lwm2m_version,
            self.config.sms_msisdn.as_deref(),
            &params,
        );
        let active = self
            .servers
            .find_active_mut(ssid)
            .ok_or(Lwm2mError::ServerNotFound(ssid))?;
        let conn_type = active
            .primary_conn_type
            .ok_or_else(|| Lwm2mError::Internal(format!("no primary connection for SSID {ssid}")))?;
        let socket = active
            .connection_mut(conn_type)
            .online_socket_mut()
            .ok_or_else(|| Lwm2mError::Network(format!("primary connection of SSID {ssid} is offline")))?;

        tracing::debug!("sending Register to SSID {}: {:?}", ssid, request.query_args());
        let endpoint = self.exchange.register(socket.as_mut(), &request).await?;

        tracing::info!("registered with SSID {} at {}", ssid, endpoint);
        if let Some(active) = self.servers.find_active_mut(ssid) {
            active.registration.update(Some(endpoint), params, now());
        }
        self.schedule_queue_mode_close(ssid, conn_type);
        Ok(())
    }

    /// Select a primary transport, bringing a connection online if needed
    pub(crate) async fn setup_primary_connection(&mut self, ssid: Ssid) -> Result<ConnectionType> {
        for conn_type in ConnectionType::ALL {
            let mode = match self.servers.find_active(ssid) {
                Some(active) => active.connection(conn_type).mode,
                None => return Err(Lwm2mError::ServerNotFound(ssid)),
            };
            if mode == ConnectionMode::Disabled {
                continue;
            }
            if self.ensure_connection_online(ssid, conn_type).await.is_ok() {
                if let Some(active) = self.servers.find_active_mut(ssid) {
                    active.primary_conn_type = Some(conn_type);
                }
                return Ok(conn_type);
            }
        }
        tracing::error!("could not set up primary connection for SSID {}", ssid);
        Err(Lwm2mError::Network(format!("no usable connection for SSID {ssid}")))
    }

    /// Bring one connection online if it is not already
    pub(crate) async fn ensure_connection_online(
        &mut self,
        ssid: Ssid,
        conn_type: ConnectionType,
    ) -> Result<()> {
        let uri = self
            .dm
            .server_uri(ssid, conn_type)
            .ok_or_else(|| Lwm2mError::Config(format!("no {conn_type} URI for SSID {ssid}")))?;
        let bind = self.bind_config(conn_type);
        let entry = self
            .servers
            .get_mut(ssid)
            .ok_or(Lwm2mError::ServerNotFound(ssid))?;
        let (Some(active), nontransient) = entry.split_mut(conn_type) else {
            return Err(Lwm2mError::ServerNotFound(ssid));
        };
        let conn = active.connection_mut(conn_type);
        if conn.is_online() {
            return Ok(());
        }
        conn.bring_online(self.sockets.as_ref(), &uri, nontransient, bind)
            .await
            .map(|_| ())
            .map_err(|e| {
                tracing::warn!("could not connect {} for SSID {}: {}", conn_type, ssid, e);
                Lwm2mError::from(e)
            })
    }

    /// Flush notifications, then reschedule the next Update after a success
    fn finish_registration_action(&mut self, ssid: Ssid, succeeded: bool) -> bool {
        let conn_type = self
            .servers
            .find_active(ssid)
            .and_then(|active| active.primary_conn_type);
        self.flush_notifications(ssid, conn_type);
        if succeeded && self.reschedule_update_job(ssid).is_err() {
            tracing::error!("could not schedule next Update for SSID {}", ssid);
            return false;
        }
        succeeded
    }

    /// Update the registration if one exists, without registering anew
    pub(crate) async fn registration_update(&mut self, ssid: Ssid) -> UpdateResult {
        let params = match self.update_params(ssid) {
            Ok(params) => params,
            Err(e) => {
                tracing::error!("could not prepare Update for SSID {}: {}", ssid, e);
                return UpdateResult::Failed;
            },
        };

        let result = if !self.check_primary_connection(ssid) || self.registration_expired(ssid) {
            UpdateResult::NeedsRegistration
        } else {
            self.send_update(ssid, params).await
        };

        if self.finish_registration_action(ssid, result == UpdateResult::Success) {
            result
        } else if result == UpdateResult::Success {
            UpdateResult::Failed
        } else {
            result
        }
    }

    /// Make sure the server holds a valid registration: nothing, Update or
    /// full Register as needed.
    pub(crate) async fn ensure_valid_registration(&mut self, ssid: Ssid) -> RegistrationResult {
        let params = match self.update_params(ssid) {
            Ok(params) => params,
            Err(e) => {
                tracing::error!("could not prepare registration for SSID {}: {}", ssid, e);
                return RegistrationResult::Failed;
            },
        };

        let update_result = if !self.check_primary_connection(ssid) || self.registration_expired(ssid) {
            UpdateResult::NeedsRegistration
        } else if !self.needs_update(ssid, &params) {
            UpdateResult::Success
        } else {
            self.send_update(ssid, params.clone()).await
        };

        let result = match update_result {
            UpdateResult::Success => RegistrationResult::Success,
            UpdateResult::Failed => RegistrationResult::Failed,
            UpdateResult::NeedsRegistration => self.register(ssid, params).await,
        };

        if self.finish_registration_action(ssid, result == RegistrationResult::Success) {
            result
        } else if result == RegistrationResult::Success {
            RegistrationResult::Failed
        } else {
            result
        }
    }

    async fn register(&mut self, ssid: Ssid, params: UpdateParameters) -> RegistrationResult {
        let primary_valid = self
            .servers
            .find_active(ssid)
            .is_some_and(|active| active.primary_connection_valid());
        if !primary_valid && self.setup_primary_connection(ssid).await.is_err() {
            return RegistrationResult::Failed;
        }

        match self.send_register(ssid, params).await {
            Ok(()) => {
                if let Err(e) = self.bootstrap.regular_connection_available() {
                    tracing::warn!("bootstrap hook failed after registering SSID {}: {}", ssid, e);
                }
                RegistrationResult::Success
            },
            Err(Lwm2mError::Forbidden) => {
                tracing::warn!("registration with SSID {} forbidden", ssid);
                RegistrationResult::Forbidden
            },
            Err(e) => {
                tracing::debug!("re-registration with SSID {} failed: {}", ssid, e);
                RegistrationResult::Failed
            },
        }
    }

    /// Send De-register. A missing primary connection makes this a no-op.
    pub(crate) async fn deregister(&mut self, ssid: Ssid) -> Result<()> {
        let Some(conn_type) = self
            .servers
            .find_active(ssid)
            .and_then(|active| active.primary_conn_type)
        else {
            tracing::error!("could not get stream for server {}, skipping", ssid);
            return Ok(());
        };
        if self.ensure_connection_online(ssid, conn_type).await.is_err() {
            tracing::error!("could not get stream for server {}, skipping", ssid);
            return Ok(());
        }

        let Some(active) = self.servers.find_active_mut(ssid) else {
            return Ok(());
        };
        let endpoint = active.registration.endpoint_path().clone();
        let Some(socket) = active.connection_mut(conn_type).online_socket_mut() else {
            return Ok(());
        };

        tracing::debug!("sending De-register to SSID {} at {}", ssid, endpoint);
        let result = self.exchange.deregister(socket.as_mut(), &endpoint).await;
        if let Err(e) = &result {
            tracing::error!("could not send De-Register request to SSID {}: {}", ssid, e);
        }
        if let Some(active) = self.servers.find_active_mut(ssid) {
            active.registration.invalidate();
        }
        result.map_err(Lwm2mError::from)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::ClientConfig;
    use crate::dm::{InMemoryDataModel, SecurityInstance, ServerInstance, ServerObject};
    use crate::servers::entry::{ActiveServer, ServerEntry};
    use crate::transport::mock::{MockNetwork, RecordedRequest};

    fn ssid() -> Ssid {
        Ssid::new(1).unwrap()
    }

    fn manager(network: &MockNetwork, binding: &str) -> ServerManager {
        let servers = ServerObject::new(vec![ServerInstance::new(1, 60, binding)]).unwrap();
        let dm = InMemoryDataModel::new(
            servers,
            vec![SecurityInstance::server(1, "coap://server.example.com")],
        )
        .unwrap();
        let mut manager = ServerManager::new(
            ClientConfig::default(),
            Arc::new(dm),
            network.socket_factory(),
            network.exchange(),
        )
        .unwrap();
        let mut entry = ServerEntry::new(ssid());
        let mut active = ActiveServer::new();
        active.connection_mut(ConnectionType::Udp).mode = ConnectionMode::Online;
        entry.active = Some(active);
        manager.servers.insert(entry).unwrap();
        manager
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_connection_registers() {
        let network = MockNetwork::new();
        let mut manager = manager(&network, "U");

        let result = manager.ensure_valid_registration(ssid()).await;
        assert_eq!(result, RegistrationResult::Success);
        assert_eq!(network.register_count(), 1);
        assert!(!manager.registration_expired(ssid()));
        assert_eq!(
            manager.servers.find_active(ssid()).unwrap().primary_conn_type,
            Some(ConnectionType::Udp)
        );
        // next Update scheduled
        assert!(manager.sched.is_pending(manager.servers.get(ssid()).unwrap().next_action));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_fails_without_register() {
        let network = MockNetwork::new();
        network.fail_next_connects(1);
        let mut manager = manager(&network, "U");

        let result = manager.ensure_valid_registration(ssid()).await;
        assert_eq!(result, RegistrationResult::Failed);
        assert_eq!(network.register_count(), 0);
        assert!(manager.registration_expired(ssid()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_valid_registration_sends_nothing() {
        let network = MockNetwork::new();
        let mut manager = manager(&network, "U");
        manager.ensure_valid_registration(ssid()).await;
        network.clear_requests();

        let result = manager.ensure_valid_registration(ssid()).await;
        assert_eq!(result, RegistrationResult::Success);
        assert!(network.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_rejected_needs_registration() {
        let network = MockNetwork::new();
        let mut manager = manager(&network, "U");
        manager.ensure_valid_registration(ssid()).await;
        network.push_update_response(Err(ExchangeError::Rejected));

        let params = manager.update_params(ssid()).unwrap();
        let result = manager.send_update(ssid(), params).await;
        assert_eq!(result, UpdateResult::NeedsRegistration);
        assert!(manager.registration_expired(ssid()));
        // connection survives a rejection
        assert!(manager.servers.find_active(ssid()).unwrap().primary_connection_valid());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_network_error_suspends_primary() {
        let network = MockNetwork::new();
        let mut manager = manager(&network, "U");
        manager.ensure_valid_registration(ssid()).await;
        network.push_update_response(Err(ExchangeError::Network("timeout".to_string())));

        let result = manager.registration_update(ssid()).await;
        assert_eq!(result, UpdateResult::Failed);
        let active = manager.servers.find_active(ssid()).unwrap();
        assert!(!active.primary_connection_valid());
        assert!(active.connection(ConnectionType::Udp).has_socket());
        // not expired: the failure is transient
        assert!(!manager.registration_expired(ssid()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forbidden_is_distinct() {
        let network = MockNetwork::new();
        network.push_register_response(Err(ExchangeError::Forbidden));
        let mut manager = manager(&network, "U");

        assert_eq!(
            manager.ensure_valid_registration(ssid()).await,
            RegistrationResult::Forbidden
        );

        network.push_register_response(Err(ExchangeError::Other("4.00".to_string())));
        assert_eq!(
            manager.ensure_valid_registration(ssid()).await,
            RegistrationResult::Failed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_lifetime_sends_update_with_only_lifetime() {
        let network = MockNetwork::new();
        let mut manager = manager(&network, "U");
        manager.ensure_valid_registration(ssid()).await;

        let dm = InMemoryDataModel::new(
            ServerObject::new(vec![ServerInstance::new(1, 300, "U")]).unwrap(),
            vec![SecurityInstance::server(1, "coap://server.example.com")],
        )
        .unwrap();
        manager.dm = Arc::new(dm);
        network.clear_requests();

        assert_eq!(
            manager.ensure_valid_registration(ssid()).await,
            RegistrationResult::Success
        );
        match network.requests().as_slice() {
            [RecordedRequest::Update { request, endpoint, .. }] => {
                assert_eq!(request.lifetime_s, Some(300));
                assert_eq!(request.binding_mode, None);
                assert_eq!(endpoint.to_string(), "/rd/1");
            },
            other => panic!("unexpected requests: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deregister_without_primary_is_noop() {
        let network = MockNetwork::new();
        let mut manager = manager(&network, "U");

        manager.deregister(ssid()).await.unwrap();
        assert_eq!(network.deregister_count(), 0);

        manager.ensure_valid_registration(ssid()).await;
        manager.deregister(ssid()).await.unwrap();
        assert_eq!(network.deregister_count(), 1);
        assert!(manager.registration_expired(ssid()));
    }
}
