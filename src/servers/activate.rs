//! Activation, deactivation and connection refresh.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{Lwm2mError, Result};
use crate::protocol::{BindingMode, ConnectionMode, ConnectionType, Ssid, Target};
use crate::sched::{Job, RetryState, Scheduler};
use crate::transport::{Resumption, TransportError};

use super::entry::{ActiveServer, ServerEntry};
use super::register::RegistrationResult;
use super::{ServerManager, When};

/// Disable Timeout used when the Server object does not set one
pub const DEFAULT_DISABLE_TIMEOUT: Duration = Duration::from_secs(86400);

impl ServerManager {
    /// Binding the connections of `ssid` should follow
    fn binding_for(&self, ssid: Ssid) -> Result<BindingMode> {
        if ssid.is_bootstrap() {
            return Ok(if self.dm.server_uri(ssid, ConnectionType::Udp).is_some() {
                BindingMode::U
            } else {
                BindingMode::S
            });
        }
        self.dm
            .server(ssid)
            .map(|info| info.binding)
            .ok_or_else(|| Lwm2mError::Validation(format!("no valid Server instance for SSID {ssid}")))
    }

    /// Bring the connections of an active server in line with its binding
    /// and select the primary transport.
    ///
    /// The registration is invalidated when the primary transport changes
    /// or when its secure session could not be resumed.
    pub(crate) async fn refresh_server(&mut self, ssid: Ssid) -> Result<()> {
        if self.offline {
            return Err(Lwm2mError::Offline);
        }
        let binding = self.binding_for(ssid)?;
        let previous_primary = self
            .servers
            .find_active(ssid)
            .ok_or(Lwm2mError::ServerNotFound(ssid))?
            .primary_conn_type;

        let mut primary = None;
        let mut new_session = false;
        let mut fatal_only = true;
        let mut reopened = Vec::new();

        for conn_type in ConnectionType::ALL {
            let uri = self.dm.server_uri(ssid, conn_type);
            let bind = self.bind_config(conn_type);
            let mode = match &uri {
                Some(_) => binding.connection_mode(conn_type),
                None => ConnectionMode::Disabled,
            };

            let entry = self
                .servers
                .get_mut(ssid)
                .ok_or(Lwm2mError::ServerNotFound(ssid))?;
            let (Some(active), nontransient) = entry.split_mut(conn_type) else {
                return Err(Lwm2mError::ServerNotFound(ssid));
            };
            let conn = active.connection_mut(conn_type);
            conn.mode = mode;

            let Some(uri) = uri.filter(|_| mode != ConnectionMode::Disabled) else {
                self.sched.cancel(&mut conn.queue_close);
                conn.cleanup();
                continue;
            };

            let was_online = conn.is_online();
            let result = if was_online {
                Ok(Resumption::Resumed)
            } else {
                conn.bring_online(self.sockets.as_ref(), &uri, nontransient, bind)
                    .await
            };

            match result {
                Ok(resumption) => {
                    if !was_online && mode == ConnectionMode::Queue {
                        reopened.push(conn_type);
                    }
                    if primary.is_none() {
                        primary = Some(conn_type);
                        new_session = resumption == Resumption::NewSession;
                    }
                },
                Err(e) => {
                    fatal_only &= e.is_fatal();
                    log_connect_error(ssid, conn_type, &e);
                },
            }
        }

        // reopened queue connections go back on the idle timer
        for conn_type in reopened {
            self.schedule_queue_mode_close(ssid, conn_type);
        }

        let active = self
            .servers
            .find_active_mut(ssid)
            .ok_or(Lwm2mError::ServerNotFound(ssid))?;
        active.primary_conn_type = primary;
        if primary.is_some() && (primary != previous_primary || new_session) {
            tracing::debug!("new primary connection for SSID {}; registration is stale", ssid);
            active.registration.invalidate();
        }

        match primary {
            Some(_) => Ok(()),
            None if fatal_only => Err(Lwm2mError::Config(format!(
                "no usable transport for SSID {ssid}"
            ))),
            None => Err(Lwm2mError::Network(format!("could not connect to SSID {ssid}"))),
        }
    }

    /// Schedule a sync of the server entries with the data model
    pub(crate) fn schedule_reload(&mut self) {
        self.sched.cancel(&mut self.reload_handle);
        self.reload_handle = Some(self.sched.schedule(super::now(), Duration::ZERO, Job::Reload));
    }

    pub(crate) async fn reload_job(&mut self) {
        self.reload_handle = None;
        if self.offline {
            tracing::debug!("offline; skipping reload");
            return;
        }

        let configured: BTreeSet<Ssid> = self.dm.ssids().into_iter().collect();

        for ssid in self.servers.ssids() {
            if !configured.contains(&ssid) {
                tracing::info!("SSID {} removed from data model", ssid);
                self.release_active(ssid);
                self.cancel_next_action(ssid);
                self.servers.remove(ssid);
            }
        }

        for &ssid in &configured {
            if self.servers.get(ssid).is_none() {
                if let Err(e) = self.servers.insert(ServerEntry::new(ssid)) {
                    tracing::error!("could not add server entry for SSID {}: {}", ssid, e);
                    continue;
                }
                self.set_next_action(ssid, Job::Activate { ssid }, When::Retryable(Duration::ZERO));
            }
        }

        for ssid in self.servers.ssids() {
            if self.is_active(ssid) {
                self.reload_active(ssid).await;
            } else if let Some(entry) = self.servers.get(ssid) {
                if !entry.disabled && !self.sched.is_pending(entry.next_action) {
                    self.set_next_action(ssid, Job::Activate { ssid }, When::Retryable(Duration::ZERO));
                }
            }
        }
    }

    async fn reload_active(&mut self, ssid: Ssid) {
        let reactivate_after = match self.refresh_server(ssid).await {
            Ok(()) if ssid.is_bootstrap() => return,
            Ok(()) => match self.ensure_valid_registration(ssid).await {
                RegistrationResult::Success => return,
                RegistrationResult::Forbidden => None,
                RegistrationResult::Failed => Some(self.sched.policy().initial),
            },
            Err(Lwm2mError::Config(msg)) => {
                tracing::error!("SSID {} cannot be reached: {}", ssid, msg);
                None
            },
            Err(e) => {
                tracing::warn!("could not refresh SSID {}: {}", ssid, e);
                Some(self.sched.policy().initial)
            },
        };
        self.schedule_deactivate(ssid, reactivate_after);
    }

    pub(crate) async fn activate_job(&mut self, ssid: Ssid, retry: Option<RetryState>) {
        if self.offline {
            return;
        }
        let Some(entry) = self.servers.get_mut(ssid) else {
            return;
        };
        if entry.is_active() {
            return;
        }
        entry.disabled = false;
        entry.active = Some(ActiveServer::new());
        let retry = retry.unwrap_or_else(|| self.initial_retry());

        tracing::info!("activating SSID {}", ssid);
        let result = match self.refresh_server(ssid).await {
            Ok(()) if ssid.is_bootstrap() => RegistrationResult::Success,
            Ok(()) => self.ensure_valid_registration(ssid).await,
            Err(Lwm2mError::Config(msg)) => {
                tracing::error!("SSID {} cannot be activated: {}", ssid, msg);
                RegistrationResult::Forbidden
            },
            Err(e) => {
                tracing::warn!("could not activate SSID {}: {}", ssid, e);
                RegistrationResult::Failed
            },
        };

        match result {
            RegistrationResult::Success => {
                tracing::info!("SSID {} active", ssid);
            },
            RegistrationResult::Forbidden => {
                self.release_active(ssid);
                self.mark_disabled(ssid);
            },
            RegistrationResult::Failed => {
                self.release_active(ssid);
                tracing::debug!("reactivating SSID {} after {:?}", ssid, retry.delay);
                self.set_next_action(ssid, Job::Activate { ssid }, When::NextRetry(retry));
            },
        }
    }

    pub(crate) async fn deactivate_job(&mut self, ssid: Ssid, reactivate_after: Option<Duration>) {
        if self.servers.get(ssid).is_none() {
            return;
        }
        if self.is_active(ssid) {
            tracing::info!("deactivating SSID {}", ssid);
            if !ssid.is_bootstrap()
                && !self.offline
                && self.dm.server(ssid).is_some()
                && !self.registration_expired(ssid)
            {
                if let Err(e) = self.deregister(ssid).await {
                    tracing::warn!("De-register with SSID {} failed: {}", ssid, e);
                }
            }
            self.release_active(ssid);
        }

        match reactivate_after {
            Some(delay) => {
                if let Some(entry) = self.servers.get_mut(ssid) {
                    entry.disabled = false;
                }
                self.set_next_action(ssid, Job::Activate { ssid }, When::Retryable(delay));
            },
            None => self.mark_disabled(ssid),
        }
    }

    fn schedule_deactivate(&mut self, ssid: Ssid, reactivate_after: Option<Duration>) -> bool {
        self.set_next_action(
            ssid,
            Job::Deactivate {
                ssid,
                reactivate_after,
            },
            When::After(Duration::ZERO),
        )
    }

    fn mark_disabled(&mut self, ssid: Ssid) {
        self.cancel_next_action(ssid);
        if let Some(entry) = self.servers.get_mut(ssid) {
            tracing::info!("SSID {} disabled", ssid);
            entry.disabled = true;
        }
    }

    /// Tear down the active part of an entry, closing every socket
    fn release_active(&mut self, ssid: Ssid) {
        let Some(mut active) = self.servers.get_mut(ssid).and_then(|entry| entry.active.take())
        else {
            return;
        };
        for conn in active.connections_mut() {
            self.sched.cancel(&mut conn.queue_close);
            conn.cleanup();
        }
    }

    /// Deactivate an active server, optionally reactivating it after
    /// `reactivate_after` (`None` keeps it disabled).
    ///
    /// Deactivating a server that is already inactive changes nothing.
    pub fn deactivate(&mut self, ssid: Ssid, reactivate_after: Option<Duration>) -> Result<()> {
        let entry = self
            .servers
            .get(ssid)
            .ok_or(Lwm2mError::ServerNotFound(ssid))?;
        if !entry.is_active() {
            return Ok(());
        }
        self.schedule_deactivate(ssid, reactivate_after);
        Ok(())
    }

    /// Disable a server for its Disable Timeout
    pub fn disable_server(&mut self, ssid: Ssid) -> Result<()> {
        let timeout = self
            .dm
            .server(ssid)
            .and_then(|info| info.disable_timeout)
            .unwrap_or(DEFAULT_DISABLE_TIMEOUT);
        self.disable_server_with_timeout(ssid, Some(timeout))
    }

    /// Disable a server, re-enabling it after `timeout` (`None` for never).
    /// Also applies to inactive servers, cancelling a pending activation.
    pub fn disable_server_with_timeout(&mut self, ssid: Ssid, timeout: Option<Duration>) -> Result<()> {
        if self.servers.get(ssid).is_none() {
            return Err(Lwm2mError::ServerNotFound(ssid));
        }
        tracing::info!("disabling SSID {} for {:?}", ssid, timeout);
        self.schedule_deactivate(ssid, timeout);
        Ok(())
    }

    /// Re-enable a disabled server right away
    pub fn enable_server(&mut self, ssid: Ssid) -> Result<()> {
        let entry = self
            .servers
            .get_mut(ssid)
            .ok_or(Lwm2mError::ServerNotFound(ssid))?;
        if entry.is_active() {
            return Ok(());
        }
        entry.disabled = false;
        self.set_next_action(ssid, Job::Activate { ssid }, When::Retryable(Duration::ZERO));
        Ok(())
    }

    /// Close the connections of one or every active server and reconnect
    /// them through a reload.
    pub fn schedule_reconnect(&mut self, target: Target) -> Result<()> {
        if self.offline {
            return Err(Lwm2mError::Offline);
        }
        let ssids = match target {
            Target::All => self.servers.active_ssids(),
            Target::Server(ssid) if self.is_active(ssid) => vec![ssid],
            Target::Server(ssid) => return Err(Lwm2mError::ServerNotFound(ssid)),
        };
        for ssid in ssids {
            self.suspend_connections(ssid);
        }
        self.schedule_reload();
        Ok(())
    }

    fn suspend_connections(&mut self, ssid: Ssid) {
        for conn_type in ConnectionType::ALL {
            let online = self
                .servers
                .find_active(ssid)
                .is_some_and(|active| active.connection(conn_type).is_online());
            if online {
                self.flush_notifications(ssid, Some(conn_type));
            }
            if let Some(active) = self.servers.find_active_mut(ssid) {
                let conn = active.connection_mut(conn_type);
                self.sched.cancel(&mut conn.queue_close);
                conn.suspend();
            }
        }
    }

    /// Arm the idle timer of a queue-mode connection after an exchange
    pub(crate) fn schedule_queue_mode_close(&mut self, ssid: Ssid, conn_type: ConnectionType) {
        let delay = self.config.tx_params(conn_type).max_transmit_wait();
        let Some(active) = self.servers.find_active_mut(ssid) else {
            return;
        };
        let conn = active.connection_mut(conn_type);
        self.sched.cancel(&mut conn.queue_close);
        if conn.mode == ConnectionMode::Queue {
            conn.queue_close = Some(self.sched.schedule(
                super::now(),
                delay,
                Job::QueueModeClose { ssid, conn_type },
            ));
        }
    }

    pub(crate) fn queue_mode_close_job(&mut self, ssid: Ssid, conn_type: ConnectionType) {
        let queued = self.servers.find_active(ssid).is_some_and(|active| {
            active.connection(conn_type).mode == ConnectionMode::Queue
        });
        if !queued {
            return;
        }
        self.flush_notifications(ssid, Some(conn_type));
        if let Some(active) = self.servers.find_active_mut(ssid) {
            let conn = active.connection_mut(conn_type);
            conn.queue_close = None;
            conn.suspend();
            tracing::debug!("queue mode: closed idle {} connection of SSID {}", conn_type, ssid);
        }
    }

    /// Force a fresh Register: the server is deactivated and reactivated
    /// right away.
    pub fn schedule_reregister(&mut self, ssid: Ssid) -> Result<()> {
        let active = self
            .servers
            .find_active_mut(ssid)
            .ok_or(Lwm2mError::ServerNotFound(ssid))?;
        active.registration.invalidate();
        self.deactivate(ssid, Some(Duration::ZERO))
    }

    /// Security settings of `ssid` changed; rebuild its connections
    pub fn schedule_socket_update(&mut self, ssid: Ssid) -> Result<()> {
        if let Some(active) = self.servers.find_active_mut(ssid) {
            active.registration.invalidate();
        }
        self.disable_server_with_timeout(ssid, Some(Duration::ZERO))
    }

    /// Stop all traffic. Servers stay active with their sockets closed.
    pub fn enter_offline(&mut self) {
        if self.offline {
            return;
        }
        tracing::info!("entering offline mode");
        self.offline = true;
        self.sched.cancel(&mut self.reload_handle);
        for ssid in self.servers.ssids() {
            self.cancel_next_action(ssid);
            self.suspend_connections(ssid);
        }
    }

    /// Leave offline mode and reconnect through a reload
    pub fn exit_offline(&mut self) {
        if !self.offline {
            return;
        }
        tracing::info!("exiting offline mode");
        self.offline = false;
        self.schedule_reload();
    }

    /// De-register from every registered server and drop all state
    pub async fn shutdown(&mut self) {
        tracing::info!("shutting down");
        for ssid in self.servers.active_ssids() {
            if !ssid.is_bootstrap() && !self.offline && !self.registration_expired(ssid) {
                if let Err(e) = self.deregister(ssid).await {
                    tracing::warn!("De-register with SSID {} failed on shutdown: {}", ssid, e);
                }
            }
            self.release_active(ssid);
        }
        self.servers.drain();
        self.reload_handle = None;
        self.sched = Scheduler::new(self.sched.policy());
    }
}

fn log_connect_error(ssid: Ssid, conn_type: ConnectionType, err: &TransportError) {
    if err.is_fatal() {
        tracing::error!("{} transport of SSID {} unusable: {}", conn_type, ssid, err);
    } else {
        tracing::warn!("could not connect {} for SSID {}: {}", conn_type, ssid, err);
    }
}
