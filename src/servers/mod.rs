//! Server registration state machine and connection lifecycle.
//!
//! [`ServerManager`] owns one entry per configured server and drives each
//! of them through activation, registration, periodic Updates and
//! deactivation. All transitions run as typed jobs on a single
//! [`Scheduler`](crate::sched::Scheduler), one at a time.
//!
//! # Lifecycle
//!
//! ```text
//!                 Activate
//!   Inactive ────────────────▶ connect ──▶ Register ──▶ Active
//!      ▲                          │            │          │
//!      │ Deactivate               │ fail       │ fail     │ SendUpdate
//!      │ (De-register if          ▼            ▼          ▼
//!      │  still registered)   retry with backoff     refresh + Update
//!      │                                                  │
//!      └──────────── rejected / expired ◀─────────────────┘
//! ```
//!
//! # Jobs
//!
//! | Job              | Pending per         | Effect                                  |
//! |------------------|---------------------|-----------------------------------------|
//! | `Reload`         | manager             | sync entries with the data model        |
//! | `Activate`       | entry (next action) | connect, then ensure a registration     |
//! | `Deactivate`     | entry (next action) | De-register, tear down, maybe reactivate|
//! | `SendUpdate`     | entry (next action) | refresh connection, Update or Register  |
//! | `QueueModeClose` | connection          | close an idle queue-mode socket         |
//!
//! Every entry has at most one pending Activate/Deactivate/SendUpdate job;
//! scheduling a new one always cancels the previous one first.

mod activate;
mod connection;
mod entry;
mod register;
mod registration;
mod registry;
mod update;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

pub use activate::DEFAULT_DISABLE_TIMEOUT;
pub use registration::{Expiry, RegistrationInfo};
pub use update::{next_update_delay, update_interval_margin, MIN_UPDATE_INTERVAL};

use crate::config::ClientConfig;
use crate::dm::DataModel;
use crate::error::{Lwm2mError, Result};
use crate::notify::{BootstrapNotifier, Noop, NotificationFlusher};
use crate::protocol::{BindingMode, ConnectionKey, ConnectionMode, ConnectionType, Ssid};
use crate::sched::{FiredJob, Job, JobHandle, RetryState, Scheduler};
use crate::transport::{RegistrationExchange, SocketFactory, SocketId};

use connection::{BindConfig, SocketState};
use entry::ServerEntry;
use registry::ServerRegistry;

/// Current time on the runtime clock (honours paused tokio time)
pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// How to place a job on the scheduler
#[derive(Debug, Clone, Copy)]
pub(crate) enum When {
    /// Once, after a delay
    After(Duration),
    /// After a delay, with fresh backoff state
    Retryable(Duration),
    /// After the delay carried by a previous failure
    NextRetry(RetryState),
}

/// Drives registration of every configured server
pub struct ServerManager {
    config: ClientConfig,
    servers: ServerRegistry,
    sched: Scheduler,
    dm: Arc<dyn DataModel>,
    sockets: Arc<dyn SocketFactory>,
    exchange: Arc<dyn RegistrationExchange>,
    bootstrap: Arc<dyn BootstrapNotifier>,
    notifications: Arc<dyn NotificationFlusher>,
    offline: bool,
    reload_handle: Option<JobHandle>,
}

impl std::fmt::Debug for ServerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerManager")
            .field("servers", &self.servers)
            .field("sched", &self.sched)
            .field("offline", &self.offline)
            .finish_non_exhaustive()
    }
}

impl ServerManager {
    /// Create a manager; nothing happens until [`start`](Self::start)
    pub fn new(
        config: ClientConfig,
        dm: Arc<dyn DataModel>,
        sockets: Arc<dyn SocketFactory>,
        exchange: Arc<dyn RegistrationExchange>,
    ) -> Result<Self> {
        config.validate()?;
        let sched = Scheduler::new(config.retry.policy());
        Ok(Self {
            config,
            servers: ServerRegistry::default(),
            sched,
            dm,
            sockets,
            exchange,
            bootstrap: Arc::new(Noop),
            notifications: Arc::new(Noop),
            offline: false,
            reload_handle: None,
        })
    }

    /// Install the bootstrap subsystem hook
    pub fn with_bootstrap_notifier(mut self, notifier: Arc<dyn BootstrapNotifier>) -> Self {
        self.bootstrap = notifier;
        self
    }

    /// Install the observation subsystem hook
    pub fn with_notification_flusher(mut self, flusher: Arc<dyn NotificationFlusher>) -> Self {
        self.notifications = flusher;
        self
    }

    /// Client configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Job queue, for inspection
    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    /// Schedule the initial reload
    pub fn start(&mut self) {
        self.schedule_reload();
    }

    /// When [`run_pending`](Self::run_pending) has work next
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sched.next_deadline()
    }

    /// Run every job that is due, including jobs they schedule for now.
    /// Returns the number of jobs run.
    pub async fn run_pending(&mut self) -> usize {
        let mut count = 0;
        while let Some(fired) = self.sched.pop_due(now()) {
            self.dispatch(fired).await;
            count += 1;
        }
        count
    }

    async fn dispatch(&mut self, fired: FiredJob) {
        tracing::trace!("running {:?}", fired.job);
        match fired.job {
            Job::Reload => self.reload_job().await,
            Job::Activate { ssid } => self.activate_job(ssid, fired.retry).await,
            Job::Deactivate {
                ssid,
                reactivate_after,
            } => self.deactivate_job(ssid, reactivate_after).await,
            Job::SendUpdate { ssid } => self.send_update_job(ssid, fired.retry).await,
            Job::QueueModeClose { ssid, conn_type } => self.queue_mode_close_job(ssid, conn_type),
        }
    }

    /// Replace the pending next action of `ssid` with `job`.
    /// Returns `false` if there is no such entry.
    pub(crate) fn set_next_action(&mut self, ssid: Ssid, job: Job, when: When) -> bool {
        let Some(entry) = self.servers.get_mut(ssid) else {
            return false;
        };
        self.sched.cancel(&mut entry.next_action);
        let now = now();
        let handle = match when {
            When::After(delay) => self.sched.schedule(now, delay, job),
            When::Retryable(delay) => self.sched.schedule_retryable(now, delay, job),
            When::NextRetry(retry) => self.sched.schedule_next_retryable(now, job, retry),
        };
        entry.next_action = Some(handle);
        true
    }

    pub(crate) fn cancel_next_action(&mut self, ssid: Ssid) {
        if let Some(entry) = self.servers.get_mut(ssid) {
            self.sched.cancel(&mut entry.next_action);
        }
    }

    pub(crate) fn initial_retry(&self) -> RetryState {
        RetryState {
            delay: self.sched.policy().initial,
        }
    }

    pub(crate) fn bind_config(&self, conn_type: ConnectionType) -> BindConfig {
        match conn_type {
            ConnectionType::Udp => BindConfig {
                static_port: self.config.udp.static_port_preference,
            },
            ConnectionType::Sms => BindConfig::default(),
        }
    }

    /// Best-effort flush of notifications queued for a connection
    pub(crate) fn flush_notifications(&self, ssid: Ssid, conn_type: Option<ConnectionType>) {
        if let Err(e) = self.notifications.flush(ConnectionKey { ssid, conn_type }) {
            tracing::warn!("could not flush notifications for SSID {}: {}", ssid, e);
        }
    }

    /// Whether offline mode is on
    pub fn is_offline(&self) -> bool {
        self.offline
    }

    /// Whether the registration with `ssid` is expired or invalid.
    /// Servers that are not active have no registration and count as expired.
    pub fn registration_expired(&self, ssid: Ssid) -> bool {
        match self.servers.find_active(ssid) {
            Some(active) => {
                let expired = active.registration.is_expired(now());
                if expired {
                    tracing::debug!("Registration Lifetime expired for SSID {}", ssid);
                }
                expired
            },
            None => true,
        }
    }

    /// Binding Mode derived from the connection modes in use
    pub fn actual_binding_mode(&self, ssid: Ssid) -> Result<BindingMode> {
        self.servers
            .find_active(ssid)
            .ok_or(Lwm2mError::ServerNotFound(ssid))?
            .actual_binding_mode()
    }

    /// Registration of an active server
    pub fn registration_info(&self, ssid: Ssid) -> Option<&RegistrationInfo> {
        self.servers.find_active(ssid).map(|active| &active.registration)
    }

    /// Whether `ssid` is active
    pub fn is_active(&self, ssid: Ssid) -> bool {
        self.servers.find_active(ssid).is_some()
    }

    /// Active server owning the online `conn_type` socket `socket`
    pub fn find_by_socket(&self, conn_type: ConnectionType, socket: SocketId) -> Option<Ssid> {
        self.servers.find_by_socket(conn_type, socket)
    }

    /// Every online socket
    pub fn online_sockets(&self) -> Vec<OnlineSocket> {
        let mut sockets = Vec::new();
        for entry in self.servers.iter() {
            let Some(active) = &entry.active else { continue };
            for conn in active.connections() {
                if let Some(socket) = conn.online_socket_id() {
                    sockets.push(OnlineSocket {
                        ssid: entry.ssid(),
                        conn_type: conn.conn_type(),
                        socket,
                    });
                }
            }
        }
        sockets
    }

    /// Per-server status report
    pub fn status(&self) -> Vec<ServerStatus> {
        let now = now();
        self.servers
            .iter()
            .map(|entry| {
                let active = entry.active.as_ref();
                let connections = active
                    .map(|active| {
                        active
                            .connections()
                            .map(|conn| ConnectionStatus {
                                conn_type: conn.conn_type(),
                                mode: conn.mode,
                                socket: match conn.socket_state() {
                                    SocketState::NoSocket => SocketStatus::NoSocket,
                                    SocketState::Suspended(_) => SocketStatus::Suspended,
                                    SocketState::Online(_) => SocketStatus::Online,
                                },
                                queue_close_pending: self.sched.is_pending(conn.queue_close),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let registration = active.map(|active| &active.registration);
                ServerStatus {
                    ssid: entry.ssid(),
                    active: entry.is_active(),
                    disabled: entry.disabled,
                    primary_conn_type: active.and_then(|active| active.primary_conn_type),
                    binding_mode: active.and_then(|active| active.actual_binding_mode().ok()),
                    endpoint_path: registration
                        .map(|info| info.endpoint_path())
                        .filter(|path| !path.is_empty())
                        .map(ToString::to_string),
                    expires_in_s: registration
                        .and_then(|info| info.time_remaining(now))
                        .map(|left| left.as_secs()),
                    next_action_in_ms: self
                        .sched
                        .deadline(entry.next_action)
                        .map(|deadline| deadline.saturating_duration_since(now).as_millis() as u64),
                    connections,
                }
            })
            .collect()
    }
}

/// An online socket and its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OnlineSocket {
    /// Owning server
    pub ssid: Ssid,
    /// Transport
    pub conn_type: ConnectionType,
    /// Socket
    pub socket: SocketId,
}

/// Socket state as reported by [`ServerManager::status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketStatus {
    /// No socket
    NoSocket,
    /// Socket closed
    Suspended,
    /// Socket connected
    Online,
}

/// Status of one connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    /// Transport
    pub conn_type: ConnectionType,
    /// Mode from the binding
    pub mode: ConnectionMode,
    /// Socket state
    pub socket: SocketStatus,
    /// Whether a queue-mode close is scheduled
    pub queue_close_pending: bool,
}

/// Status of one server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    /// Short Server ID
    pub ssid: Ssid,
    /// Whether the entry is active
    pub active: bool,
    /// Whether the entry is disabled without reactivation
    pub disabled: bool,
    /// Registration Interface transport
    pub primary_conn_type: Option<ConnectionType>,
    /// Binding Mode from the connection modes
    pub binding_mode: Option<BindingMode>,
    /// Registration location, e.g. `/rd/5a3f`
    pub endpoint_path: Option<String>,
    /// Seconds until the registration expires
    pub expires_in_s: Option<u64>,
    /// Milliseconds until the next Activate/Deactivate/Update job
    pub next_action_in_ms: Option<u64>,
    /// Connections, empty when inactive
    pub connections: Vec<ConnectionStatus>,
}
