//! Update scheduling.
//!
//! The next Update is sent `margin` before the registration expires, where
//!
//! ```text
//! margin = min(lifetime / 2, MAX_TRANSMIT_WAIT of the primary transport)
//! delay  = max(remaining - margin, MIN_UPDATE_INTERVAL)
//! ```
//!
//! so a retransmitted Update still lands before the lifetime runs out, and
//! very short lifetimes cannot flood the network.

use std::time::Duration;

use crate::error::{Lwm2mError, Result};
use crate::protocol::{ConnectionType, Ssid, Target};
use crate::sched::{Job, RetryState};

use super::register::UpdateResult;
use super::{now, ServerManager, When};

/// Lower bound on the delay between Updates
pub const MIN_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// How long before expiry the Update is sent
pub fn update_interval_margin(lifetime: Duration, max_transmit_wait: Duration) -> Duration {
    (lifetime / 2).min(max_transmit_wait)
}

/// Delay before the next Update, given the lifetime left and the margin
pub fn next_update_delay(remaining: Duration, margin: Duration) -> Duration {
    remaining.saturating_sub(margin).max(MIN_UPDATE_INTERVAL)
}

impl ServerManager {
    /// Replace the pending next action of `ssid` with an Update after `delay`
    fn schedule_update(&mut self, ssid: Ssid, delay: Duration) -> Result<()> {
        tracing::debug!("scheduling update for SSID {} after {:?}", ssid, delay);
        if self.set_next_action(ssid, Job::SendUpdate { ssid }, When::Retryable(delay)) {
            Ok(())
        } else {
            Err(Lwm2mError::ServerNotFound(ssid))
        }
    }

    /// Delay until the next periodic Update of an active server
    pub(crate) fn update_delay(&self, ssid: Ssid) -> Result<Duration> {
        let active = self
            .servers
            .find_active(ssid)
            .ok_or(Lwm2mError::ServerNotFound(ssid))?;
        let lifetime = active
            .registration
            .last_update_params()
            .map(|params| params.lifetime())
            .unwrap_or_default();
        let remaining = active.registration.time_remaining(now()).unwrap_or_default();
        let conn_type = active.primary_conn_type.unwrap_or(ConnectionType::Udp);
        let margin =
            update_interval_margin(lifetime, self.config.tx_params(conn_type).max_transmit_wait());
        Ok(next_update_delay(remaining, margin))
    }

    /// Schedule the periodic Update after a successful exchange
    pub(crate) fn reschedule_update_job(&mut self, ssid: Ssid) -> Result<()> {
        let delay = self.update_delay(ssid)?;
        self.schedule_update(ssid, delay)
    }

    /// Send an Update as soon as possible, to one server or to every
    /// active one.
    ///
    /// Fails with [`Lwm2mError::Offline`] in offline mode and with
    /// [`Lwm2mError::ServerNotFound`] when a specific server is not active.
    pub fn schedule_registration_update(&mut self, target: Target) -> Result<()> {
        if self.offline {
            tracing::error!("cannot schedule registration update while being offline");
            return Err(Lwm2mError::Offline);
        }
        match target {
            Target::All => {
                for ssid in self.servers.active_ssids() {
                    self.schedule_update(ssid, Duration::ZERO)?;
                }
                Ok(())
            },
            Target::Server(ssid) => {
                if !self.is_active(ssid) {
                    tracing::error!("no active server with SSID {}", ssid);
                    return Err(Lwm2mError::ServerNotFound(ssid));
                }
                self.schedule_update(ssid, Duration::ZERO)
            },
        }
    }

    /// Give up on the registration and let reactivation register again
    fn drop_registration(&mut self, ssid: Ssid) {
        if let Some(active) = self.servers.find_active_mut(ssid) {
            active.registration.invalidate();
        }
        self.set_next_action(
            ssid,
            Job::Deactivate {
                ssid,
                reactivate_after: Some(Duration::ZERO),
            },
            When::After(Duration::ZERO),
        );
    }

    fn retry_or_drop(&mut self, ssid: Ssid, retry: RetryState) {
        if self.registration_expired(ssid) {
            tracing::info!("registration with SSID {} expired; reactivating", ssid);
            self.drop_registration(ssid);
        } else {
            tracing::debug!("retrying update for SSID {} after {:?}", ssid, retry.delay);
            self.set_next_action(ssid, Job::SendUpdate { ssid }, When::NextRetry(retry));
        }
    }

    pub(crate) async fn send_update_job(&mut self, ssid: Ssid, retry: Option<RetryState>) {
        if !self.is_active(ssid) {
            return;
        }
        let retry = retry.unwrap_or_else(|| self.initial_retry());

        if let Err(e) = self.refresh_server(ssid).await {
            tracing::warn!("could not refresh connections of SSID {}: {}", ssid, e);
            self.retry_or_drop(ssid, retry);
            return;
        }

        // Bootstrap Server has no registration to update
        if ssid.is_bootstrap() {
            return;
        }

        match self.registration_update(ssid).await {
            UpdateResult::Success => {},
            UpdateResult::NeedsRegistration => {
                tracing::info!("SSID {} needs re-registration", ssid);
                self.drop_registration(ssid);
            },
            UpdateResult::Failed => self.retry_or_drop(ssid, retry),
        }
    }
}
