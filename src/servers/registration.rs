//! Registration state of one active server.

use std::time::{Duration, Instant};

use crate::protocol::{EndpointPath, UpdateParameters};

/// When the current registration expires
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Expiry {
    /// Lifetime runs out at this instant
    At(Instant),
    /// Registration is known to be stale; always treated as expired
    #[default]
    Invalid,
}

/// Registration of one server, as of the last successful Register/Update
#[derive(Debug, Clone, Default)]
pub struct RegistrationInfo {
    endpoint_path: EndpointPath,
    last_update_params: Option<UpdateParameters>,
    expire_time: Expiry,
}

impl RegistrationInfo {
    /// Location path assigned by the server
    pub fn endpoint_path(&self) -> &EndpointPath {
        &self.endpoint_path
    }

    /// Parameters sent in the last successful Register/Update
    pub fn last_update_params(&self) -> Option<&UpdateParameters> {
        self.last_update_params.as_ref()
    }

    /// Expiry of the registration
    pub fn expire_time(&self) -> Expiry {
        self.expire_time
    }

    /// Time left until expiry, `None` when invalid
    pub fn time_remaining(&self, now: Instant) -> Option<Duration> {
        match self.expire_time {
            Expiry::At(deadline) => Some(deadline.saturating_duration_since(now)),
            Expiry::Invalid => None,
        }
    }

    /// Whether no lifetime is left (or the expiry is invalid)
    pub fn is_expired(&self, now: Instant) -> bool {
        self.time_remaining(now).is_none_or(|left| left.is_zero())
    }

    /// Record a successful Register (`endpoint_path` set) or Update and
    /// restart the lifetime from `now`.
    pub fn update(&mut self, endpoint_path: Option<EndpointPath>, params: UpdateParameters, now: Instant) {
        if let Some(path) = endpoint_path {
            self.endpoint_path = path;
        }
        self.expire_time = now
            .checked_add(params.lifetime())
            .map_or(Expiry::Invalid, Expiry::At);
        self.last_update_params = Some(params);
    }

    /// Mark the registration as stale
    pub fn invalidate(&mut self) {
        self.expire_time = Expiry::Invalid;
    }
}
