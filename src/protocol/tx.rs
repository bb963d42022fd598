//! CoAP transmission parameters (RFC 7252, section 4.8).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Lwm2mError, Result};

/// Upper bound for MAX_RETRANSMIT accepted by [`CoapTxParams::validate`]
const MAX_RETRANSMIT_LIMIT: u32 = 20;

/// CoAP transmission parameters of one transport
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoapTxParams {
    /// ACK_TIMEOUT in milliseconds
    pub ack_timeout_ms: u64,
    /// ACK_RANDOM_FACTOR
    pub ack_random_factor: f64,
    /// MAX_RETRANSMIT
    pub max_retransmit: u32,
}

impl Default for CoapTxParams {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 2000,
            ack_random_factor: 1.5,
            max_retransmit: 4,
        }
    }
}

impl CoapTxParams {
    /// ACK_TIMEOUT as a duration
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// MAX_TRANSMIT_WAIT: `ACK_TIMEOUT * (2^(MAX_RETRANSMIT + 1) - 1) * ACK_RANDOM_FACTOR`
    pub fn max_transmit_wait(&self) -> Duration {
        let attempts = 2u64
            .saturating_pow(self.max_retransmit.saturating_add(1))
            .saturating_sub(1);
        let secs = self.ack_timeout().as_secs_f64() * attempts as f64 * self.ack_random_factor;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Reject parameter sets that would make retransmission meaningless
    pub fn validate(&self) -> Result<()> {
        if self.ack_timeout_ms == 0 {
            return Err(Lwm2mError::Config("ack_timeout_ms must be positive".to_string()));
        }
        if self.ack_random_factor.is_nan() || self.ack_random_factor < 1.0 {
            return Err(Lwm2mError::Config(format!(
                "ack_random_factor must be at least 1.0, got {}",
                self.ack_random_factor
            )));
        }
        if self.max_retransmit > MAX_RETRANSMIT_LIMIT {
            return Err(Lwm2mError::Config(format!(
                "max_retransmit {} exceeds {}",
                self.max_retransmit, MAX_RETRANSMIT_LIMIT
            )));
        }
        Ok(())
    }
}
