//! Best-effort hooks into neighbouring subsystems.
//!
//! Failures reported through these traits are logged by the caller and
//! never change a registration outcome.

use crate::error::Result;
use crate::protocol::ConnectionKey;

/// Hook into the bootstrap subsystem.
pub trait BootstrapNotifier: Send + Sync {
    /// A regular (non-bootstrap) server has just been registered with
    fn regular_connection_available(&self) -> Result<()>;
}

/// Hook into the observation subsystem.
pub trait NotificationFlusher: Send + Sync {
    /// Send notifications queued for `key` while it was unreachable
    fn flush(&self, key: ConnectionKey) -> Result<()>;
}

/// Does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct Noop;

impl BootstrapNotifier for Noop {
    fn regular_connection_available(&self) -> Result<()> {
        Ok(())
    }
}

impl NotificationFlusher for Noop {
    fn flush(&self, _key: ConnectionKey) -> Result<()> {
        Ok(())
    }
}
