//! Data model collaborators of the registration core.
//!
//! The core reads server configuration through the [`DataModel`] trait:
//! validated Server object fields per SSID, server URIs from the Security
//! object, the list of configured SSIDs, and an opaque snapshot of the
//! object tree used to decide whether an Update must carry a new object
//! list.
//!
//! [`ServerObject`] implements the Server object (`/1`) instance set with
//! its validation and transaction semantics; [`InMemoryDataModel`] puts it
//! together with Security instances behind the [`DataModel`] trait.

mod memory;
mod server;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use memory::{InMemoryDataModel, SecurityInstance};
pub use server::{ServerInstance, ServerObject};

use crate::protocol::{BindingMode, ConnectionType, Ssid};
use crate::transport::ServerUri;

/// Server object ID
pub const SERVER_OID: u16 = 1;

/// Security object ID
pub const SECURITY_OID: u16 = 0;

/// Validated Server object fields of one server
#[derive(Debug, Clone, PartialEq)]
pub struct ServerInfo {
    /// Short Server ID
    pub ssid: Ssid,
    /// Registration lifetime in seconds, always positive
    pub lifetime_s: i64,
    /// Binding mode
    pub binding: BindingMode,
    /// Whether notifications are stored while the server is unreachable
    pub notification_storing: bool,
    /// Default minimum observation period
    pub default_min_period: Option<u32>,
    /// Default maximum observation period, never zero
    pub default_max_period: Option<i64>,
    /// How long the server stays disabled after a Disable execute
    pub disable_timeout: Option<Duration>,
}

/// One object and its instances, as advertised in Register
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectEntry {
    /// Object ID
    pub oid: u16,
    /// Object version, when not the default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Instance IDs, sorted
    #[serde(default)]
    pub instances: Vec<u16>,
}

impl ObjectEntry {
    /// Create an entry with sorted, deduplicated instance IDs
    pub fn new(oid: u16, mut instances: Vec<u16>) -> Self {
        instances.sort_unstable();
        instances.dedup();
        Self {
            oid,
            version: None,
            instances,
        }
    }

    /// Set the object version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Opaque object-tree snapshot compared between Register/Update attempts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmSnapshot(Vec<ObjectEntry>);

impl DmSnapshot {
    /// Create a snapshot, ordering entries by object ID
    pub fn new(mut objects: Vec<ObjectEntry>) -> Self {
        objects.sort();
        Self(objects)
    }

    /// Objects in ascending OID order
    pub fn objects(&self) -> &[ObjectEntry] {
        &self.0
    }

    /// Whether no object is advertised
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Read access to the data model.
///
/// Implementations must be cheap to query: the core calls these on every
/// Update attempt.
pub trait DataModel: Send + Sync {
    /// Validated Server object fields for `ssid`, `None` if absent.
    ///
    /// The Bootstrap Server has no Server object instance.
    fn server(&self, ssid: Ssid) -> Option<ServerInfo>;

    /// URI of `ssid` for the given transport, `None` if not configured
    fn server_uri(&self, ssid: Ssid, conn_type: ConnectionType) -> Option<ServerUri>;

    /// Every configured server, Bootstrap Server included, ascending
    fn ssids(&self) -> Vec<Ssid>;

    /// Object tree snapshot for "needs Update" detection
    fn snapshot(&self) -> DmSnapshot;
}
