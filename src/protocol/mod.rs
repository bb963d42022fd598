//! LwM2M protocol primitives shared by the registration core.
//!
//! Defines the identifiers and small value types every other module speaks:
//! Short Server IDs, transports and their connection modes, Binding Mode
//! strings, CoAP transmission parameters, and the parameter sets carried by
//! Register and Update requests.
//!
//! # Binding Modes
//!
//! | Binding | UDP      | SMS      |
//! |---------|----------|----------|
//! | `U`     | Online   | Disabled |
//! | `UQ`    | Queue    | Disabled |
//! | `S`     | Disabled | Online   |
//! | `SQ`    | Disabled | Queue    |
//! | `US`    | Online   | Online   |
//! | `UQS`   | Queue    | Online   |
//!
//! # Usage
//!
//! ```rust,ignore
//! use lwm2m::protocol::{BindingMode, ConnectionMode, ConnectionType};
//!
//! let binding: BindingMode = "UQS".parse()?;
//! assert_eq!(binding.connection_mode(ConnectionType::Udp), ConnectionMode::Queue);
//! assert_eq!(binding.connection_mode(ConnectionType::Sms), ConnectionMode::Online);
//! ```

mod binding;
mod request;
mod tx;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use binding::{binding_mode_valid, connection_mode, BindingMode, VALID_BINDINGS};
pub use request::{EndpointPath, RegisterRequest, UpdateParameters, UpdateRequest};
pub use tx::CoapTxParams;

use crate::error::Lwm2mError;

/// LwM2M version advertised in Register requests by default
pub const LWM2M_VERSION: &str = "1.0";

/// Short Server ID.
///
/// Value `0` is reserved (it used to mean "any server") and cannot be
/// represented; use [`Target::All`] instead. `65535` identifies the
/// Bootstrap Server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Ssid(u16);

impl Ssid {
    /// SSID of the Bootstrap Server
    pub const BOOTSTRAP: Ssid = Ssid(u16::MAX);

    /// Create an SSID, `None` for the reserved value 0
    pub const fn new(value: u16) -> Option<Self> {
        if value == 0 {
            None
        } else {
            Some(Self(value))
        }
    }

    /// Raw numeric value
    pub const fn get(self) -> u16 {
        self.0
    }

    /// Whether this is the Bootstrap Server
    pub const fn is_bootstrap(self) -> bool {
        self.0 == u16::MAX
    }
}

impl TryFrom<u16> for Ssid {
    type Error = Lwm2mError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ssid::new(value).ok_or_else(|| Lwm2mError::Validation("SSID 0 is reserved".to_string()))
    }
}

impl From<Ssid> for u16 {
    fn from(ssid: Ssid) -> Self {
        ssid.0
    }
}

impl fmt::Display for Ssid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which servers an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Every active server
    All,
    /// One specific server
    Server(Ssid),
}

impl From<Ssid> for Target {
    fn from(ssid: Ssid) -> Self {
        Target::Server(ssid)
    }
}

/// Transport carrying LwM2M traffic to a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// CoAP over UDP
    Udp,
    /// CoAP over SMS
    Sms,
}

impl ConnectionType {
    /// All transports, in primary-connection preference order
    pub const ALL: [ConnectionType; 2] = [ConnectionType::Udp, ConnectionType::Sms];

    /// Designator letter used in Binding Mode strings
    pub const fn letter(self) -> char {
        match self {
            Self::Udp => 'U',
            Self::Sms => 'S',
        }
    }

    /// Stable index for per-transport storage
    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Udp => 0,
            Self::Sms => 1,
        }
    }

    /// Get descriptive name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Udp => "UDP",
            Self::Sms => "SMS",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How a transport is used by the current binding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Transport not used
    #[default]
    Disabled,
    /// Always reachable
    Online,
    /// Closed after an idle window, reopened on demand
    Queue,
}

/// Identifies one connection of one server, e.g. for notification flushing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// Server the connection belongs to
    pub ssid: Ssid,
    /// Transport, `None` when no primary transport is selected
    pub conn_type: Option<ConnectionType>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssid_zero_is_reserved() {
        assert!(Ssid::new(0).is_none());
        assert!(Ssid::try_from(0u16).is_err());
        assert_eq!(Ssid::new(1).unwrap().get(), 1);
    }

    #[test]
    fn test_ssid_bootstrap() {
        assert!(Ssid::BOOTSTRAP.is_bootstrap());
        assert!(Ssid::new(u16::MAX).unwrap().is_bootstrap());
        assert!(!Ssid::new(14).unwrap().is_bootstrap());
    }

    #[test]
    fn test_ssid_serde() {
        let ssid: Ssid = serde_json::from_str("42").unwrap();
        assert_eq!(ssid.get(), 42);
        assert!(serde_json::from_str::<Ssid>("0").is_err());
        assert_eq!(serde_json::to_string(&ssid).unwrap(), "42");
    }

    #[test]
    fn test_connection_type_letters() {
        assert_eq!(ConnectionType::Udp.letter(), 'U');
        assert_eq!(ConnectionType::Sms.letter(), 'S');
        assert_eq!(ConnectionType::Sms.to_string(), "SMS");
    }
}
