//! Binding Mode strings and their per-transport connection modes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{ConnectionMode, ConnectionType};
use crate::error::{Lwm2mError, Result};

/// Every Binding Mode string this client accepts
pub const VALID_BINDINGS: [&str; 6] = ["U", "UQ", "S", "SQ", "US", "UQS"];

/// Check whether `binding` is one of [`VALID_BINDINGS`]
pub fn binding_mode_valid(binding: &str) -> bool {
    VALID_BINDINGS.contains(&binding)
}

/// Derive the connection mode of `conn_type` from a Binding Mode string.
///
/// The transport's designator letter followed by `Q` means Queue, the
/// letter alone means Online, and a missing letter means Disabled.
pub fn connection_mode(binding: &str, conn_type: ConnectionType) -> ConnectionMode {
    match binding.find(conn_type.letter()) {
        None => ConnectionMode::Disabled,
        Some(idx) => {
            if binding[idx + 1..].starts_with('Q') {
                ConnectionMode::Queue
            } else {
                ConnectionMode::Online
            }
        },
    }
}

/// A valid Binding Mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BindingMode {
    /// UDP
    U,
    /// UDP with queue mode
    UQ,
    /// SMS
    S,
    /// SMS with queue mode
    SQ,
    /// UDP and SMS
    US,
    /// UDP with queue mode and SMS
    UQS,
}

impl BindingMode {
    /// All valid binding modes
    pub const ALL: [BindingMode; 6] = [
        BindingMode::U,
        BindingMode::UQ,
        BindingMode::S,
        BindingMode::SQ,
        BindingMode::US,
        BindingMode::UQS,
    ];

    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::U => "U",
            Self::UQ => "UQ",
            Self::S => "S",
            Self::SQ => "SQ",
            Self::US => "US",
            Self::UQS => "UQS",
        }
    }

    /// Connection mode this binding implies for `conn_type`
    pub fn connection_mode(&self, conn_type: ConnectionType) -> ConnectionMode {
        connection_mode(self.as_str(), conn_type)
    }

    /// Whether `conn_type` is used at all
    pub fn uses(&self, conn_type: ConnectionType) -> bool {
        self.connection_mode(conn_type) != ConnectionMode::Disabled
    }

    /// Rebuild the binding string from per-transport modes.
    ///
    /// Fails when the combination is not one of the valid bindings, e.g.
    /// both transports disabled or SMS in queue mode next to UDP.
    pub fn from_connection_modes(udp: ConnectionMode, sms: ConnectionMode) -> Result<Self> {
        let mut binding = String::with_capacity(3);
        match udp {
            ConnectionMode::Online => binding.push('U'),
            ConnectionMode::Queue => binding.push_str("UQ"),
            ConnectionMode::Disabled => {},
        }
        match sms {
            ConnectionMode::Online => binding.push('S'),
            ConnectionMode::Queue => binding.push_str("SQ"),
            ConnectionMode::Disabled => {},
        }
        binding.parse()
    }
}

impl FromStr for BindingMode {
    type Err = Lwm2mError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "U" => Ok(Self::U),
            "UQ" => Ok(Self::UQ),
            "S" => Ok(Self::S),
            "SQ" => Ok(Self::SQ),
            "US" => Ok(Self::US),
            "UQS" => Ok(Self::UQS),
            _ => Err(Lwm2mError::InvalidBinding(s.to_string())),
        }
    }
}

impl TryFrom<String> for BindingMode {
    type Error = Lwm2mError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BindingMode> for String {
    fn from(binding: BindingMode) -> Self {
        binding.as_str().to_string()
    }
}

impl fmt::Display for BindingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_mode_scan() {
        assert_eq!(connection_mode("U", ConnectionType::Udp), ConnectionMode::Online);
        assert_eq!(connection_mode("UQ", ConnectionType::Udp), ConnectionMode::Queue);
        assert_eq!(connection_mode("UQ", ConnectionType::Sms), ConnectionMode::Disabled);
        assert_eq!(connection_mode("US", ConnectionType::Udp), ConnectionMode::Online);
        assert_eq!(connection_mode("US", ConnectionType::Sms), ConnectionMode::Online);
        assert_eq!(connection_mode("UQS", ConnectionType::Udp), ConnectionMode::Queue);
        assert_eq!(connection_mode("UQS", ConnectionType::Sms), ConnectionMode::Online);
        assert_eq!(connection_mode("SQ", ConnectionType::Sms), ConnectionMode::Queue);
        assert_eq!(connection_mode("", ConnectionType::Udp), ConnectionMode::Disabled);
    }

    #[test]
    fn test_binding_round_trip() {
        for binding in BindingMode::ALL {
            let udp = connection_mode(binding.as_str(), ConnectionType::Udp);
            let sms = connection_mode(binding.as_str(), ConnectionType::Sms);
            assert_eq!(BindingMode::from_connection_modes(udp, sms).unwrap(), binding);
        }
    }

    #[test]
    fn test_invalid_mode_combinations() {
        assert!(BindingMode::from_connection_modes(
            ConnectionMode::Disabled,
            ConnectionMode::Disabled
        )
        .is_err());
        // "UQSQ" is not a valid binding
        assert!(
            BindingMode::from_connection_modes(ConnectionMode::Queue, ConnectionMode::Queue)
                .is_err()
        );
        // "USQ" neither
        assert!(
            BindingMode::from_connection_modes(ConnectionMode::Online, ConnectionMode::Queue)
                .is_err()
        );
    }

    #[test]
    fn test_binding_parse() {
        assert_eq!("UQS".parse::<BindingMode>().unwrap(), BindingMode::UQS);
        assert!("T".parse::<BindingMode>().is_err());
        assert!("uq".parse::<BindingMode>().is_err());
        assert!(binding_mode_valid("SQ"));
        assert!(!binding_mode_valid("QU"));
    }

    #[test]
    fn test_binding_serde() {
        let binding: BindingMode = serde_json::from_str("\"UQ\"").unwrap();
        assert_eq!(binding, BindingMode::UQ);
        assert!(serde_json::from_str::<BindingMode>("\"X\"").is_err());
    }
}
