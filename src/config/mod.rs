//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables
//!
//! # Example
//!
//! ```toml
//! endpoint_name = "urn:dev:os:0023C7-000001"
//!
//! [udp]
//! static_port_preference = 56830
//!
//! [retry]
//! initial_delay_ms = 1000
//! max_delay_ms = 120000
//!
//! [[servers]]
//! ssid = 1
//! lifetime = 86400
//! binding = "UQ"
//! notification_storing = false
//!
//! [[security]]
//! ssid = 1
//! server_uri = "coap://leshan.example.com:5683"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dm::{ObjectEntry, SecurityInstance, ServerInstance};
use crate::error::{Lwm2mError, Result};
use crate::protocol::{CoapTxParams, ConnectionType, LWM2M_VERSION};
use crate::sched::RetryPolicy;
use crate::transport::AddressFamily;

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Client endpoint name sent in Register
    #[serde(default = "default_endpoint_name")]
    pub endpoint_name: String,

    /// LwM2M version sent in Register
    #[serde(default = "default_lwm2m_version")]
    pub lwm2m_version: String,

    /// Own MSISDN, sent in Register for SMS bindings
    #[serde(default)]
    pub sms_msisdn: Option<String>,

    /// UDP socket configuration
    #[serde(default)]
    pub udp: UdpConfig,

    /// CoAP transmission parameters for UDP
    #[serde(default)]
    pub udp_tx_params: CoapTxParams,

    /// CoAP transmission parameters for SMS
    #[serde(default)]
    pub sms_tx_params: CoapTxParams,

    /// Scheduler backoff
    #[serde(default)]
    pub retry: RetryConfig,

    /// Server object instances
    #[serde(default)]
    pub servers: Vec<ServerInstance>,

    /// Security object instances
    #[serde(default)]
    pub security: Vec<SecurityInstance>,

    /// Additional objects advertised in Register
    #[serde(default)]
    pub objects: Vec<ObjectEntry>,
}

fn default_endpoint_name() -> String {
    "lwm2m-client".to_string()
}

fn default_lwm2m_version() -> String {
    LWM2M_VERSION.to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint_name: default_endpoint_name(),
            lwm2m_version: default_lwm2m_version(),
            sms_msisdn: None,
            udp: UdpConfig::default(),
            udp_tx_params: CoapTxParams::default(),
            sms_tx_params: CoapTxParams::default(),
            retry: RetryConfig::default(),
            servers: Vec::new(),
            security: Vec::new(),
            objects: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Lwm2mError::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Lwm2mError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("LWM2M_ENDPOINT_NAME") {
            config.endpoint_name = name;
        }
        if let Ok(port) = std::env::var("LWM2M_UDP_PORT") {
            if let Ok(port) = port.parse() {
                config.udp.static_port_preference = Some(port);
            }
        }
        if let Ok(msisdn) = std::env::var("LWM2M_MSISDN") {
            config.sms_msisdn = Some(msisdn);
        }

        config
    }

    /// Reject settings the registration core cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.endpoint_name.is_empty() {
            return Err(Lwm2mError::Config("endpoint_name must not be empty".to_string()));
        }
        if self.retry.initial_delay_ms == 0 {
            return Err(Lwm2mError::Config("retry.initial_delay_ms must be positive".to_string()));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(Lwm2mError::Config(format!(
                "retry.max_delay_ms ({}) is below retry.initial_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.initial_delay_ms
            )));
        }
        self.udp_tx_params.validate()?;
        self.sms_tx_params.validate()?;
        Ok(())
    }

    /// Transmission parameters of `conn_type`
    pub fn tx_params(&self, conn_type: ConnectionType) -> &CoapTxParams {
        match conn_type {
            ConnectionType::Udp => &self.udp_tx_params,
            ConnectionType::Sms => &self.sms_tx_params,
        }
    }
}

/// UDP socket configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Local port to always bind to; a bind failure is then an error
    pub static_port_preference: Option<u16>,

    /// Address family for binding and name resolution
    pub address_family: AddressFamily,
}

/// Scheduler backoff configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// First retry delay in milliseconds
    pub initial_delay_ms: u64,

    /// Maximum retry delay in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 120_000,
        }
    }
}

impl RetryConfig {
    /// Scheduler policy for these settings
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial: Duration::from_millis(self.initial_delay_ms),
            max: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.lwm2m_version, "1.0");
        assert_eq!(config.udp.address_family, AddressFamily::Ipv4);
        assert_eq!(config.retry.policy().initial, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            endpoint_name = "urn:dev:42"
            sms_msisdn = "+48123456789"

            [udp]
            static_port_preference = 56830
            address_family = "ipv6"

            [udp_tx_params]
            ack_timeout_ms = 1000

            [retry]
            initial_delay_ms = 500
            max_delay_ms = 4000

            [[servers]]
            ssid = 1
            lifetime = 60
            binding = "UQ"
            notification_storing = true

            [[security]]
            ssid = 1
            server_uri = "coap://127.0.0.1:5683"

            [[security]]
            bootstrap = true
            server_uri = "coap://127.0.0.1:5693"

            [[objects]]
            oid = 3
            instances = [0]
        "#;

        let config = ClientConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.endpoint_name, "urn:dev:42");
        assert_eq!(config.udp.static_port_preference, Some(56830));
        assert_eq!(config.udp.address_family, AddressFamily::Ipv6);
        assert_eq!(config.udp_tx_params.ack_timeout_ms, 1000);
        assert_eq!(config.udp_tx_params.max_retransmit, 4);
        assert_eq!(config.retry.policy().max, Duration::from_secs(4));
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].binding.as_deref(), Some("UQ"));
        assert_eq!(config.security.len(), 2);
        assert!(config.security[1].bootstrap);
        assert_eq!(config.objects[0].oid, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "endpoint_name = \"from-file\"").unwrap();
        writeln!(file, "[retry]").unwrap();
        writeln!(file, "initial_delay_ms = 250").unwrap();

        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.endpoint_name, "from-file");
        assert_eq!(config.retry.initial_delay_ms, 250);
        assert_eq!(config.retry.max_delay_ms, 120_000);
    }

    #[test]
    fn test_config_errors() {
        assert!(matches!(
            ClientConfig::from_file("/nonexistent/lwm2m.toml"),
            Err(Lwm2mError::Config(_))
        ));
        assert!(ClientConfig::from_toml_str("udp = 5").is_err());

        let mut config = ClientConfig::default();
        config.retry.max_delay_ms = 10;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.endpoint_name.clear();
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.sms_tx_params.ack_random_factor = 0.9;
        assert!(config.validate().is_err());
    }
}
