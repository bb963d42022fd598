//! In-memory [`DataModel`] implementation.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use super::{DataModel, DmSnapshot, ObjectEntry, ServerInfo, ServerObject, SERVER_OID};
use crate::config::ClientConfig;
use crate::error::{Lwm2mError, Result};
use crate::protocol::{ConnectionType, Ssid};
use crate::transport::{ServerUri, UriScheme};

/// One Security object instance: where and how to reach a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityInstance {
    /// Short Server ID; ignored for the Bootstrap Server
    #[serde(default)]
    pub ssid: Option<u16>,
    /// LwM2M Server URI (`coap://`, `coaps://` or `sms://`)
    pub server_uri: String,
    /// MSISDN of the server for the SMS transport
    #[serde(default)]
    pub sms_number: Option<String>,
    /// Whether this instance describes the Bootstrap Server
    #[serde(default)]
    pub bootstrap: bool,
}

impl SecurityInstance {
    /// Security instance of a regular server
    pub fn server(ssid: u16, server_uri: &str) -> Self {
        Self {
            ssid: Some(ssid),
            server_uri: server_uri.to_string(),
            sms_number: None,
            bootstrap: false,
        }
    }

    /// Security instance of the Bootstrap Server
    pub fn bootstrap(server_uri: &str) -> Self {
        Self {
            ssid: None,
            server_uri: server_uri.to_string(),
            sms_number: None,
            bootstrap: true,
        }
    }

    /// SSID this instance belongs to
    pub fn resolved_ssid(&self) -> Result<Ssid> {
        if self.bootstrap {
            return Ok(Ssid::BOOTSTRAP);
        }
        let raw = self.ssid.ok_or_else(|| {
            Lwm2mError::Validation(format!("{}: missing Short Server ID", self.server_uri))
        })?;
        Ssid::try_from(raw)
    }

    fn uri(&self, conn_type: ConnectionType) -> Option<ServerUri> {
        let primary = ServerUri::parse(&self.server_uri).ok()?;
        match (conn_type, primary.scheme) {
            (ConnectionType::Udp, UriScheme::Coap | UriScheme::Coaps) => Some(primary),
            (ConnectionType::Sms, UriScheme::Sms) => Some(primary),
            (ConnectionType::Sms, _) => self
                .sms_number
                .as_deref()
                .and_then(|number| ServerUri::parse(&format!("sms://{number}")).ok()),
            (ConnectionType::Udp, UriScheme::Sms) => None,
        }
    }

    fn validate(&self) -> Result<Ssid> {
        let ssid = self.resolved_ssid()?;
        ServerUri::parse(&self.server_uri)
            .map_err(|e| Lwm2mError::Validation(format!("SSID {ssid}: {e}")))?;
        Ok(ssid)
    }
}

#[derive(Debug, Default)]
struct Inner {
    servers: ServerObject,
    security: BTreeMap<Ssid, SecurityInstance>,
    objects: BTreeMap<u16, ObjectEntry>,
}

/// [`DataModel`] kept entirely in memory.
///
/// Mutations take effect immediately; the registration core observes
/// them on its next reload or Update attempt.
#[derive(Debug, Default)]
pub struct InMemoryDataModel {
    inner: RwLock<Inner>,
}

impl InMemoryDataModel {
    /// Create from a Server object and Security instances
    pub fn new(servers: ServerObject, security: Vec<SecurityInstance>) -> Result<Self> {
        let model = Self::default();
        {
            let mut inner = model.write();
            inner.servers = servers;
            for instance in security {
                let ssid = instance.validate()?;
                if inner.security.insert(ssid, instance).is_some() {
                    return Err(Lwm2mError::Validation(format!(
                        "duplicate Security instance for SSID {ssid}"
                    )));
                }
            }
        }
        Ok(model)
    }

    /// Build from the `servers`, `security` and `objects` sections of a config
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let servers = ServerObject::new(config.servers.clone())?;
        let model = Self::new(servers, config.security.clone())?;
        for entry in &config.objects {
            model.set_object(entry.clone());
        }
        Ok(model)
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Modify the Server object inside a transaction.
    ///
    /// The change is committed only if the resulting instance set
    /// validates; otherwise it is rolled back and the error returned.
    pub fn update_servers<R>(&self, f: impl FnOnce(&mut ServerObject) -> R) -> Result<R> {
        let mut inner = self.write();
        inner.servers.begin()?;
        let result = f(&mut inner.servers);
        match inner.servers.validate() {
            Ok(()) => {
                inner.servers.commit();
                Ok(result)
            },
            Err(e) => {
                inner.servers.rollback();
                Err(e)
            },
        }
    }

    /// Add or replace a Security instance
    pub fn set_security(&self, instance: SecurityInstance) -> Result<()> {
        let ssid = instance.validate()?;
        self.write().security.insert(ssid, instance);
        Ok(())
    }

    /// Remove the Security instance of `ssid`
    pub fn remove_security(&self, ssid: Ssid) -> Option<SecurityInstance> {
        self.write().security.remove(&ssid)
    }

    /// Add or replace an advertised object
    pub fn set_object(&self, entry: ObjectEntry) {
        self.write().objects.insert(entry.oid, entry);
    }

    /// Stop advertising an object
    pub fn remove_object(&self, oid: u16) {
        self.write().objects.remove(&oid);
    }
}

impl DataModel for InMemoryDataModel {
    fn server(&self, ssid: Ssid) -> Option<ServerInfo> {
        self.read().servers.get(ssid)?.info().ok()
    }

    fn server_uri(&self, ssid: Ssid, conn_type: ConnectionType) -> Option<ServerUri> {
        self.read().security.get(&ssid)?.uri(conn_type)
    }

    fn ssids(&self) -> Vec<Ssid> {
        self.read().security.keys().copied().collect()
    }

    fn snapshot(&self) -> DmSnapshot {
        let inner = self.read();
        let server_iids = inner
            .servers
            .instances()
            .iter()
            .filter_map(|i| i.iid)
            .collect();
        let mut objects = vec![ObjectEntry::new(SERVER_OID, server_iids)];
        objects.extend(
            inner
                .objects
                .values()
                .filter(|entry| entry.oid != SERVER_OID)
                .cloned(),
        );
        DmSnapshot::new(objects)
    }
}
