//! Server object (`/1`) instances, validation and transactions.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ServerInfo, SERVER_OID};
use crate::error::{Lwm2mError, Result};
use crate::protocol::{binding_mode_valid, BindingMode, Ssid};

/// One Server object instance as written by a configuration source.
///
/// Mandatory resources are optional here so that incomplete instances can
/// be represented and rejected by [`ServerInstance::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInstance {
    /// Instance ID, assigned on insert when absent
    pub iid: Option<u16>,
    /// Short Server ID
    pub ssid: Option<u16>,
    /// Lifetime in seconds
    pub lifetime: Option<i64>,
    /// Default Minimum Period in seconds
    pub default_min_period: Option<u32>,
    /// Default Maximum Period in seconds
    pub default_max_period: Option<i64>,
    /// Disable Timeout in seconds
    pub disable_timeout: Option<u64>,
    /// Notification Storing When Disabled or Offline
    pub notification_storing: Option<bool>,
    /// Binding
    pub binding: Option<String>,
}

impl ServerInstance {
    /// Instance with every mandatory resource set
    pub fn new(ssid: u16, lifetime: i64, binding: &str) -> Self {
        Self {
            ssid: Some(ssid),
            lifetime: Some(lifetime),
            binding: Some(binding.to_string()),
            notification_storing: Some(false),
            ..Self::default()
        }
    }

    fn path(&self) -> String {
        match self.iid {
            Some(iid) => format!("/{SERVER_OID}/{iid}"),
            None => format!("/{SERVER_OID}/?"),
        }
    }

    fn invalid(&self, reason: impl std::fmt::Display) -> Lwm2mError {
        let message = format!("{}: {}", self.path(), reason);
        tracing::error!("{}", message);
        Lwm2mError::Validation(message)
    }

    /// Check mandatory resources and value ranges
    pub fn validate(&self) -> Result<()> {
        let ssid = self
            .ssid
            .ok_or_else(|| self.invalid("missing mandatory 'Short Server ID' resource value"))?;
        let binding = self
            .binding
            .as_deref()
            .ok_or_else(|| self.invalid("missing mandatory 'Binding' resource value"))?;
        let lifetime = self
            .lifetime
            .ok_or_else(|| self.invalid("missing mandatory 'Lifetime' resource value"))?;
        if self.notification_storing.is_none() {
            return Err(self.invalid(
                "missing mandatory 'Notification Storing when disabled or offline' resource value",
            ));
        }

        if ssid == 0 || ssid == Ssid::BOOTSTRAP.get() {
            return Err(self.invalid(format!("Short Server ID {ssid} is reserved")));
        }
        if lifetime <= 0 {
            return Err(self.invalid(format!("Lifetime value is non-positive: {lifetime}")));
        }
        if self.default_max_period == Some(0) {
            return Err(self.invalid("Default Max Period is 0"));
        }
        if !binding_mode_valid(binding) {
            return Err(self.invalid(format!("Incorrect binding mode {binding}")));
        }
        Ok(())
    }

    /// Validated view of the instance
    pub fn info(&self) -> Result<ServerInfo> {
        self.validate()?;
        let ssid = self
            .ssid
            .and_then(Ssid::new)
            .ok_or_else(|| self.invalid("missing Short Server ID"))?;
        let binding: BindingMode = self.binding.as_deref().unwrap_or_default().parse()?;
        Ok(ServerInfo {
            ssid,
            lifetime_s: self.lifetime.unwrap_or_default(),
            binding,
            notification_storing: self.notification_storing.unwrap_or_default(),
            default_min_period: self.default_min_period,
            default_max_period: self.default_max_period,
            disable_timeout: self.disable_timeout.map(Duration::from_secs),
        })
    }
}

/// The Server object instance set.
///
/// Writes go through a transaction: [`begin`](Self::begin) saves the
/// current instances, [`validate`](Self::validate) checks the whole set,
/// and [`commit`](Self::commit) or [`rollback`](Self::rollback) ends it.
#[derive(Debug, Clone, Default)]
pub struct ServerObject {
    instances: Vec<ServerInstance>,
    saved: Option<Vec<ServerInstance>>,
    modified: bool,
    saved_modified: bool,
}

impl ServerObject {
    /// Create from instances, rejecting an invalid set
    pub fn new(instances: Vec<ServerInstance>) -> Result<Self> {
        let mut object = Self::default();
        for instance in instances {
            object.insert(instance);
        }
        object.validate()?;
        object.modified = false;
        Ok(object)
    }

    /// Instances ordered by instance ID
    pub fn instances(&self) -> &[ServerInstance] {
        &self.instances
    }

    /// Instance with the given SSID
    pub fn get(&self, ssid: Ssid) -> Option<&ServerInstance> {
        self.instances.iter().find(|i| i.ssid == Some(ssid.get()))
    }

    /// Mutable instance with the given SSID
    pub fn get_mut(&mut self, ssid: Ssid) -> Option<&mut ServerInstance> {
        self.modified = true;
        self.instances.iter_mut().find(|i| i.ssid == Some(ssid.get()))
    }

    /// Insert an instance, assigning the lowest free instance ID if unset.
    /// Returns the instance ID.
    pub fn insert(&mut self, mut instance: ServerInstance) -> u16 {
        let iid = match instance.iid {
            Some(iid) => iid,
            None => (0..=u16::MAX)
                .find(|candidate| self.instances.iter().all(|i| i.iid != Some(*candidate)))
                .unwrap_or(u16::MAX),
        };
        instance.iid = Some(iid);
        self.instances.retain(|i| i.iid != Some(iid));
        let pos = self
            .instances
            .partition_point(|i| i.iid.unwrap_or_default() < iid);
        self.instances.insert(pos, instance);
        self.modified = true;
        iid
    }

    /// Remove the instance with the given SSID
    pub fn remove(&mut self, ssid: Ssid) -> Option<ServerInstance> {
        let pos = self.instances.iter().position(|i| i.ssid == Some(ssid.get()))?;
        self.modified = true;
        Some(self.instances.remove(pos))
    }

    /// Validate every instance and SSID uniqueness
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.instances.len());
        for instance in &self.instances {
            instance.validate()?;
            if let Some(ssid) = instance.ssid {
                if !seen.insert(ssid) {
                    return Err(instance.invalid(format!("duplicate Short Server ID {ssid}")));
                }
            }
        }
        Ok(())
    }

    /// Start a transaction
    pub fn begin(&mut self) -> Result<()> {
        if self.saved.is_some() {
            return Err(Lwm2mError::Internal(
                "Server object transaction already in progress".to_string(),
            ));
        }
        self.saved = Some(self.instances.clone());
        self.saved_modified = self.modified;
        Ok(())
    }

    /// Keep the current instances and end the transaction
    pub fn commit(&mut self) {
        self.saved = None;
    }

    /// Restore the instances saved by [`begin`](Self::begin)
    pub fn rollback(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.instances = saved;
            self.modified = self.saved_modified;
        }
    }

    /// Whether a transaction is open
    pub fn in_transaction(&self) -> bool {
        self.saved.is_some()
    }

    /// Whether instances changed since the last [`clear_modified`](Self::clear_modified)
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Mark the current state as persisted
    pub fn clear_modified(&mut self) {
        self.modified = false;
    }
}
