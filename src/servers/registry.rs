//! Ordered collection of server entries.

use std::ops::ControlFlow;

use crate::error::{Lwm2mError, Result};
use crate::protocol::{ConnectionType, Ssid};
use crate::transport::SocketId;

use super::entry::{ActiveServer, ServerEntry};

/// Server entries sorted by SSID, one per SSID
#[derive(Debug, Default)]
pub(crate) struct ServerRegistry {
    entries: Vec<ServerEntry>,
}

impl ServerRegistry {
    fn position(&self, ssid: Ssid) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by_key(&ssid, ServerEntry::ssid)
    }

    /// Insert a new entry; an entry with the same SSID is a validation error
    pub(crate) fn insert(&mut self, entry: ServerEntry) -> Result<()> {
        match self.position(entry.ssid()) {
            Ok(_) => Err(Lwm2mError::Validation(format!(
                "duplicate server entry for SSID {}",
                entry.ssid()
            ))),
            Err(pos) => {
                self.entries.insert(pos, entry);
                Ok(())
            },
        }
    }

    pub(crate) fn remove(&mut self, ssid: Ssid) -> Option<ServerEntry> {
        let pos = self.position(ssid).ok()?;
        Some(self.entries.remove(pos))
    }

    pub(crate) fn get(&self, ssid: Ssid) -> Option<&ServerEntry> {
        let pos = self.position(ssid).ok()?;
        self.entries.get(pos)
    }

    pub(crate) fn get_mut(&mut self, ssid: Ssid) -> Option<&mut ServerEntry> {
        let pos = self.position(ssid).ok()?;
        self.entries.get_mut(pos)
    }

    pub(crate) fn find_active(&self, ssid: Ssid) -> Option<&ActiveServer> {
        self.get(ssid)?.active.as_ref()
    }

    pub(crate) fn find_active_mut(&mut self, ssid: Ssid) -> Option<&mut ActiveServer> {
        self.get_mut(ssid)?.active.as_mut()
    }

    /// Visit active entries in SSID order until `f` breaks
    pub(crate) fn for_each_active<B>(
        &self,
        mut f: impl FnMut(Ssid, &ActiveServer) -> ControlFlow<B>,
    ) -> Option<B> {
        for entry in &self.entries {
            if let Some(active) = &entry.active {
                if let ControlFlow::Break(value) = f(entry.ssid(), active) {
                    return Some(value);
                }
            }
        }
        None
    }

    /// Active server whose `conn_type` connection is online on `socket`
    pub(crate) fn find_by_socket(&self, conn_type: ConnectionType, socket: SocketId) -> Option<Ssid> {
        self.for_each_active(|ssid, active| {
            if active.connection(conn_type).online_socket_id() == Some(socket) {
                ControlFlow::Break(ssid)
            } else {
                ControlFlow::Continue(())
            }
        })
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &ServerEntry> {
        self.entries.iter()
    }

    pub(crate) fn ssids(&self) -> Vec<Ssid> {
        self.entries.iter().map(ServerEntry::ssid).collect()
    }

    pub(crate) fn active_ssids(&self) -> Vec<Ssid> {
        self.entries
            .iter()
            .filter(|entry| entry.is_active())
            .map(ServerEntry::ssid)
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn drain(&mut self) -> std::vec::Drain<'_, ServerEntry> {
        self.entries.drain(..)
    }
}
