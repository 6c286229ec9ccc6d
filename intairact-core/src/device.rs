//! Devices: discovered peers (and the local node's own view of itself).

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::capability::Capability;

/// Opaque device identity. Announced in discovery; unique per running node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    /// Random identity for a node that was not given a name.
    pub fn generate() -> Self {
        DeviceId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        DeviceId::new(id)
    }
}

/// A discovered device: identity, reachable address, advertised capabilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    id: DeviceId,
    addr: SocketAddr,
    capabilities: BTreeSet<Capability>,
    own_device: bool,
}

impl Device {
    pub fn new(
        id: DeviceId,
        addr: SocketAddr,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        Self {
            id,
            addr,
            capabilities: capabilities.into_iter().collect(),
            own_device: false,
        }
    }

    pub(crate) fn into_own(mut self) -> Self {
        self.own_device = true;
        self
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    pub fn has_capability(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }

    /// True for the local node's own entry.
    pub fn is_own_device(&self) -> bool {
        self.own_device
    }

    /// Base URL for HTTP requests to this device, e.g. `http://10.0.0.4:51234`.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}
