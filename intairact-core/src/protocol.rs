//! Discovery wire protocol: announcement payload, message types and version.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::capability::Capability;
use crate::device::{Device, DeviceId};

/// Current protocol version. Announcements with any other version are dropped.
pub const PROTOCOL_VERSION: u8 = 1;

/// What a node multicasts about itself: who it is, where it listens, what it supports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub protocol_version: u8,
    pub device_id: DeviceId,
    pub listen_port: u16,
    pub capabilities: Vec<Capability>,
}

impl Announcement {
    pub fn new(
        device_id: DeviceId,
        listen_port: u16,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            device_id,
            listen_port,
            capabilities: capabilities.into_iter().collect(),
        }
    }

    /// Check the announcement and build the device it describes, reachable at `host`.
    pub fn to_device(&self, host: IpAddr) -> Result<Device, AnnouncementError> {
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(AnnouncementError::UnsupportedVersion(self.protocol_version));
        }
        if self.device_id.is_empty() {
            return Err(AnnouncementError::EmptyIdentity);
        }
        if self.listen_port == 0 {
            return Err(AnnouncementError::InvalidPort(self.device_id.clone()));
        }
        Ok(Device::new(
            self.device_id.clone(),
            SocketAddr::new(host, self.listen_port),
            self.capabilities.iter().cloned(),
        ))
    }
}

/// All discovery datagrams, one message per datagram (see the wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Periodic presence beacon.
    Announce(Announcement),
    /// Graceful leave, sent once when a node stops.
    Goodbye { device_id: DeviceId },
}

/// Malformed peer announcement. Dropped and logged; never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnnouncementError {
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("announcement without device identity")]
    EmptyIdentity,
    #[error("device {0} announced port 0")]
    InvalidPort(DeviceId),
}
