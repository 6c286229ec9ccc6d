//! Live device set fed by discovery events, with found/lost subscriptions.
//!
//! Handlers run after the registry locks are released, so a handler may query the
//! registry. A panicking handler is logged and does not stop event processing.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::capability::Capability;
use crate::device::{Device, DeviceId};
use crate::protocol::{Announcement, AnnouncementError};

/// Called with the device and whether it is the local node's own device.
pub type DeviceFoundHandler = Arc<dyn Fn(&Device, bool) + Send + Sync>;
pub type DeviceLostHandler = Arc<dyn Fn(&Device) + Send + Sync>;

/// Returned by the `add_handler_*` methods; pass to `remove_observer` to detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(u64);

/// Registry generation, advanced by `clear`. Event sources that may lag behind a
/// `clear` tag their events with the generation they started in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation(u64);

#[derive(Default)]
struct Devices {
    peers: HashMap<DeviceId, Device>,
    own: Option<Device>,
    generation: u64,
}

#[derive(Default)]
struct Subscribers {
    found: BTreeMap<SubscriptionToken, DeviceFoundHandler>,
    lost: BTreeMap<SubscriptionToken, DeviceLostHandler>,
}

/// Registry of discovered devices. `own_id` is the identity this node announces.
pub struct DeviceRegistry {
    own_id: DeviceId,
    devices: RwLock<Devices>,
    subscribers: RwLock<Subscribers>,
    next_token: AtomicU64,
}

impl DeviceRegistry {
    pub fn new(own_id: DeviceId) -> Self {
        Self {
            own_id,
            devices: RwLock::new(Devices::default()),
            subscribers: RwLock::new(Subscribers::default()),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn own_id(&self) -> &DeviceId {
        &self.own_id
    }

    /// Current generation. Events tagged with it are applied until the next `clear`.
    pub fn generation(&self) -> Generation {
        Generation(self.devices.read().unwrap_or_else(|e| e.into_inner()).generation)
    }

    /// Apply a found announcement. Malformed announcements are logged and dropped.
    /// Returns the stored device when accepted.
    pub fn on_device_found(&self, announcement: &Announcement, host: IpAddr) -> Option<Device> {
        self.found(None, announcement, host)
    }

    /// Like `on_device_found`, but dropped if the registry was cleared since `generation`.
    pub fn on_device_found_in(
        &self,
        generation: Generation,
        announcement: &Announcement,
        host: IpAddr,
    ) -> Option<Device> {
        self.found(Some(generation), announcement, host)
    }

    fn found(
        &self,
        generation: Option<Generation>,
        announcement: &Announcement,
        host: IpAddr,
    ) -> Option<Device> {
        match announcement.to_device(host) {
            Ok(device) => self.store(generation, device),
            Err(e) => {
                tracing::warn!(%host, error = %e, "dropping malformed announcement");
                None
            }
        }
    }

    /// Like `on_device_found` but returns the validation error instead of logging it.
    pub fn apply_found(
        &self,
        announcement: &Announcement,
        host: IpAddr,
    ) -> Result<Device, AnnouncementError> {
        let device = announcement.to_device(host)?;
        Ok(self.store(None, device.clone()).unwrap_or(device))
    }

    /// Insert or refresh a device. `None` when `generation` is stale.
    fn store(&self, generation: Option<Generation>, device: Device) -> Option<Device> {
        let own = device.id() == &self.own_id;
        let (device, changed) = {
            let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
            if generation.is_some_and(|g| g.0 != devices.generation) {
                tracing::debug!(device = %device.id(), "dropping found event from before clear");
                return None;
            }
            if own {
                let device = device.into_own();
                let changed = devices.own.as_ref() != Some(&device);
                devices.own = Some(device.clone());
                (device, changed)
            } else {
                let changed = devices.peers.get(device.id()) != Some(&device);
                devices.peers.insert(device.id().clone(), device.clone());
                (device, changed)
            }
        };
        if changed {
            tracing::info!(
                device = %device.id(),
                addr = %device.addr(),
                own,
                capabilities = device.capabilities().len(),
                "device found"
            );
            self.notify_found(&device, own);
        }
        Some(device)
    }

    /// Remove a device. Unknown identities are a no-op (duplicate loss events are normal).
    pub fn on_device_lost(&self, id: &DeviceId) -> Option<Device> {
        self.lost(None, id)
    }

    /// Like `on_device_lost`, but dropped if the registry was cleared since `generation`.
    pub fn on_device_lost_in(&self, generation: Generation, id: &DeviceId) -> Option<Device> {
        self.lost(Some(generation), id)
    }

    fn lost(&self, generation: Option<Generation>, id: &DeviceId) -> Option<Device> {
        let removed = {
            let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
            if generation.is_some_and(|g| g.0 != devices.generation) {
                return None;
            }
            if id == &self.own_id {
                devices.own.take()
            } else {
                devices.peers.remove(id)
            }
        };
        match &removed {
            Some(device) => {
                tracing::info!(device = %id, "device lost");
                self.notify_lost(device);
            }
            None => tracing::debug!(device = %id, "lost event for unknown device"),
        }
        removed
    }

    /// Drop every device and the own-device slot without notifying, and start a new
    /// generation. Used on stop.
    pub fn clear(&self) {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        devices.peers.clear();
        devices.own = None;
        devices.generation += 1;
    }

    /// Snapshot of peer devices (own device excluded), ordered by identity.
    pub fn devices(&self) -> Vec<Device> {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<Device> = devices.peers.values().cloned().collect();
        out.sort_by(|a, b| a.id().cmp(b.id()));
        out
    }

    /// Snapshot of peers advertising `capability`, taken at call time. Changes made
    /// after the call are not reflected in the returned list.
    pub fn devices_with_capability(&self, capability: &Capability) -> Vec<Device> {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<Device> = devices
            .peers
            .values()
            .filter(|d| d.has_capability(capability))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id().cmp(b.id()));
        out
    }

    pub fn device(&self, id: &DeviceId) -> Option<Device> {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        if id == &self.own_id {
            return devices.own.clone();
        }
        devices.peers.get(id).cloned()
    }

    /// This node as seen through discovery; `None` until its own announcement arrives.
    pub fn own_device(&self) -> Option<Device> {
        self.devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .own
            .clone()
    }

    pub fn len(&self) -> usize {
        self.devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .peers
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_handler_for_device_found<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(&Device, bool) + Send + Sync + 'static,
    {
        let token = self.token();
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .found
            .insert(token, Arc::new(handler));
        token
    }

    pub fn add_handler_for_device_lost<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(&Device) + Send + Sync + 'static,
    {
        let token = self.token();
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .lost
            .insert(token, Arc::new(handler));
        token
    }

    /// Detach a found or lost handler. Returns false for an unknown token.
    pub fn remove_observer(&self, token: SubscriptionToken) -> bool {
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subs.found.remove(&token).is_some() || subs.lost.remove(&token).is_some()
    }

    fn token(&self) -> SubscriptionToken {
        SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    fn notify_found(&self, device: &Device, own: bool) {
        let handlers: Vec<DeviceFoundHandler> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .found
            .values()
            .cloned()
            .collect();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(device, own))).is_err() {
                tracing::error!(device = %device.id(), "device found handler panicked");
            }
        }
    }

    fn notify_lost(&self, device: &Device) {
        let handlers: Vec<DeviceLostHandler> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .lost
            .values()
            .cloned()
            .collect();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(device))).is_err() {
                tracing::error!(device = %device.id(), "device lost handler panicked");
            }
        }
    }
}
