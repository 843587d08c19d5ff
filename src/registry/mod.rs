//! Active device registry.
//!
//! Process-wide record of which physical devices are currently assigned to
//! which guest. This is the single source of truth for exclusivity: a
//! device address appears at most once, and while present its owner is the
//! guest holding it. One mutex guards the whole table; kernel I/O never
//! happens under it.

use crate::error::{HostdevError, Result};
use crate::types::address::DeviceAddress;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// One physical device in active use (or mid-acquisition).
///
/// Handles move into the registry on commit and move back out on release;
/// only the registry lock-holder mutates `owner`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveDevice {
    pub address: DeviceAddress,
    /// True if the daemon unbinds/rebinds the host driver for this device.
    pub managed: bool,
    /// Guest currently holding the device; empty only during the brief
    /// rollback window.
    pub owner: Option<String>,
}

impl ActiveDevice {
    pub fn new(address: DeviceAddress, managed: bool) -> Self {
        Self { address, managed, owner: None }
    }
}

/// Result of trying to take a device out of the registry for one guest.
#[derive(Debug)]
pub enum RemoveOutcome {
    /// The device was owned by the releasing guest and has been removed.
    Removed(ActiveDevice),
    /// The device is owned by a different guest; left untouched.
    ForeignOwner(String),
    /// The device was not in the registry.
    NotRegistered,
}

/// Lock-guarded table of devices assigned to running guests.
#[derive(Debug, Default)]
pub struct ActiveRegistry {
    devices: Mutex<HashMap<DeviceAddress, ActiveDevice>>,
}

impl ActiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Owner of a device, if it is registered and held.
    pub fn owner_of(&self, address: &DeviceAddress) -> Option<String> {
        let devices = self.devices.lock().unwrap();
        devices.get(address).and_then(|d| d.owner.clone())
    }

    /// Insert a free device, failing if the address is already held.
    ///
    /// Used by the daemon's state loader when rebuilding the registry from
    /// recorded guest device lists at startup.
    pub fn try_insert(&self, device: ActiveDevice) -> Result<()> {
        let mut devices = self.devices.lock().unwrap();
        if let Some(existing) = devices.get(&device.address) {
            if let Some(owner) = &existing.owner {
                return Err(HostdevError::DeviceInUse {
                    address: device.address,
                    owner: owner.clone(),
                });
            }
        }
        devices.insert(device.address, device);
        metrics::gauge!("hostdev.active.count").set(devices.len() as f64);
        Ok(())
    }

    /// Atomically record every device as owned by `guest`.
    ///
    /// Re-checks ownership under the lock: acquisition validates before
    /// detaching, but another guest's commit can interleave while the
    /// detach/reset sequence runs unlocked. A conflict here leaves the
    /// registry exactly as it was.
    pub fn commit_owned(&self, acquired: Vec<ActiveDevice>, guest: &str) -> Result<()> {
        let mut devices = self.devices.lock().unwrap();
        for device in &acquired {
            if let Some(existing) = devices.get(&device.address) {
                if let Some(owner) = &existing.owner {
                    if owner != guest {
                        warn!(
                            address = %device.address,
                            owner = %owner,
                            "device was claimed while acquisition was in flight"
                        );
                        return Err(HostdevError::DeviceInUse {
                            address: device.address,
                            owner: owner.clone(),
                        });
                    }
                }
            }
        }
        for mut device in acquired {
            device.owner = Some(guest.to_string());
            debug!(address = %device.address, guest = %guest, "registered active device");
            // Replaces any stale free entry left by a state reload.
            devices.insert(device.address, device);
        }
        metrics::gauge!("hostdev.active.count").set(devices.len() as f64);
        Ok(())
    }

    /// Remove a device if (and only if) `guest` owns it.
    pub fn remove_if_owned_by(&self, address: &DeviceAddress, guest: &str) -> RemoveOutcome {
        let mut devices = self.devices.lock().unwrap();
        match devices.get(address) {
            None => RemoveOutcome::NotRegistered,
            Some(existing) => match &existing.owner {
                Some(owner) if owner != guest => RemoveOutcome::ForeignOwner(owner.clone()),
                _ => match devices.remove(address) {
                    Some(removed) => {
                        metrics::gauge!("hostdev.active.count").set(devices.len() as f64);
                        debug!(address = %address, guest = %guest, "removed active device");
                        RemoveOutcome::Removed(removed)
                    }
                    None => RemoveOutcome::NotRegistered,
                },
            },
        }
    }

    /// Remove every device owned by `guest`, returning the removed handles.
    ///
    /// Teardown safety net: a USB device that was unplugged or moved to a
    /// different slot while the guest ran can no longer be matched from its
    /// descriptor, but its entry still names the stopped guest and must not
    /// survive to conflict with a future acquisition.
    pub fn remove_all_owned_by(&self, guest: &str) -> Vec<ActiveDevice> {
        let mut devices = self.devices.lock().unwrap();
        let addresses: Vec<DeviceAddress> = devices
            .values()
            .filter(|d| d.owner.as_deref() == Some(guest))
            .map(|d| d.address)
            .collect();
        let removed: Vec<ActiveDevice> =
            addresses.iter().filter_map(|addr| devices.remove(addr)).collect();
        if !removed.is_empty() {
            metrics::gauge!("hostdev.active.count").set(devices.len() as f64);
            debug!(guest = %guest, devices = removed.len(), "removed remaining devices by owner");
        }
        removed
    }

    /// Snapshot of the active table, for the daemon's status surface.
    pub fn snapshot(&self) -> Vec<ActiveDevice> {
        let devices = self.devices.lock().unwrap();
        devices.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
