//! Acquisition and release protocols for host-device passthrough.
//!
//! `prepare` moves a guest's requested devices from free to owned:
//! validate, detach, reset, commit, in that order. Nothing is reset until
//! every device is detached, because resetting a PCI function can affect
//! sibling functions on the same slot; partial resets must never be
//! visible. Every mutation before the commit is recorded on an undo stack
//! and reversed on failure, so a failed `prepare` leaves registry and
//! driver state exactly as it found them.
//!
//! `reattach` is the inverse and never fails hard: the guest is already
//! gone, so hardware cleanup problems are logged for the operator instead
//! of surfaced.

use crate::config::PassthroughConfig;
use crate::error::{HostdevError, Result};
use crate::registry::{ActiveDevice, ActiveRegistry, RemoveOutcome};
use crate::sysfs::HostDeviceOps;
use crate::types::address::{DeviceAddress, PciAddress, UsbAddress, UsbId};
use crate::types::hostdev::{HostdevDescriptor, HostdevMode, HostdevSource};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// One device a guest asked for, before USB resolution.
#[derive(Debug, Clone)]
pub struct RequestedDevice {
    pub source: RequestedSource,
    pub managed: bool,
}

/// Identity as specified in the guest definition. Vendor/product USB
/// identities are resolved to a bus/device slot at acquisition time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedSource {
    Pci(PciAddress),
    UsbAddress(UsbAddress),
    UsbId(UsbId),
}

/// Build the ordered requested set from a guest's host-device descriptors.
///
/// Capability-mode descriptors and subsystems this daemon does not assign
/// are skipped. No kernel I/O happens here; the function is side-effect
/// free so it can be re-run for validation.
pub fn build_request(guest: &str, descriptors: &[HostdevDescriptor]) -> Result<Vec<RequestedDevice>> {
    let mut requested = Vec::new();
    let mut seen_addresses = HashSet::new();
    let mut seen_usb_ids = HashSet::new();

    for descriptor in descriptors {
        if descriptor.mode != HostdevMode::Subsystem {
            debug!(guest = %guest, "skipping capability-mode host device");
            continue;
        }
        let source = match &descriptor.source {
            HostdevSource::Pci { address } => RequestedSource::Pci(*address),
            HostdevSource::Usb { address: Some(address), .. } => {
                RequestedSource::UsbAddress(*address)
            }
            HostdevSource::Usb { id: Some(id), address: None } => RequestedSource::UsbId(*id),
            HostdevSource::Usb { id: None, address: None } => {
                return Err(HostdevError::MissingAddress)
            }
            HostdevSource::Other => {
                debug!(guest = %guest, "skipping host device with unassignable subsystem");
                continue;
            }
        };
        let duplicate = match source {
            RequestedSource::Pci(addr) => !seen_addresses.insert(DeviceAddress::Pci(addr)),
            RequestedSource::UsbAddress(addr) => !seen_addresses.insert(DeviceAddress::Usb(addr)),
            RequestedSource::UsbId(id) => !seen_usb_ids.insert(id),
        };
        if duplicate {
            return Err(HostdevError::DuplicateDevice {
                device: match source {
                    RequestedSource::Pci(a) => a.to_string(),
                    RequestedSource::UsbAddress(a) => a.to_string(),
                    RequestedSource::UsbId(id) => id.to_string(),
                },
                guest: guest.to_string(),
            });
        }
        requested.push(RequestedDevice { source, managed: descriptor.managed });
    }
    Ok(requested)
}

/// A completed sub-step of the acquisition sequence, pushed as each device
/// is mutated so the rollback scope is the stack contents and nothing else.
#[derive(Debug)]
enum RollbackStep {
    Reattach(DeviceAddress),
}

/// Coordinates the host-wide pool of passthrough devices.
///
/// One instance lives for the daemon process; guest start/stop transitions
/// call into it from their own threads. The registry mutex covers only
/// ownership bookkeeping, never kernel I/O.
pub struct PassthroughManager {
    ops: Arc<dyn HostDeviceOps>,
    registry: ActiveRegistry,
    config: PassthroughConfig,
}

impl PassthroughManager {
    pub fn new(ops: Arc<dyn HostDeviceOps>, config: PassthroughConfig) -> Self {
        Self { ops, registry: ActiveRegistry::new(), config }
    }

    /// The active registry, for the daemon's state loader and status surface.
    pub fn registry(&self) -> &ActiveRegistry {
        &self.registry
    }

    /// Snapshot of every device currently assigned to a guest.
    pub fn active_devices(&self) -> Vec<ActiveDevice> {
        self.registry.snapshot()
    }

    /// Acquire every host device a guest asked for, all-or-nothing.
    ///
    /// On error the registry and every device's driver binding are as they
    /// were before the call; retrying is safe.
    #[instrument(skip(self, descriptors), fields(guest = %guest, descriptors = descriptors.len()))]
    pub fn prepare(&self, guest: &str, descriptors: &[HostdevDescriptor]) -> Result<()> {
        let requested = build_request(guest, descriptors)?;
        if requested.is_empty() {
            debug!("no assignable host devices requested");
            return Ok(());
        }

        let devices = self.resolve(guest, requested)?;

        // Validate everything before touching any hardware.
        for device in &devices {
            if !self.ops.is_assignable(&device.address) {
                return Err(HostdevError::NotAssignable { address: device.address });
            }
            if let Some(owner) = self.registry.owner_of(&device.address) {
                info!(address = %device.address, owner = %owner, "device already in use");
                return Err(HostdevError::DeviceInUse { address: device.address, owner });
            }
        }

        // Detach all managed devices before any reset. Each success goes on
        // the undo stack; the first failure unwinds it.
        let mut undo = Vec::new();
        for device in &devices {
            if !device.managed {
                continue;
            }
            if let Err(e) = self.ops.detach(&device.address) {
                error!(address = %device.address, error = %e, "detach failed, rolling back");
                self.unwind(undo);
                return Err(HostdevError::DetachFailed {
                    address: device.address,
                    reason: e.to_string(),
                });
            }
            debug!(address = %device.address, "detached");
            undo.push(RollbackStep::Reattach(device.address));
        }

        // All devices are detached now, so a reset cannot disturb a sibling
        // function that is still bound to its host driver.
        for device in &devices {
            if let Err(e) = self.ops.reset(&device.address) {
                error!(address = %device.address, error = %e, "reset failed, rolling back");
                self.unwind(undo);
                return Err(HostdevError::ResetFailed {
                    address: device.address,
                    reason: e.to_string(),
                });
            }
            debug!(address = %device.address, "reset");
        }

        let count = devices.len();
        if let Err(e) = self.registry.commit_owned(devices, guest) {
            self.unwind(undo);
            return Err(e);
        }

        info!(devices = count, "host devices acquired");
        Ok(())
    }

    /// Release a guest's host devices and return them to the host.
    ///
    /// Never fails hard: guest teardown must not be blocked, so every
    /// failure is logged for operator remediation instead of surfaced.
    #[instrument(skip(self, descriptors), fields(guest = %guest, descriptors = descriptors.len()))]
    pub fn reattach(&self, guest: &str, descriptors: &[HostdevDescriptor]) {
        // Lenient collection: a descriptor that no longer resolves must not
        // block teardown of the rest. The owner sweep below still unmarks
        // whatever the descriptor pass could not reach.
        let requested = match build_request(guest, descriptors) {
            Ok(requested) => requested,
            Err(e) => {
                warn!(error = %e, "invalid host device list at teardown");
                Vec::new()
            }
        };

        // Unmark: take back every device this guest actually owns. Devices
        // recorded against a different guest are an administrator error and
        // are left alone.
        let mut released = Vec::new();
        for request in requested {
            let address = match request.source {
                RequestedSource::Pci(addr) => DeviceAddress::Pci(addr),
                RequestedSource::UsbAddress(addr) => DeviceAddress::Usb(addr),
                RequestedSource::UsbId(id) => match self.ops.find_usb_by_ids(id) {
                    Ok(Some(addr)) => DeviceAddress::Usb(addr),
                    Ok(None) => {
                        warn!(id = %id, "USB device no longer present, cannot release");
                        continue;
                    }
                    Err(e) => {
                        warn!(id = %id, error = %e, "USB lookup failed, cannot release");
                        continue;
                    }
                },
            };
            match self.registry.remove_if_owned_by(&address, guest) {
                RemoveOutcome::Removed(device) => released.push(device),
                RemoveOutcome::ForeignOwner(owner) => {
                    warn!(address = %address, owner = %owner, "device owned by another guest, not releasing");
                }
                RemoveOutcome::NotRegistered => {
                    debug!(address = %address, "device not in active registry");
                }
            }
        }

        // A USB device unplugged or re-enumerated while the guest ran no
        // longer matches its descriptor, but its entry still names this
        // guest. Sweep by owner so nothing stays registered to a stopped
        // guest.
        for device in self.registry.remove_all_owned_by(guest) {
            warn!(address = %device.address, "device not matched by teardown list, releasing by owner");
            released.push(device);
        }

        // Reset is best-effort from here on; the guest is already gone.
        for device in &released {
            if let Err(e) = self.ops.reset(&device.address) {
                warn!(address = %device.address, error = %e, "reset failed during release");
            }
        }

        for device in &released {
            if !device.managed {
                continue;
            }
            // The kernel can hold the device busy for a while after the
            // guest process exits; attaching a host driver before that
            // clears is worse than leaving the device detached.
            if !self.ops.wait_until_free(
                &device.address,
                self.config.wait_attempts,
                self.config.wait_interval(),
            ) {
                warn!(address = %device.address, "device still busy, leaving it detached");
                continue;
            }
            if let Err(e) = self.ops.reattach(&device.address) {
                warn!(address = %device.address, error = %e, "re-attach to host driver failed");
            }
        }

        info!(devices = released.len(), "host devices released");
    }

    /// Resolve USB vendor/product identities and produce the handles the
    /// protocol works on.
    fn resolve(&self, guest: &str, requested: Vec<RequestedDevice>) -> Result<Vec<ActiveDevice>> {
        let mut devices = Vec::with_capacity(requested.len());
        for request in requested {
            let address = match request.source {
                RequestedSource::Pci(addr) => DeviceAddress::Pci(addr),
                RequestedSource::UsbAddress(addr) => DeviceAddress::Usb(addr),
                RequestedSource::UsbId(id) => {
                    let addr = self
                        .ops
                        .find_usb_by_ids(id)?
                        .ok_or(HostdevError::UsbDeviceNotFound { id })?;
                    debug!(id = %id, address = %addr, "resolved USB device");
                    DeviceAddress::Usb(addr)
                }
            };
            devices.push(ActiveDevice::new(address, request.managed));
        }
        // Two vendor/product identities can resolve to the same slot;
        // re-check duplicates now that every identity is concrete.
        let mut seen = HashSet::new();
        for device in &devices {
            if !seen.insert(device.address) {
                return Err(HostdevError::DuplicateDevice {
                    device: device.address.to_string(),
                    guest: guest.to_string(),
                });
            }
        }
        Ok(devices)
    }

    /// Reverse completed acquisition sub-steps, most recent first.
    ///
    /// Rollback failures are logged but never mask the original error.
    fn unwind(&self, mut undo: Vec<RollbackStep>) {
        metrics::counter!("hostdev.acquire.rollback").increment(1);
        while let Some(step) = undo.pop() {
            match step {
                RollbackStep::Reattach(address) => {
                    if let Err(e) = self.ops.reattach(&address) {
                        error!(address = %address, error = %e, "rollback re-attach failed");
                    } else {
                        debug!(address = %address, "rolled back detach");
                    }
                }
            }
        }
    }
}
