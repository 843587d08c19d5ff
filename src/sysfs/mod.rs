//! Kernel device primitives.
//!
//! `HostDeviceOps` is the seam between the passthrough protocols and the
//! kernel: everything the manager does to one physical device goes through
//! it, so tests can substitute a recording implementation and deployments
//! can substitute platform-specific ops.
//!
//! `LinuxDeviceOps` is the sysfs implementation. Driver binding uses the
//! `driver_override` + `drivers_probe` flow: overriding before the probe
//! means the kernel itself picks the stub driver, and clearing the override
//! before the final probe restores whichever host driver matches the
//! device, so no per-device driver bookkeeping is needed.

use crate::config::PassthroughConfig;
use crate::error::{HostdevError, Result};
use crate::types::address::{DeviceAddress, PciAddress, UsbAddress, UsbId};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Blocking single-device operations consumed by the passthrough protocols.
///
/// All methods may take milliseconds to whole seconds (a PCI function reset
/// is slow); callers must not hold the registry lock across them.
pub trait HostDeviceOps: Send + Sync {
    /// Whether platform isolation policy allows assigning this device.
    fn is_assignable(&self, address: &DeviceAddress) -> bool;

    /// Unbind the device from its host driver and bind it to the stub driver.
    fn detach(&self, address: &DeviceAddress) -> Result<()>;

    /// Reset the device function.
    fn reset(&self, address: &DeviceAddress) -> Result<()>;

    /// Return the device to its host driver.
    fn reattach(&self, address: &DeviceAddress) -> Result<()>;

    /// Wait for the kernel's busy marker on the device to clear.
    ///
    /// Returns false if the device is still busy after `max_attempts` polls
    /// spaced `interval` apart.
    fn wait_until_free(&self, address: &DeviceAddress, max_attempts: u32, interval: Duration)
        -> bool;

    /// Locate a plugged-in USB device by vendor/product.
    fn find_usb_by_ids(&self, id: UsbId) -> Result<Option<UsbAddress>>;
}

/// Sysfs-backed implementation of [`HostDeviceOps`].
#[derive(Debug)]
pub struct LinuxDeviceOps {
    sysfs_root: PathBuf,
    stub_driver: String,
}

impl LinuxDeviceOps {
    pub fn new(config: &PassthroughConfig) -> Self {
        Self { sysfs_root: config.sysfs_root.clone(), stub_driver: config.stub_driver.clone() }
    }

    fn pci_device_dir(&self, address: &PciAddress) -> PathBuf {
        self.sysfs_root.join("bus/pci/devices").join(address.to_string())
    }

    fn pci_drivers_probe(&self) -> PathBuf {
        self.sysfs_root.join("bus/pci/drivers_probe")
    }

    /// Driver currently bound to a PCI device, if any.
    fn pci_driver(&self, address: &PciAddress) -> Option<String> {
        let link = self.pci_device_dir(address).join("driver");
        fs::read_link(&link)
            .ok()
            .and_then(|target| target.file_name().map(|n| n.to_string_lossy().to_string()))
    }

    fn write_sysfs(path: &Path, value: &str) -> Result<()> {
        fs::write(path, value).map_err(|e| HostdevError::io(path, e))
    }

    /// Locate the sysfs directory for a USB device by bus/device number.
    fn usb_device_dir(&self, address: &UsbAddress) -> Result<Option<PathBuf>> {
        let devices = self.sysfs_root.join("bus/usb/devices");
        let entries = match fs::read_dir(&devices) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(HostdevError::io(devices, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| HostdevError::io(&devices, e))?;
            let dir = entry.path();
            let (Some(busnum), Some(devnum)) =
                (read_u16(&dir.join("busnum"), 10), read_u16(&dir.join("devnum"), 10))
            else {
                // Interface entries have no busnum/devnum; skip them.
                continue;
            };
            if busnum == address.bus && devnum == address.device {
                return Ok(Some(dir));
            }
        }
        Ok(None)
    }

    fn detach_pci(&self, address: &PciAddress) -> Result<()> {
        let dir = self.pci_device_dir(address);
        if self.pci_driver(address).as_deref() == Some(self.stub_driver.as_str()) {
            debug!(address = %address, "device already bound to stub driver");
            return Ok(());
        }
        Self::write_sysfs(&dir.join("driver_override"), &self.stub_driver)?;
        if self.pci_driver(address).is_some() {
            Self::write_sysfs(&dir.join("driver/unbind"), &address.to_string())?;
        }
        Self::write_sysfs(&self.pci_drivers_probe(), &address.to_string())?;
        debug!(address = %address, driver = %self.stub_driver, "detached from host driver");
        Ok(())
    }

    fn reattach_pci(&self, address: &PciAddress) -> Result<()> {
        let dir = self.pci_device_dir(address);
        Self::write_sysfs(&dir.join("driver_override"), "\n")?;
        if self.pci_driver(address).as_deref() == Some(self.stub_driver.as_str()) {
            Self::write_sysfs(&dir.join("driver/unbind"), &address.to_string())?;
        }
        Self::write_sysfs(&self.pci_drivers_probe(), &address.to_string())?;
        debug!(address = %address, "returned to host driver");
        Ok(())
    }
}

impl HostDeviceOps for LinuxDeviceOps {
    fn is_assignable(&self, address: &DeviceAddress) -> bool {
        match address {
            DeviceAddress::Pci(pci) => {
                let dir = self.pci_device_dir(pci);
                // Without an IOMMU group the device cannot be isolated from
                // its siblings.
                dir.exists() && dir.join("iommu_group").exists()
            }
            DeviceAddress::Usb(usb) => matches!(self.usb_device_dir(usb), Ok(Some(_))),
        }
    }

    fn detach(&self, address: &DeviceAddress) -> Result<()> {
        match address {
            DeviceAddress::Pci(pci) => self.detach_pci(pci),
            // The hypervisor claims the USB device node itself; there is no
            // host driver binding to move.
            DeviceAddress::Usb(_) => Ok(()),
        }
    }

    fn reset(&self, address: &DeviceAddress) -> Result<()> {
        match address {
            DeviceAddress::Pci(pci) => {
                let reset_path = self.pci_device_dir(pci).join("reset");
                Self::write_sysfs(&reset_path, "1")?;
                debug!(address = %pci, "function reset complete");
                Ok(())
            }
            DeviceAddress::Usb(usb) => {
                // Re-enumerate via the authorized toggle when the node
                // exposes one; an unplugged device is not an error here.
                if let Some(dir) = self.usb_device_dir(usb)? {
                    let authorized = dir.join("authorized");
                    if authorized.exists() {
                        Self::write_sysfs(&authorized, "0")?;
                        Self::write_sysfs(&authorized, "1")?;
                    }
                }
                Ok(())
            }
        }
    }

    fn reattach(&self, address: &DeviceAddress) -> Result<()> {
        match address {
            DeviceAddress::Pci(pci) => self.reattach_pci(pci),
            DeviceAddress::Usb(_) => Ok(()),
        }
    }

    fn wait_until_free(
        &self,
        address: &DeviceAddress,
        max_attempts: u32,
        interval: Duration,
    ) -> bool {
        let DeviceAddress::Pci(pci) = address else {
            return true;
        };
        let enable_path = self.pci_device_dir(pci).join("enable");
        for attempt in 0..max_attempts {
            // The enable count stays non-zero while something still holds
            // the function; it drops to 0 once in-kernel cleanup finishes.
            match fs::read_to_string(&enable_path) {
                Ok(contents) if contents.trim() != "0" => {
                    debug!(address = %pci, attempt, "device still busy");
                    std::thread::sleep(interval);
                }
                // Missing file means the device is gone or unbound; either
                // way nothing holds it.
                _ => return true,
            }
        }
        warn!(address = %pci, max_attempts, "device still busy after retry ceiling");
        false
    }

    fn find_usb_by_ids(&self, id: UsbId) -> Result<Option<UsbAddress>> {
        let devices = self.sysfs_root.join("bus/usb/devices");
        let entries = match fs::read_dir(&devices) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(HostdevError::io(devices, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| HostdevError::io(&devices, e))?;
            let dir = entry.path();
            let (Some(vendor), Some(product)) =
                (read_u16(&dir.join("idVendor"), 16), read_u16(&dir.join("idProduct"), 16))
            else {
                continue;
            };
            if vendor != id.vendor || product != id.product {
                continue;
            }
            let (Some(bus), Some(device)) =
                (read_u16(&dir.join("busnum"), 10), read_u16(&dir.join("devnum"), 10))
            else {
                continue;
            };
            let address = UsbAddress { bus, device };
            debug!(id = %id, address = %address, "resolved USB device");
            return Ok(Some(address));
        }
        Ok(None)
    }
}

fn read_u16(path: &Path, radix: u32) -> Option<u16> {
    let contents = fs::read_to_string(path).ok()?;
    u16::from_str_radix(contents.trim(), radix).ok()
}
