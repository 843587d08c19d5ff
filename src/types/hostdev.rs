//! Host-device descriptors from the guest definition.
//!
//! This is the configuration surface: what a guest *asks for*. The
//! requested-set builder turns a descriptor list into concrete device
//! addresses before any hardware is touched.

use crate::types::address::{PciAddress, UsbAddress, UsbId};
use serde::{Deserialize, Serialize};

/// How the guest wants the host device attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostdevMode {
    /// Attach a physical subsystem device (PCI or USB passthrough).
    Subsystem,
    /// Capability lookup (storage/misc/net capabilities). Not hardware
    /// assignment; skipped by the passthrough manager.
    Capabilities,
}

/// The physical device a descriptor points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "subsystem")]
pub enum HostdevSource {
    Pci {
        address: PciAddress,
    },
    Usb {
        /// Vendor/product pair, resolved to a bus/device slot at guest start.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<UsbId>,
        /// Concrete bus/device slot, when pinned by the administrator.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<UsbAddress>,
    },
    /// Subsystems this daemon does not assign (mediated devices, SCSI).
    #[serde(other)]
    Other,
}

/// One host-device entry from a guest definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostdevDescriptor {
    pub mode: HostdevMode,
    /// True if the daemon unbinds/rebinds the host driver itself; false if
    /// the administrator pre-configured the device for passthrough.
    #[serde(default = "default_managed")]
    pub managed: bool,
    pub source: HostdevSource,
}

fn default_managed() -> bool {
    true
}

impl HostdevDescriptor {
    /// Managed subsystem PCI descriptor.
    pub fn pci(address: PciAddress) -> Self {
        Self { mode: HostdevMode::Subsystem, managed: true, source: HostdevSource::Pci { address } }
    }

    /// Subsystem USB descriptor identified by vendor/product.
    pub fn usb_by_id(id: UsbId) -> Self {
        Self {
            mode: HostdevMode::Subsystem,
            managed: false,
            source: HostdevSource::Usb { id: Some(id), address: None },
        }
    }

    /// Subsystem USB descriptor pinned to a bus/device slot.
    pub fn usb_by_address(address: UsbAddress) -> Self {
        Self {
            mode: HostdevMode::Subsystem,
            managed: false,
            source: HostdevSource::Usb { id: None, address: Some(address) },
        }
    }
}
