//! Host-device passthrough management for the VM daemon.
//!
//! Decides whether a physical PCI or USB device may be handed to a guest,
//! performs the detach/reset sequence that makes it safe, and reverses it
//! when the guest stops. Acquisition across a device list is all-or-nothing
//! with full rollback; exclusivity is enforced by a process-wide registry.

pub mod config;
pub mod error;
pub mod manager;
pub mod registry;
pub mod sysfs;
pub mod types;

// Re-export commonly used items
pub use config::PassthroughConfig;
pub use error::{HostdevError, Result};
pub use manager::PassthroughManager;
pub use registry::{ActiveDevice, ActiveRegistry};
pub use sysfs::{HostDeviceOps, LinuxDeviceOps};
pub use types::{DeviceAddress, HostdevDescriptor, PciAddress, UsbAddress, UsbId};
