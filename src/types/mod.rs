//! Passthrough domain types.

pub mod address;
pub mod hostdev;

pub use address::{DeviceAddress, PciAddress, UsbAddress, UsbId};
pub use hostdev::{HostdevDescriptor, HostdevMode, HostdevSource};
