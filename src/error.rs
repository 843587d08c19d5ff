//! Error types for the passthrough manager.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use crate::types::address::{DeviceAddress, UsbId};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for passthrough operations.
pub type Result<T> = std::result::Result<T, HostdevError>;

/// Main error type for the passthrough manager.
///
/// Hardware-layer failures carry the device address and the phase they
/// occurred in, so operators can tell a conflict from a kernel failure
/// without reading kernel-layer logs.
#[derive(Error, Debug)]
pub enum HostdevError {
    // Configuration errors, detected before any hardware interaction
    #[error("Invalid device address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("USB host device specifies neither vendor/product nor bus/device")]
    MissingAddress,

    #[error("Device {device} requested more than once by guest {guest}")]
    DuplicateDevice { device: String, guest: String },

    // Exclusivity conflicts
    #[error("Device {address} is already in use by guest {owner}")]
    DeviceInUse { address: DeviceAddress, owner: String },

    // Assignability policy
    #[error("Device {address} is not assignable (isolation policy)")]
    NotAssignable { address: DeviceAddress },

    // Acquisition hardware failures, surfaced after rollback
    #[error("Failed to detach {address} from host driver: {reason}")]
    DetachFailed { address: DeviceAddress, reason: String },

    #[error("Failed to reset {address}: {reason}")]
    ResetFailed { address: DeviceAddress, reason: String },

    // USB resolution
    #[error("No USB device {id} is currently plugged in")]
    UsbDeviceNotFound { id: UsbId },

    // sysfs layer
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HostdevError {
    /// Wrap an io::Error with the sysfs path involved.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}
