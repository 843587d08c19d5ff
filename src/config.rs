//! Passthrough manager configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the passthrough manager, embedded in the daemon's config
/// document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PassthroughConfig {
    /// Stub driver managed PCI devices are bound to while assigned.
    pub stub_driver: String,
    /// Retry ceiling when waiting for the kernel to release a device
    /// during guest teardown.
    pub wait_attempts: u32,
    /// Sleep between wait attempts, in milliseconds.
    pub wait_interval_ms: u64,
    /// Sysfs mount point. Overridable for tests.
    pub sysfs_root: PathBuf,
}

impl Default for PassthroughConfig {
    fn default() -> Self {
        Self {
            stub_driver: "vfio-pci".to_string(),
            wait_attempts: 100,
            wait_interval_ms: 100,
            sysfs_root: PathBuf::from("/sys"),
        }
    }
}

impl PassthroughConfig {
    /// Sleep between wait attempts as a `Duration`.
    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms)
    }
}
