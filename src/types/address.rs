//! Physical device addresses.
//!
//! These are the stable identities the active registry is keyed by. A PCI
//! address names a function on the host bus; a USB address names a concrete
//! bus/device slot. A vendor/product pair is *not* an address: USB devices
//! move between slots across hotplug, so vendor/product is resolved to a
//! bus/device pair at acquisition time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// PCI device address: domain, bus, slot, function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PciAddress {
    pub domain: u32,
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

impl PciAddress {
    pub fn new(domain: u32, bus: u8, slot: u8, function: u8) -> Self {
        Self { domain, bus, slot, function }
    }
}

impl fmt::Display for PciAddress {
    /// Canonical Linux form, e.g. `0000:00:1b.0`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:02x}:{:02x}.{:x}", self.domain, self.bus, self.slot, self.function)
    }
}

impl FromStr for PciAddress {
    type Err = crate::error::HostdevError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| crate::error::HostdevError::InvalidAddress {
            address: s.to_string(),
            reason,
        };
        let (domain_bus_slot, function) =
            s.rsplit_once('.').ok_or_else(|| invalid("missing function separator '.'".into()))?;
        let mut parts = domain_bus_slot.split(':');
        let (domain, bus, slot) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(d), Some(b), Some(s), None) => (d, b, s),
            // Domain defaults to 0 when omitted, e.g. "00:1b.0"
            (Some(b), Some(s), None, None) => ("0", b, s),
            _ => return Err(invalid("expected [domain:]bus:slot.function".into())),
        };
        let domain =
            u32::from_str_radix(domain, 16).map_err(|e| invalid(format!("domain: {}", e)))?;
        let bus = u8::from_str_radix(bus, 16).map_err(|e| invalid(format!("bus: {}", e)))?;
        let slot = u8::from_str_radix(slot, 16).map_err(|e| invalid(format!("slot: {}", e)))?;
        let function =
            u8::from_str_radix(function, 16).map_err(|e| invalid(format!("function: {}", e)))?;
        if slot > 0x1f {
            return Err(invalid(format!("slot {:#x} out of range (max 0x1f)", slot)));
        }
        if function > 0x7 {
            return Err(invalid(format!("function {:#x} out of range (max 0x7)", function)));
        }
        Ok(Self { domain, bus, slot, function })
    }
}

/// Concrete USB device location on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UsbAddress {
    pub bus: u16,
    pub device: u16,
}

impl fmt::Display for UsbAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "usb {}:{}", self.bus, self.device)
    }
}

/// USB vendor/product identity, e.g. `1d6b:0002`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbId {
    pub vendor: u16,
    pub product: u16,
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.product)
    }
}

/// Registry key naming one physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceAddress {
    Pci(PciAddress),
    Usb(UsbAddress),
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pci(addr) => write!(f, "pci {}", addr),
            Self::Usb(addr) => write!(f, "{}", addr),
        }
    }
}

impl From<PciAddress> for DeviceAddress {
    fn from(addr: PciAddress) -> Self {
        Self::Pci(addr)
    }
}

impl From<UsbAddress> for DeviceAddress {
    fn from(addr: UsbAddress) -> Self {
        Self::Usb(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pci_address_roundtrip() {
        let addr: PciAddress = "0000:00:1b.0".parse().unwrap();
        assert_eq!(addr, PciAddress::new(0, 0, 0x1b, 0));
        assert_eq!(addr.to_string(), "0000:00:1b.0");
    }

    #[test]
    fn pci_address_domain_optional() {
        let addr: PciAddress = "01:00.1".parse().unwrap();
        assert_eq!(addr, PciAddress::new(0, 1, 0, 1));
    }

    #[test]
    fn pci_address_rejects_garbage() {
        assert!("".parse::<PciAddress>().is_err());
        assert!("0000:00:1b".parse::<PciAddress>().is_err());
        assert!("zz:00:1b.0".parse::<PciAddress>().is_err());
        // slot and function ranges
        assert!("0000:00:20.0".parse::<PciAddress>().is_err());
        assert!("0000:00:1b.8".parse::<PciAddress>().is_err());
    }

    #[test]
    fn display_forms() {
        let pci = DeviceAddress::Pci(PciAddress::new(0, 3, 0, 0));
        assert_eq!(pci.to_string(), "pci 0000:03:00.0");
        let usb = DeviceAddress::Usb(UsbAddress { bus: 3, device: 7 });
        assert_eq!(usb.to_string(), "usb 3:7");
        assert_eq!(UsbId { vendor: 0x1d6b, product: 0x2 }.to_string(), "1d6b:0002");
    }
}
