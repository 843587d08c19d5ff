//! Integration tests for the passthrough acquisition/release lifecycle.
//!
//! These use a recording mock in place of the kernel primitives, so every
//! property is checked against observable driver-binding state:
//! - all-or-nothing acquisition with rollback
//! - exclusivity conflicts naming the owning guest
//! - monotonic release that never touches other guests' devices
//! - USB vendor/product resolution

use hostdev_core::{
    manager::PassthroughManager,
    sysfs::HostDeviceOps,
    types::{DeviceAddress, HostdevDescriptor, PciAddress, UsbAddress, UsbId},
    HostdevError, PassthroughConfig,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
enum OpsEvent {
    Detach(DeviceAddress),
    Reset(DeviceAddress),
    Reattach(DeviceAddress),
}

/// Mock kernel primitives: records every call, tracks which devices are
/// currently detached from their host driver, and fails on request.
#[derive(Default)]
struct MockOps {
    events: Mutex<Vec<OpsEvent>>,
    detached: Mutex<HashSet<DeviceAddress>>,
    fail_detach: HashSet<DeviceAddress>,
    fail_reset: HashSet<DeviceAddress>,
    unassignable: HashSet<DeviceAddress>,
    busy: HashSet<DeviceAddress>,
    /// Hot-pluggable: tests mutate this between calls to model devices
    /// appearing and disappearing while a guest runs.
    usb_devices: Mutex<HashMap<UsbId, UsbAddress>>,
}

impl MockOps {
    fn events(&self) -> Vec<OpsEvent> {
        self.events.lock().unwrap().clone()
    }

    fn detached(&self) -> HashSet<DeviceAddress> {
        self.detached.lock().unwrap().clone()
    }
}

impl HostDeviceOps for MockOps {
    fn is_assignable(&self, address: &DeviceAddress) -> bool {
        !self.unassignable.contains(address)
    }

    fn detach(&self, address: &DeviceAddress) -> hostdev_core::Result<()> {
        self.events.lock().unwrap().push(OpsEvent::Detach(*address));
        if self.fail_detach.contains(address) {
            return Err(anyhow::anyhow!("injected detach failure").into());
        }
        self.detached.lock().unwrap().insert(*address);
        Ok(())
    }

    fn reset(&self, address: &DeviceAddress) -> hostdev_core::Result<()> {
        self.events.lock().unwrap().push(OpsEvent::Reset(*address));
        if self.fail_reset.contains(address) {
            return Err(anyhow::anyhow!("injected reset failure").into());
        }
        Ok(())
    }

    fn reattach(&self, address: &DeviceAddress) -> hostdev_core::Result<()> {
        self.events.lock().unwrap().push(OpsEvent::Reattach(*address));
        self.detached.lock().unwrap().remove(address);
        Ok(())
    }

    fn wait_until_free(
        &self,
        address: &DeviceAddress,
        _max_attempts: u32,
        _interval: Duration,
    ) -> bool {
        !self.busy.contains(address)
    }

    fn find_usb_by_ids(&self, id: UsbId) -> hostdev_core::Result<Option<UsbAddress>> {
        Ok(self.usb_devices.lock().unwrap().get(&id).copied())
    }
}

fn pci(s: &str) -> PciAddress {
    s.parse().unwrap()
}

fn pci_addr(s: &str) -> DeviceAddress {
    DeviceAddress::Pci(pci(s))
}

fn new_manager(ops: MockOps) -> (Arc<MockOps>, PassthroughManager) {
    let ops = Arc::new(ops);
    // Keep the release-path wait loop fast for tests.
    let config = PassthroughConfig { wait_attempts: 3, wait_interval_ms: 1, ..Default::default() };
    let manager = PassthroughManager::new(ops.clone(), config);
    (ops, manager)
}

#[test]
fn prepare_acquires_all_devices_for_guest() {
    let (ops, manager) = new_manager(MockOps::default());
    let descriptors =
        vec![HostdevDescriptor::pci(pci("0000:00:1b.0")), HostdevDescriptor::pci(pci("0000:00:13.0"))];

    manager.prepare("guest-a", &descriptors).unwrap();

    let registry = manager.registry();
    assert_eq!(registry.owner_of(&pci_addr("0000:00:1b.0")), Some("guest-a".to_string()));
    assert_eq!(registry.owner_of(&pci_addr("0000:00:13.0")), Some("guest-a".to_string()));
    assert_eq!(registry.len(), 2);

    // No reset may happen before every detach has completed.
    assert_eq!(
        ops.events(),
        vec![
            OpsEvent::Detach(pci_addr("0000:00:1b.0")),
            OpsEvent::Detach(pci_addr("0000:00:13.0")),
            OpsEvent::Reset(pci_addr("0000:00:1b.0")),
            OpsEvent::Reset(pci_addr("0000:00:13.0")),
        ]
    );
}

#[test]
fn conflicting_prepare_fails_naming_the_owner() {
    let (ops, manager) = new_manager(MockOps::default());
    let guest_a =
        vec![HostdevDescriptor::pci(pci("0000:00:1b.0")), HostdevDescriptor::pci(pci("0000:00:13.0"))];
    manager.prepare("guest-a", &guest_a).unwrap();
    let events_before = ops.events();

    let guest_b = vec![HostdevDescriptor::pci(pci("0000:00:1b.0"))];
    let err = manager.prepare("guest-b", &guest_b).unwrap_err();
    match err {
        HostdevError::DeviceInUse { address, owner } => {
            assert_eq!(address, pci_addr("0000:00:1b.0"));
            assert_eq!(owner, "guest-a");
        }
        other => panic!("expected DeviceInUse, got {other}"),
    }

    // Registry unchanged, and the conflicting call touched no hardware.
    assert_eq!(manager.registry().len(), 2);
    assert_eq!(manager.registry().owner_of(&pci_addr("0000:00:1b.0")), Some("guest-a".to_string()));
    assert_eq!(ops.events(), events_before);
}

#[test]
fn prepare_then_reattach_round_trips() {
    let (ops, manager) = new_manager(MockOps::default());
    let descriptors =
        vec![HostdevDescriptor::pci(pci("0000:00:1b.0")), HostdevDescriptor::pci(pci("0000:00:13.0"))];

    manager.prepare("guest-a", &descriptors).unwrap();
    assert_eq!(ops.detached().len(), 2);

    manager.reattach("guest-a", &descriptors);
    assert!(manager.registry().is_empty());
    // Both managed devices are back on their host drivers.
    assert!(ops.detached().is_empty());
}

#[test]
fn detach_failure_rolls_back_earlier_devices() {
    let mut ops = MockOps::default();
    ops.fail_detach.insert(pci_addr("0000:00:13.0"));
    let (ops, manager) = new_manager(ops);

    let descriptors =
        vec![HostdevDescriptor::pci(pci("0000:00:1b.0")), HostdevDescriptor::pci(pci("0000:00:13.0"))];
    let err = manager.prepare("guest-c", &descriptors).unwrap_err();
    assert!(matches!(err, HostdevError::DetachFailed { address, .. } if address == pci_addr("0000:00:13.0")));

    // The first device was observably re-attached, not left detached.
    assert!(ops.detached().is_empty());
    assert!(manager.registry().is_empty());
    assert_eq!(
        ops.events(),
        vec![
            OpsEvent::Detach(pci_addr("0000:00:1b.0")),
            OpsEvent::Detach(pci_addr("0000:00:13.0")),
            OpsEvent::Reattach(pci_addr("0000:00:1b.0")),
        ]
    );
}

#[test]
fn reset_failure_rolls_back_every_detached_device() {
    let mut ops = MockOps::default();
    ops.fail_reset.insert(pci_addr("0000:00:13.0"));
    let (ops, manager) = new_manager(ops);

    let descriptors =
        vec![HostdevDescriptor::pci(pci("0000:00:1b.0")), HostdevDescriptor::pci(pci("0000:00:13.0"))];
    let err = manager.prepare("guest-c", &descriptors).unwrap_err();
    assert!(matches!(err, HostdevError::ResetFailed { .. }));

    assert!(ops.detached().is_empty());
    assert!(manager.registry().is_empty());
    // Rollback runs most-recent-first.
    assert_eq!(
        ops.events(),
        vec![
            OpsEvent::Detach(pci_addr("0000:00:1b.0")),
            OpsEvent::Detach(pci_addr("0000:00:13.0")),
            OpsEvent::Reset(pci_addr("0000:00:1b.0")),
            OpsEvent::Reset(pci_addr("0000:00:13.0")),
            OpsEvent::Reattach(pci_addr("0000:00:13.0")),
            OpsEvent::Reattach(pci_addr("0000:00:1b.0")),
        ]
    );
}

#[test]
fn unassignable_device_blocks_before_any_hardware_touch() {
    let mut ops = MockOps::default();
    ops.unassignable.insert(pci_addr("0000:00:1b.0"));
    let (ops, manager) = new_manager(ops);

    let err = manager
        .prepare("guest-a", &[HostdevDescriptor::pci(pci("0000:00:1b.0"))])
        .unwrap_err();
    assert!(matches!(err, HostdevError::NotAssignable { .. }));
    assert!(ops.events().is_empty());
    assert!(manager.registry().is_empty());
}

#[test]
fn release_never_touches_another_guests_devices() {
    let (ops, manager) = new_manager(MockOps::default());
    let descriptors = vec![HostdevDescriptor::pci(pci("0000:00:1b.0"))];
    manager.prepare("guest-a", &descriptors).unwrap();
    let events_before = ops.events();

    manager.reattach("guest-b", &descriptors);

    assert_eq!(manager.registry().owner_of(&pci_addr("0000:00:1b.0")), Some("guest-a".to_string()));
    assert_eq!(ops.events(), events_before);
}

#[test]
fn release_of_unregistered_devices_is_a_noop() {
    let (ops, manager) = new_manager(MockOps::default());
    manager.reattach("guest-a", &[HostdevDescriptor::pci(pci("0000:00:1b.0"))]);
    assert!(ops.events().is_empty());
    assert!(manager.registry().is_empty());
}

#[test]
fn busy_device_is_left_detached_at_release() {
    let mut ops = MockOps::default();
    ops.busy.insert(pci_addr("0000:00:1b.0"));
    let (ops, manager) = new_manager(ops);

    let descriptors = vec![HostdevDescriptor::pci(pci("0000:00:1b.0"))];
    manager.prepare("guest-a", &descriptors).unwrap();
    manager.reattach("guest-a", &descriptors);

    // Registry entry is gone, but the device stays on the stub driver
    // rather than risking a host-driver attach while the kernel still
    // holds it.
    assert!(manager.registry().is_empty());
    assert_eq!(ops.detached(), HashSet::from([pci_addr("0000:00:1b.0")]));
    assert!(!ops.events().contains(&OpsEvent::Reattach(pci_addr("0000:00:1b.0"))));
}

#[test]
fn unmanaged_devices_skip_driver_binding_changes() {
    let (ops, manager) = new_manager(MockOps::default());
    let mut descriptor = HostdevDescriptor::pci(pci("0000:00:1b.0"));
    descriptor.managed = false;

    manager.prepare("guest-a", &[descriptor.clone()]).unwrap();
    // Reset still happens; detach does not.
    assert_eq!(ops.events(), vec![OpsEvent::Reset(pci_addr("0000:00:1b.0"))]);

    manager.reattach("guest-a", &[descriptor]);
    assert!(manager.registry().is_empty());
    assert!(!ops.events().iter().any(|e| matches!(e, OpsEvent::Reattach(_))));
}

#[test]
fn usb_devices_resolve_by_vendor_product() {
    let ops = MockOps::default();
    let id = UsbId { vendor: 0x1d6b, product: 0x0002 };
    let slot = UsbAddress { bus: 3, device: 7 };
    ops.usb_devices.lock().unwrap().insert(id, slot);
    let (_, manager) = new_manager(ops);

    manager.prepare("guest-a", &[HostdevDescriptor::usb_by_id(id)]).unwrap();
    assert_eq!(
        manager.registry().owner_of(&DeviceAddress::Usb(slot)),
        Some("guest-a".to_string())
    );
}

#[test]
fn usb_device_unplugged_while_guest_ran_is_still_unregistered() {
    let ops = MockOps::default();
    let id = UsbId { vendor: 0x1d6b, product: 0x0002 };
    let slot = UsbAddress { bus: 3, device: 7 };
    ops.usb_devices.lock().unwrap().insert(id, slot);
    let (ops, manager) = new_manager(ops);

    let descriptors = vec![HostdevDescriptor::usb_by_id(id)];
    manager.prepare("guest-a", &descriptors).unwrap();
    assert_eq!(manager.registry().len(), 1);

    // Device walks away while the guest runs; teardown can no longer
    // resolve the vendor/product pair to its old slot.
    ops.usb_devices.lock().unwrap().clear();
    manager.reattach("guest-a", &descriptors);

    assert!(manager.registry().is_empty());

    // The old slot must be free for whatever gets plugged there next.
    manager.prepare("guest-b", &[HostdevDescriptor::usb_by_address(slot)]).unwrap();
    assert_eq!(
        manager.registry().owner_of(&DeviceAddress::Usb(slot)),
        Some("guest-b".to_string())
    );
}

#[test]
fn missing_usb_device_fails_preparation() {
    let (ops, manager) = new_manager(MockOps::default());
    let id = UsbId { vendor: 0xdead, product: 0xbeef };

    let err = manager.prepare("guest-a", &[HostdevDescriptor::usb_by_id(id)]).unwrap_err();
    assert!(matches!(err, HostdevError::UsbDeviceNotFound { id: missing } if missing == id));
    assert!(ops.events().is_empty());
    assert!(manager.registry().is_empty());
}

#[test]
fn empty_or_skipped_request_is_a_noop() {
    let (ops, manager) = new_manager(MockOps::default());
    manager.prepare("guest-a", &[]).unwrap();
    assert!(ops.events().is_empty());
    assert!(manager.registry().is_empty());
}
