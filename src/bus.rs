/*!
One logical handle to the host's FireWire subsystem.

A [`Bus`] owns the platform backend, the device list produced by the last
enumeration, and the SBP-2 publication if one was made. Enumeration is
destructive: it invalidates every previously returned device handle before
new ones come back, which the borrow on [`Bus::devices`] enforces at
compile time. Dropping the bus cascades over the devices and revokes the
SBP-2 publication on every path, panics included.
*/

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, info, warn};

use crate::backend::{self, FirewireBackend};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::sbp2;

static BUS_IDS: AtomicUsize = AtomicUsize::new(0);

/// Stable identity token of a [`Bus`].
///
/// Devices carry the token of their owning bus instead of a cyclic
/// back-pointer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct BusId(usize);

/// Callback invoked once per device when a device list is invalidated,
/// either by the next enumeration or by bus destruction.
pub type DeviceCallback = Box<dyn FnMut(&Device)>;

/// Outcome of [`Bus::enable_sbp2`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Sbp2Status {
    /// The unit directory was published; a bus reset is under way.
    Enabled,
    /// A previous call already published it; nothing was done.
    AlreadyEnabled,
}

/// One logical handle to the host's FireWire subsystem.
pub struct Bus {
    id: BusId,
    backend: Box<dyn FirewireBackend>,
    devices: Vec<Device>,
    destroy_callback: Option<DeviceCallback>,
    sbp2_enabled: bool,
    user_data: Option<Box<dyn Any>>,
}

impl Bus {
    /// Allocates a bus backed by the native backend of the running
    /// platform. Fails only if the platform refuses to allocate its
    /// backing handle.
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    pub fn new() -> Result<Self> {
        Ok(Self::with_backend(backend::default_backend()?))
    }

    /// Allocates a bus on top of an explicit backend.
    pub fn with_backend(backend: Box<dyn FirewireBackend>) -> Self {
        Self {
            id: BusId(BUS_IDS.fetch_add(1, Ordering::Relaxed)),
            backend,
            devices: Vec::new(),
            destroy_callback: None,
            sbp2_enabled: false,
            user_data: None,
        }
    }

    /// The identity token of this bus.
    pub fn id(&self) -> BusId {
        self.id
    }

    /// Publishes the canonical SBP-2 unit directory on the local node.
    ///
    /// Publication triggers a bus reset on the host; callers should enable
    /// SBP-2 early and give targets around two seconds to settle before
    /// enumerating. Idempotent once succeeded.
    pub fn enable_sbp2(&mut self) -> Result<Sbp2Status> {
        if self.sbp2_enabled {
            return Ok(Sbp2Status::AlreadyEnabled);
        }

        let block = sbp2::directory_block();
        self.backend.publish_sbp2(&block)?;
        self.sbp2_enabled = true;

        info!("published SBP-2 unit directory on the local node");
        Ok(Sbp2Status::Enabled)
    }

    /// Whether an SBP-2 unit directory is currently published.
    pub fn sbp2_enabled(&self) -> bool {
        self.sbp2_enabled
    }

    /// Enumerates the foreign devices attached to the bus.
    ///
    /// Any previous device list is destroyed first: each old device is
    /// closed and handed to the callback registered at the *previous*
    /// enumeration. `on_invalidate`, if given, is stored and will fire the
    /// same way when this list is invalidated in turn.
    ///
    /// Nodes that cannot be accessed are skipped; if that leaves zero
    /// devices and at least one node was skipped for lack of permissions,
    /// the enumeration fails with [`Error::NoPerm`].
    pub fn devices(&mut self, on_invalidate: Option<DeviceCallback>) -> Result<&mut [Device]> {
        self.invalidate_devices();
        self.destroy_callback = on_invalidate;

        let discovery = self.backend.discover()?;

        if discovery.nodes.is_empty() && discovery.denied > 0 {
            warn!(
                "no devices enumerable, {} node(s) not accessible",
                discovery.denied
            );
            return Err(Error::NoPerm);
        }

        if discovery.denied > 0 {
            warn!("skipped {} inaccessible node(s)", discovery.denied);
        }

        let id = self.id;
        self.devices = discovery
            .nodes
            .into_iter()
            .map(|node| Device::new(id, node))
            .collect();

        debug!("enumerated {} device(s)", self.devices.len());
        Ok(&mut self.devices[..])
    }

    /// Number of devices in the current list.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Stores arbitrary caller data on the bus. The library imposes no
    /// semantics on it.
    pub fn set_user_data(&mut self, data: Option<Box<dyn Any>>) {
        self.user_data = data;
    }

    pub fn user_data(&self) -> Option<&(dyn Any)> {
        self.user_data.as_deref()
    }

    pub fn user_data_mut(&mut self) -> Option<&mut (dyn Any)> {
        self.user_data.as_deref_mut()
    }

    /// Closes every device, fires the registered callback once per device,
    /// and drops the list.
    fn invalidate_devices(&mut self) {
        let mut callback = self.destroy_callback.take();

        for dev in self.devices.iter_mut() {
            dev.close();
            if let Some(callback) = callback.as_mut() {
                callback(dev);
            }
        }

        self.devices.clear();
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        self.invalidate_devices();

        if self.sbp2_enabled {
            self.backend.unpublish_sbp2();
            self.sbp2_enabled = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::backend::dummy::{DummyBackend, DummyDevice};
    use crate::sbp2::UNIT_DIRECTORY;

    fn node(node_id: u16, guid: u64) -> DummyDevice {
        DummyDevice::new(node_id).with_guid(guid).with_memory(0x100)
    }

    #[test]
    fn test_devices_belong_to_bus_and_start_closed() {
        let backend = DummyBackend::new()
            .with_node(node(0xffc1, 0x1))
            .with_node(node(0xffc2, 0x2));
        let mut bus = Bus::with_backend(Box::new(backend));
        let id = bus.id();

        let devices = bus.devices(None).unwrap();
        assert_eq!(devices.len(), 2);
        for dev in devices.iter() {
            assert_eq!(dev.bus(), id);
            assert!(!dev.is_open());
        }
    }

    #[test]
    fn test_destroy_fires_callback_once_per_device() {
        let backend = DummyBackend::new()
            .with_node(node(0xffc1, 0x1))
            .with_node(node(0xffc2, 0x2));
        let mut bus = Bus::with_backend(Box::new(backend));
        let id = bus.id();

        let seen: Rc<RefCell<Vec<(BusId, u64)>>> = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        bus.devices(Some(Box::new(move |dev| {
            seen2.borrow_mut().push((dev.bus(), dev.guid()));
        })))
        .unwrap();

        drop(bus);

        assert_eq!(&*seen.borrow(), &[(id, 0x1), (id, 0x2)]);
    }

    #[test]
    fn test_reenumeration_invalidates_previous_list_first() {
        let backend = DummyBackend::new()
            .with_node(node(0xffc1, 0xa))
            .with_node(node(0xffc2, 0xb));
        let mut bus = Bus::with_backend(Box::new(backend));

        let events: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));

        let ev = events.clone();
        bus.devices(Some(Box::new(move |dev| {
            ev.borrow_mut().push(format!("destroyed {:x}", dev.guid()));
        })))
        .unwrap();

        let list_b = bus.devices(None).unwrap();
        events
            .borrow_mut()
            .push(format!("returned {} new", list_b.len()));

        assert_eq!(
            &*events.borrow(),
            &[
                "destroyed a".to_string(),
                "destroyed b".to_string(),
                "returned 2 new".to_string()
            ]
        );
    }

    #[test]
    fn test_callback_registration_lasts_one_generation() {
        let backend = DummyBackend::new().with_node(node(0xffc1, 0x1));
        let mut bus = Bus::with_backend(Box::new(backend));

        let count = Rc::new(RefCell::new(0));
        let count2 = count.clone();
        bus.devices(Some(Box::new(move |_| {
            *count2.borrow_mut() += 1;
        })))
        .unwrap();

        // Second enumeration consumes the callback...
        bus.devices(None).unwrap();
        assert_eq!(*count.borrow(), 1);

        // ...so the third one has nothing left to fire
        bus.devices(None).unwrap();
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn test_open_devices_are_closed_on_invalidation() {
        let backend = DummyBackend::new().with_node(node(0xffc1, 0x1));
        let probe = backend.probe();
        let mut bus = Bus::with_backend(Box::new(backend));

        bus.devices(None).unwrap()[0].open().unwrap();
        assert!(probe.opened(0xffc1));

        // Re-enumerate; the cascade closes the open device
        bus.devices(None).unwrap();
        assert!(!probe.opened(0xffc1));
        assert!(!bus.devices(None).unwrap()[0].is_open());
    }

    #[test]
    fn test_no_devices_with_denied_nodes_is_a_permission_error() {
        let backend = DummyBackend::new().with_node(
            DummyDevice::new(0xffc1).with_memory(0x100).denied(),
        );
        let mut bus = Bus::with_backend(Box::new(backend));

        assert_eq!(bus.devices(None).unwrap_err(), Error::NoPerm);
        assert_eq!(bus.device_count(), 0);
    }

    #[test]
    fn test_denied_nodes_are_skipped_when_others_are_usable() {
        let backend = DummyBackend::new()
            .with_node(DummyDevice::new(0xffc1).with_memory(0x100).denied())
            .with_node(node(0xffc2, 0x2));
        let mut bus = Bus::with_backend(Box::new(backend));

        let devices = bus.devices(None).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].node_id(), 0xffc2);
    }

    #[test]
    fn test_local_nodes_are_not_enumerated() {
        let backend = DummyBackend::new()
            .with_node(DummyDevice::new(0xffc0).local())
            .with_node(node(0xffc1, 0x1));
        let mut bus = Bus::with_backend(Box::new(backend));

        let devices = bus.devices(None).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].node_id(), 0xffc1);
    }

    #[test]
    fn test_enable_sbp2_is_idempotent() {
        let backend = DummyBackend::new().with_node(DummyDevice::new(0xffc0).local());
        let probe = backend.probe();
        let mut bus = Bus::with_backend(Box::new(backend));

        assert!(!bus.sbp2_enabled());
        assert_eq!(bus.enable_sbp2().unwrap(), Sbp2Status::Enabled);
        assert_eq!(bus.enable_sbp2().unwrap(), Sbp2Status::AlreadyEnabled);
        assert!(bus.sbp2_enabled());
        assert_eq!(probe.publish_count(), 1);
    }

    #[test]
    fn test_published_directory_is_canonical() {
        let backend = DummyBackend::new().with_node(DummyDevice::new(0xffc0).local());
        let probe = backend.probe();
        let mut bus = Bus::with_backend(Box::new(backend));

        bus.enable_sbp2().unwrap();

        let block = probe.published().unwrap();
        assert_eq!(block.len(), 14);
        assert_eq!(block[0] >> 16, 13);
        for (i, &(key, value)) in UNIT_DIRECTORY.iter().enumerate() {
            assert_eq!(block[i + 1], key << 24 | value);
        }
    }

    #[test]
    fn test_publication_is_revoked_on_drop() {
        let backend = DummyBackend::new().with_node(DummyDevice::new(0xffc0).local());
        let probe = backend.probe();
        let mut bus = Bus::with_backend(Box::new(backend));

        bus.enable_sbp2().unwrap();
        assert!(probe.published().is_some());

        drop(bus);
        assert!(probe.published().is_none());
    }

    #[test]
    fn test_enable_sbp2_without_local_node_fails() {
        let backend = DummyBackend::new().with_node(node(0xffc1, 0x1));
        let mut bus = Bus::with_backend(Box::new(backend));

        assert!(bus.enable_sbp2().is_err());
        assert!(!bus.sbp2_enabled());
    }

    #[test]
    fn test_bus_user_data() {
        let mut bus = Bus::with_backend(Box::new(DummyBackend::new()));

        assert!(bus.user_data().is_none());
        bus.set_user_data(Some(Box::new("probe-1".to_string())));
        assert_eq!(
            bus.user_data().and_then(|d| d.downcast_ref::<String>()),
            Some(&"probe-1".to_string())
        );
        bus.set_user_data(None);
        assert!(bus.user_data().is_none());
    }
}
