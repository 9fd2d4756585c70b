/*!
A remote node on a FireWire bus.

Devices are created by discovery only and stay owned by their
[`Bus`](crate::bus::Bus). A device is bound to the bus-reset generation it
was discovered on; once the bus resets, every transaction against the stale
handle fails with [`Error::BusReset`](crate::error::Error::BusReset) and
the caller must re-enumerate, matching devices up again by GUID.
*/

use std::any::Any;
use std::mem::MaybeUninit;

use dataview::Pod;

use crate::backend::{BackendDevice, DiscoveredNode};
use crate::bus::BusId;
use crate::csr::{self, ROM_QUADLETS};
use crate::engine;
use crate::error::Result;
use crate::types::Address;

/// One read request: target address and the caller buffer the response
/// payload lands in. Borrowed for the duration of the call.
pub type ReadRequest<'a> = (Address, &'a mut [u8]);

/// One write request: target address and the payload to send.
pub type WriteRequest<'a> = (Address, &'a [u8]);

/// A foreign node on a FireWire bus at a particular bus-reset generation.
pub struct Device {
    bus: BusId,

    product_name: String,
    product_id: u32,
    vendor_name: String,
    vendor_id: u32,

    guid: u64,
    node_id: u16,
    generation: u32,
    max_request: usize,

    is_open: bool,
    rom: [u32; ROM_QUADLETS],

    user_data: Option<Box<dyn Any>>,

    handle: Box<dyn BackendDevice>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("bus", &self.bus)
            .field("product_name", &self.product_name)
            .field("product_id", &self.product_id)
            .field("vendor_name", &self.vendor_name)
            .field("vendor_id", &self.vendor_id)
            .field("guid", &self.guid)
            .field("node_id", &self.node_id)
            .field("generation", &self.generation)
            .field("max_request", &self.max_request)
            .field("is_open", &self.is_open)
            .finish()
    }
}

impl Device {
    /// Builds a device from a discovered node. Identity is parsed out of
    /// the configuration ROM; identity the platform supplies from outside
    /// the ROM (sysfs, the I/O registry) takes precedence.
    pub(crate) fn new(bus: BusId, node: DiscoveredNode) -> Self {
        let parsed = csr::parse(&node.rom);

        Self {
            bus,
            product_name: csr::clamp_name(node.ident.model_name.unwrap_or(parsed.model_name)),
            product_id: node.ident.model_id.unwrap_or(parsed.model_id),
            vendor_name: csr::clamp_name(node.ident.vendor_name.unwrap_or(parsed.vendor_name)),
            vendor_id: node.ident.vendor_id.unwrap_or(parsed.vendor_id),
            guid: parsed.guid,
            node_id: node.node_id,
            generation: node.generation,
            max_request: parsed.max_request,
            is_open: false,
            rom: node.rom,
            user_data: None,
            handle: node.handle,
        }
    }

    /// The bus this device belongs to.
    pub fn bus(&self) -> BusId {
        self.bus
    }

    /// Opens the device for transactions. Opening an already-open device
    /// succeeds without effect.
    pub fn open(&mut self) -> Result<()> {
        if self.is_open {
            return Ok(());
        }

        self.handle.open()?;
        self.is_open = true;
        Ok(())
    }

    /// Closes the device. A no-op on an already-closed device.
    pub fn close(&mut self) {
        if !self.is_open {
            return;
        }

        self.handle.close();
        self.is_open = false;
    }

    /// Whether the device is currently open.
    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// Copies out the 256-quadlet configuration ROM snapshot taken at
    /// discovery, in host endianness.
    pub fn csr(&self) -> [u32; ROM_QUADLETS] {
        self.rom
    }

    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    pub fn guid(&self) -> u64 {
        self.guid
    }

    /// The bus-reset generation this device was discovered on. Constant
    /// for the device's lifetime.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn product_name(&self) -> &str {
        &self.product_name
    }

    pub fn product_id(&self) -> u32 {
        self.product_id
    }

    pub fn vendor_name(&self) -> &str {
        &self.vendor_name
    }

    pub fn vendor_id(&self) -> u32 {
        self.vendor_id
    }

    /// Largest request, in bytes, the device advertises it can serve.
    pub fn max_request_size(&self) -> usize {
        self.max_request
    }

    /// Reads `buf.len()` bytes of physical memory starting at `addr`.
    ///
    /// The device must be open. The top 16 bits of the address are owned by
    /// the transport and are masked off.
    pub fn read(&mut self, addr: Address, buf: &mut [u8]) -> Result<()> {
        self.read_vectored(&mut [(addr, buf)])
    }

    /// Executes an ordered batch of reads as one pipelined operation.
    pub fn read_vectored(&mut self, reqs: &mut [ReadRequest]) -> Result<()> {
        assert!(self.is_open, "read on a closed device");
        engine::read_batch(&mut *self.handle, self.max_request, reqs)
    }

    /// Writes `buf` to physical memory starting at `addr`.
    pub fn write(&mut self, addr: Address, buf: &[u8]) -> Result<()> {
        self.write_vectored(&[(addr, buf)])
    }

    /// Executes an ordered batch of writes as one pipelined operation.
    pub fn write_vectored(&mut self, reqs: &[WriteRequest]) -> Result<()> {
        assert!(self.is_open, "write on a closed device");
        engine::write_batch(&mut *self.handle, self.max_request, reqs)
    }

    /// Reads into a `Pod` value in place.
    pub fn read_into<T: Pod + ?Sized>(&mut self, addr: Address, out: &mut T) -> Result<()> {
        self.read(addr, out.as_bytes_mut())
    }

    /// Reads a `Pod` value.
    ///
    /// # Safety
    ///
    /// this function will overwrite the contents of 'obj' so we can just allocate an unitialized memory section.
    /// this function should only be used with [repr(C)] structs.
    #[allow(clippy::uninit_assumed_init)]
    pub fn read_val<T: Pod + Sized>(&mut self, addr: Address) -> Result<T> {
        let mut obj: T = unsafe { MaybeUninit::uninit().assume_init() };
        self.read_into(addr, &mut obj)?;
        Ok(obj)
    }

    /// Writes a `Pod` value.
    pub fn write_pod<T: Pod + ?Sized>(&mut self, addr: Address, data: &T) -> Result<()> {
        self.write(addr, data.as_bytes())
    }

    /// Stores arbitrary caller data on the device. The library imposes no
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
}

impl Drop for Device {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::backend::dummy::{DummyBackend, DummyDevice};
    use crate::bus::Bus;
    use crate::types::Address;

    fn bus_with_device(dev: DummyDevice) -> Bus {
        Bus::with_backend(Box::new(DummyBackend::new().with_node(dev)))
    }

    #[test]
    fn test_open_close_idempotent() {
        let mut bus = bus_with_device(DummyDevice::new(0xffc1).with_memory(0x100));
        let devices = bus.devices(None).unwrap();
        let dev = &mut devices[0];

        assert!(!dev.is_open());
        dev.open().unwrap();
        dev.open().unwrap();
        assert!(dev.is_open());

        dev.close();
        dev.close();
        assert!(!dev.is_open());
    }

    #[test]
    fn test_identity_from_rom() {
        let mut rom = [0u32; ROM_QUADLETS];
        rom[0] = 0x0404_0000;
        rom[1] = 0x3133_3934;
        rom[2] = 0x0000_a000;
        rom[3] = 0x0011_2233;
        rom[4] = 0x4455_6677;
        rom[5] = 0x0001_0000;
        rom[6] = 0x0300_0123;

        let mut bus = bus_with_device(
            DummyDevice::new(0xffc1)
                .with_generation(7)
                .with_rom(rom)
                .with_memory(0x100),
        );
        let devices = bus.devices(None).unwrap();
        let dev = &devices[0];

        assert_eq!(dev.guid(), 0x0011_2233_4455_6677);
        assert_eq!(dev.vendor_id(), 0x000123);
        assert_eq!(dev.max_request_size(), 2048);
        assert_eq!(dev.node_id(), 0xffc1);
        assert_eq!(dev.generation(), 7);
        assert_eq!(dev.csr()[..7], rom[..7]);
        assert_eq!(dev.csr().len(), ROM_QUADLETS);
    }

    #[test]
    fn test_single_read_equals_vectored_read() {
        let mut mem = vec![0u8; 0x100];
        for (i, b) in mem.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(3);
        }

        let mut bus = bus_with_device(
            DummyDevice::new(0xffc1).with_memory_bytes(mem),
        );
        let devices = bus.devices(None).unwrap();
        let dev = &mut devices[0];
        dev.open().unwrap();

        let mut single = [0u8; 16];
        dev.read(Address::from(0x40u64), &mut single).unwrap();

        let mut vectored = [0u8; 16];
        dev.read_vectored(&mut [(Address::from(0x40u64), &mut vectored)])
            .unwrap();

        assert_eq!(single, vectored);
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let mut bus = bus_with_device(DummyDevice::new(0xffc1).with_memory(0x100));
        let devices = bus.devices(None).unwrap();
        let dev = &mut devices[0];
        dev.open().unwrap();

        dev.write(Address::from(0x20u64), &[0xde, 0xad, 0xbe, 0xef])
            .unwrap();

        let mut back = [0u8; 4];
        dev.read(Address::from(0x20u64), &mut back).unwrap();
        assert_eq!(back, [0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_pod_read() {
        let mut mem = vec![0u8; 0x100];
        mem[0x10..0x18].copy_from_slice(&0x1122_3344_5566_7788u64.to_le_bytes());

        let mut bus = bus_with_device(DummyDevice::new(0xffc1).with_memory_bytes(mem));
        let devices = bus.devices(None).unwrap();
        let dev = &mut devices[0];
        dev.open().unwrap();

        let val: u64 = dev.read_val(Address::from(0x10u64)).unwrap();
        assert_eq!(val, u64::from_le(0x1122_3344_5566_7788));
    }

    #[test]
    #[should_panic(expected = "read on a closed device")]
    fn test_read_on_closed_device_panics() {
        let mut bus = bus_with_device(DummyDevice::new(0xffc1).with_memory(0x100));
        let devices = bus.devices(None).unwrap();

        let mut buf = [0u8; 4];
        let _ = devices[0].read(Address::from(0u64), &mut buf);
    }

    #[test]
    fn test_user_data() {
        let mut bus = bus_with_device(DummyDevice::new(0xffc1).with_memory(0x100));
        let devices = bus.devices(None).unwrap();
        let dev = &mut devices[0];

        assert!(dev.user_data().is_none());
        dev.set_user_data(Some(Box::new(42usize)));
        assert_eq!(
            dev.user_data().and_then(|d| d.downcast_ref::<usize>()),
            Some(&42)
        );
    }
}
