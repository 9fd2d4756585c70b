/*!
fireflow is a library for memory forensics over IEEE 1394 ("FireWire").

It enumerates the FireWire devices physically attached to the host and
exploits the DMA capability of the FireWire protocol to read and write
arbitrary physical-memory addresses on them, which is how acquisition tools
dump the memory of a target machine connected over a FireWire cable.

A [`Bus`](bus/index.html) owns one handle to the host's FireWire subsystem.
Enumerating it yields [`Device`](device/index.html) handles for the foreign
nodes on the bus, each carrying the identity scraped out of its
configuration ROM ([`csr`](csr/index.html)). Since some target operating
systems only honor DMA from hosts that advertise an SBP-2 unit,
[`Bus::enable_sbp2`](bus/struct.Bus.html#method.enable_sbp2) publishes the
canonical directory ([`sbp2`](sbp2/index.html)) on the local node first.

Reads and writes run through a pipelined request engine
([`engine`](engine/index.html)) on top of a narrow per-platform backend
interface ([`backend`](backend/index.html)); the Linux backend speaks
firewire-cdev, the macOS backend IOKit, and an in-memory dummy backend
backs the test suite.

Everything is single-threaded, synchronous and blocking; only asynchronous
block/quadlet transactions are used on the wire, isochronous transfers are
out of scope.

```
use fireflow::backend::dummy::{DummyBackend, DummyDevice};
use fireflow::bus::Bus;
use fireflow::types::Address;

let backend = DummyBackend::new()
    .with_node(DummyDevice::new(0xffc1).with_guid(0x1394).with_memory(0x1000));

let mut bus = Bus::with_backend(Box::new(backend));

let devices = bus.devices(None).unwrap();
let dev = &mut devices[0];
dev.open().unwrap();

let mut buf = [0u8; 512];
dev.read(Address::from(0x8000u64), &mut buf).unwrap();
```
*/

#[macro_use]
extern crate smallvec;

pub mod error;
#[doc(hidden)]
pub use error::*;

pub mod types;
#[doc(hidden)]
pub use types::*;

pub mod csr;

pub mod sbp2;

pub mod backend;

pub mod engine;

pub mod bus;
#[doc(hidden)]
pub use bus::{Bus, BusId, DeviceCallback, Sbp2Status};

pub mod device;
#[doc(hidden)]
pub use device::{Device, ReadRequest, WriteRequest};
