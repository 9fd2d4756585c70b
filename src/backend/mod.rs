/*!
Module containing the platform backends and the capability traits the
portable layer calls through.

A [`FirewireBackend`] owns one handle to the host's FireWire subsystem and
knows how to discover nodes and to publish an SBP-2 unit directory on the
local node. Discovery yields one [`BackendDevice`] per foreign node, which
carries the per-node transaction machinery: open/close, submission of
asynchronous transactions, and a blocking wait for completions.

Backends share no state; each platform lives in its own submodule. The
[`dummy`](dummy/index.html) backend backs the test suite and doctests with
plain in-memory nodes.
*/

use std::time::Duration;

use crate::csr::ROM_QUADLETS;
use crate::error::Result;
use crate::types::Address;

pub mod dummy;
#[doc(hidden)]
pub use dummy::{DummyBackend, DummyDevice, DummyProbe, DummyReply};

#[cfg(target_os = "linux")]
pub mod linux;
#[doc(hidden)]
#[cfg(target_os = "linux")]
pub use linux::LinuxBackend;

#[cfg(target_os = "macos")]
pub mod macos;
#[doc(hidden)]
#[cfg(target_os = "macos")]
pub use macos::IokitBackend;

/// Transaction codes of the asynchronous transaction layer.
///
/// The discriminants are the wire tcodes of IEEE 1394.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum Tcode {
    WriteQuadlet = 0x0,
    WriteBlock = 0x1,
    ReadQuadlet = 0x4,
    ReadBlock = 0x5,
}

impl Tcode {
    /// Selects the tcode for a read of `len` bytes: exactly 4 bytes go out
    /// as a quadlet transaction, everything else as a block transaction.
    pub fn for_read(len: usize) -> Tcode {
        if len == 4 {
            Tcode::ReadQuadlet
        } else {
            Tcode::ReadBlock
        }
    }

    /// Selects the tcode for a write of `len` bytes.
    pub fn for_write(len: usize) -> Tcode {
        if len == 4 {
            Tcode::WriteQuadlet
        } else {
            Tcode::WriteBlock
        }
    }

    /// Whether this tcode moves data from the target to the host.
    pub fn is_read(self) -> bool {
        matches!(self, Tcode::ReadQuadlet | Tcode::ReadBlock)
    }
}

/// Per-completion response classification.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResponseCode {
    /// The transaction completed.
    Complete,
    /// The target answered busy.
    Busy,
    /// The transaction carried a stale bus generation.
    Generation,
    /// Any other transport-level response code.
    Other(u32),
}

/// One asynchronous transaction as handed to a backend.
///
/// `closure` is an opaque index the engine uses to route the matching
/// [`Completion`] back to the caller buffer; backends pass it through
/// untouched.
#[derive(Debug)]
pub struct Transaction<'a> {
    pub tcode: Tcode,
    pub addr: Address,
    pub length: usize,
    pub data: Option<&'a [u8]>,
    pub closure: u64,
}

/// A completed transaction as handed back by a backend.
#[derive(Clone, Debug)]
pub struct Completion {
    pub closure: u64,
    pub code: ResponseCode,
    /// Response payload; empty for writes.
    pub data: Vec<u8>,
}

/// Identity strings a platform can supply from outside the ROM (sysfs on
/// Linux, the I/O registry on macOS). Fields left `None` fall back to the
/// parsed configuration ROM.
#[derive(Clone, Debug, Default)]
pub struct NodeIdent {
    pub vendor_name: Option<String>,
    pub vendor_id: Option<u32>,
    pub model_name: Option<String>,
    pub model_id: Option<u32>,
}

/// One foreign node as produced by discovery.
pub struct DiscoveredNode {
    pub node_id: u16,
    pub generation: u32,
    /// Configuration ROM snapshot in host endianness.
    pub rom: [u32; ROM_QUADLETS],
    pub ident: NodeIdent,
    pub handle: Box<dyn BackendDevice>,
}

/// Result of one discovery pass.
pub struct Discovery {
    /// Foreign nodes in discovery order.
    pub nodes: Vec<DiscoveredNode>,
    /// Number of nodes skipped because they were not accessible.
    pub denied: usize,
}

/// One handle to the host's FireWire subsystem.
pub trait FirewireBackend {
    /// Scans the bus for foreign nodes. Individual unusable nodes are
    /// skipped and tallied in [`Discovery::denied`].
    fn discover(&mut self) -> Result<Discovery>;

    /// Publishes the given descriptor block (header quadlet plus entries)
    /// as a unit directory on the local node. Triggers a bus reset on the
    /// host.
    fn publish_sbp2(&mut self, block: &[u32]) -> Result<()>;

    /// Revokes a previous publication. A no-op if nothing is published.
    fn unpublish_sbp2(&mut self);
}

/// Per-node transaction machinery.
pub trait BackendDevice {
    /// Acquires the platform resources needed for transactions.
    fn open(&mut self) -> Result<()>;

    /// Releases the platform resources again. A no-op if not open.
    fn close(&mut self);

    /// How many read transactions may be in flight at once.
    fn read_pipeline(&self) -> usize;

    /// How many write transactions may be in flight at once.
    fn write_pipeline(&self) -> usize;

    /// Queues one transaction. Returns without waiting for the response.
    fn submit(&mut self, xfer: &Transaction) -> Result<()>;

    /// Blocks until one completion arrives, up to `timeout`. Times out with
    /// [`Error::IoTimeout`](crate::error::Error::IoTimeout).
    fn wait(&mut self, timeout: Duration) -> Result<Completion>;

    /// Cancels transactions still in the pipeline after an abort.
    fn cancel_pending(&mut self);
}

/// Produces the native backend of the running platform.
#[cfg(target_os = "linux")]
pub fn default_backend() -> Result<Box<dyn FirewireBackend>> {
    Ok(Box::new(linux::LinuxBackend::new()?))
}

/// Produces the native backend of the running platform.
#[cfg(target_os = "macos")]
pub fn default_backend() -> Result<Box<dyn FirewireBackend>> {
    Ok(Box::new(macos::IokitBackend::new()?))
}

/// Produces the native backend of the running platform.
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn default_backend() -> Result<Box<dyn FirewireBackend>> {
    Err(crate::error::Error::Other(
        "no firewire backend for this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcode_selection() {
        assert_eq!(Tcode::for_read(4), Tcode::ReadQuadlet);
        assert_eq!(Tcode::for_read(8), Tcode::ReadBlock);
        assert_eq!(Tcode::for_read(1), Tcode::ReadBlock);
        assert_eq!(Tcode::for_write(4), Tcode::WriteQuadlet);
        assert_eq!(Tcode::for_write(512), Tcode::WriteBlock);
    }

    #[test]
    fn test_tcode_wire_values() {
        assert_eq!(Tcode::WriteQuadlet as u32, 0x0);
        assert_eq!(Tcode::WriteBlock as u32, 0x1);
        assert_eq!(Tcode::ReadQuadlet as u32, 0x4);
        assert_eq!(Tcode::ReadBlock as u32, 0x5);
    }
}
