/*!
An in-memory backend for tests and doctests.

The dummy backend keeps a configurable set of fake nodes, each backed by a
plain byte buffer. Transactions are served out of that buffer, and replies
can be scripted per submission to drive the abort paths of the request
engine (busy targets, stale generations, silence). A [`DummyProbe`] cloned
off the backend before it moves into a [`Bus`](crate::bus::Bus) keeps the
recorded tcodes, submitted addresses, and the published SBP-2 block
observable from the outside.
*/

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use rand::{thread_rng, RngCore, SeedableRng};
use rand_xorshift::XorShiftRng;

use super::{
    BackendDevice, Completion, DiscoveredNode, Discovery, FirewireBackend, NodeIdent,
    ResponseCode, Tcode, Transaction,
};
use crate::csr::ROM_QUADLETS;
use crate::error::{Error, Result};

/// Scripted reply to one submission.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DummyReply {
    /// Serve the transaction from the backing memory.
    Complete,
    /// Answer with a busy response.
    Busy,
    /// Answer with a stale-generation response.
    Generation,
    /// Answer with an arbitrary transport response code.
    Failure(u32),
    /// Swallow the transaction; the waiting side runs into its timeout.
    Silent,
}

struct NodeState {
    node_id: u16,
    local: bool,
    denied: bool,
    fail_open: bool,
    generation: u32,
    rom: [u32; ROM_QUADLETS],
    ident: NodeIdent,
    read_pipeline: usize,
    write_pipeline: usize,
    reverse: bool,
    script: VecDeque<DummyReply>,
    mem: Vec<u8>,
    open: bool,
    tcodes: Vec<Tcode>,
    addresses: Vec<u64>,
    cancelled: usize,
    pending: VecDeque<Completion>,
}

impl NodeState {
    fn read_mem(&self, addr: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        if addr < self.mem.len() {
            let n = (self.mem.len() - addr).min(len);
            out[..n].copy_from_slice(&self.mem[addr..addr + n]);
        }
        out
    }

    fn write_mem(&mut self, addr: usize, data: &[u8]) {
        if addr < self.mem.len() {
            let n = (self.mem.len() - addr).min(data.len());
            self.mem[addr..addr + n].copy_from_slice(&data[..n]);
        }
    }
}

/// Builder for one fake node.
pub struct DummyDevice {
    state: NodeState,
}

impl DummyDevice {
    pub fn new(node_id: u16) -> Self {
        Self {
            state: NodeState {
                node_id,
                local: false,
                denied: false,
                fail_open: false,
                generation: 1,
                rom: [0u32; ROM_QUADLETS],
                ident: NodeIdent::default(),
                read_pipeline: 1,
                write_pipeline: 1,
                reverse: false,
                script: VecDeque::new(),
                mem: Vec::new(),
                open: false,
                tcodes: Vec::new(),
                addresses: Vec::new(),
                cancelled: 0,
                pending: VecDeque::new(),
            },
        }
    }

    /// Backs the node with `size` bytes of zeroed memory.
    pub fn with_memory(mut self, size: usize) -> Self {
        self.state.mem = vec![0u8; size];
        self
    }

    /// Backs the node with the given bytes.
    pub fn with_memory_bytes(mut self, mem: Vec<u8>) -> Self {
        self.state.mem = mem;
        self
    }

    /// Backs the node with `size` bytes of random memory.
    pub fn with_random_memory(mut self, size: usize) -> Self {
        let mut mem = vec![0u8; size];
        thread_rng().fill_bytes(&mut mem);
        self.state.mem = mem;
        self
    }

    /// Backs the node with `size` bytes of deterministic pseudo-random
    /// memory.
    pub fn with_seeded_memory(mut self, size: usize, seed: u64) -> Self {
        let mut rng = XorShiftRng::seed_from_u64(seed);
        let mut mem = vec![0u8; size];
        rng.fill_bytes(&mut mem);
        self.state.mem = mem;
        self
    }

    /// Installs a full configuration ROM.
    pub fn with_rom(mut self, rom: [u32; ROM_QUADLETS]) -> Self {
        self.state.rom = rom;
        self
    }

    /// Installs a minimal valid configuration ROM carrying `guid`.
    pub fn with_guid(mut self, guid: u64) -> Self {
        let mut rom = [0u32; ROM_QUADLETS];
        rom[0] = 0x0404_0000;
        rom[1] = 0x3133_3934;
        rom[2] = 0x0000_a000;
        rom[3] = (guid >> 32) as u32;
        rom[4] = guid as u32;
        rom[5] = 0x0001_0000;
        rom[6] = 0x0300_609e;
        self.state.rom = rom;
        self
    }

    pub fn with_generation(mut self, generation: u32) -> Self {
        self.state.generation = generation;
        self
    }

    /// Supplies platform identity strings the way sysfs or the I/O
    /// registry would.
    pub fn with_ident(mut self, ident: NodeIdent) -> Self {
        self.state.ident = ident;
        self
    }

    /// Sets the pipeline depths reported to the engine.
    pub fn with_pipeline(mut self, reads: usize, writes: usize) -> Self {
        self.state.read_pipeline = reads;
        self.state.write_pipeline = writes;
        self
    }

    /// Queues scripted replies, consumed one per submission. Submissions
    /// past the end of the script complete normally.
    pub fn with_script(mut self, script: Vec<DummyReply>) -> Self {
        self.state.script = script.into();
        self
    }

    /// Hands out completions newest-first to exercise out-of-order
    /// reassembly.
    pub fn complete_in_reverse(mut self) -> Self {
        self.state.reverse = true;
        self
    }

    /// Marks the node as the local host controller.
    pub fn local(mut self) -> Self {
        self.state.local = true;
        self
    }

    /// Marks the node as inaccessible, as if opening it failed with a
    /// permission error.
    pub fn denied(mut self) -> Self {
        self.state.denied = true;
        self
    }

    /// Makes a later `open` of the discovered device fail.
    pub fn fail_open(mut self) -> Self {
        self.state.fail_open = true;
        self
    }
}

struct BackendState {
    nodes: Vec<Rc<RefCell<NodeState>>>,
    published: Option<Vec<u32>>,
    publish_count: usize,
}

/// A [`FirewireBackend`] over fake in-memory nodes.
pub struct DummyBackend {
    state: Rc<RefCell<BackendState>>,
}

impl DummyBackend {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(BackendState {
                nodes: Vec::new(),
                published: None,
                publish_count: 0,
            })),
        }
    }

    pub fn with_node(self, device: DummyDevice) -> Self {
        self.state
            .borrow_mut()
            .nodes
            .push(Rc::new(RefCell::new(device.state)));
        self
    }

    /// Hands out an observation handle that stays valid after the backend
    /// moves into a bus.
    pub fn probe(&self) -> DummyProbe {
        DummyProbe {
            state: self.state.clone(),
        }
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FirewireBackend for DummyBackend {
    fn discover(&mut self) -> Result<Discovery> {
        let state = self.state.borrow();

        let mut nodes = Vec::new();
        let mut denied = 0;

        for node in state.nodes.iter() {
            let n = node.borrow();
            if n.local {
                continue;
            }
            if n.denied {
                denied += 1;
                continue;
            }

            nodes.push(DiscoveredNode {
                node_id: n.node_id,
                generation: n.generation,
                rom: n.rom,
                ident: n.ident.clone(),
                handle: Box::new(DummyHandle { node: node.clone() }),
            });
        }

        Ok(Discovery { nodes, denied })
    }

    fn publish_sbp2(&mut self, block: &[u32]) -> Result<()> {
        let mut state = self.state.borrow_mut();

        let mut denied = 0;
        let mut local = false;
        for node in state.nodes.iter() {
            let n = node.borrow();
            if n.denied {
                denied += 1;
            } else if n.local {
                local = true;
            }
        }

        if !local {
            return Err(if denied > 0 {
                Error::NoPerm
            } else {
                Error::Io("no local firewire node found")
            });
        }

        state.published = Some(block.to_vec());
        state.publish_count += 1;
        Ok(())
    }

    fn unpublish_sbp2(&mut self) {
        self.state.borrow_mut().published = None;
    }
}

struct DummyHandle {
    node: Rc<RefCell<NodeState>>,
}

impl BackendDevice for DummyHandle {
    fn open(&mut self) -> Result<()> {
        let mut node = self.node.borrow_mut();
        if node.fail_open {
            return Err(Error::Io("unable to open device"));
        }
        node.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.node.borrow_mut().open = false;
    }

    fn read_pipeline(&self) -> usize {
        self.node.borrow().read_pipeline
    }

    fn write_pipeline(&self) -> usize {
        self.node.borrow().write_pipeline
    }

    fn submit(&mut self, xfer: &Transaction) -> Result<()> {
        let mut node = self.node.borrow_mut();

        if !node.open {
            return Err(Error::Io("device not open"));
        }

        node.tcodes.push(xfer.tcode);
        node.addresses.push(xfer.addr.as_u64());

        let reply = node.script.pop_front().unwrap_or(DummyReply::Complete);
        let addr = xfer.addr.as_usize();

        let completion = match reply {
            DummyReply::Complete => {
                let data = if xfer.tcode.is_read() {
                    node.read_mem(addr, xfer.length)
                } else {
                    node.write_mem(addr, xfer.data.unwrap_or(&[]));
                    Vec::new()
                };
                Completion {
                    closure: xfer.closure,
                    code: ResponseCode::Complete,
                    data,
                }
            }
            DummyReply::Busy => Completion {
                closure: xfer.closure,
                code: ResponseCode::Busy,
                data: Vec::new(),
            },
            DummyReply::Generation => Completion {
                closure: xfer.closure,
                code: ResponseCode::Generation,
                data: Vec::new(),
            },
            DummyReply::Failure(code) => Completion {
                closure: xfer.closure,
                code: ResponseCode::Other(code),
                data: Vec::new(),
            },
            DummyReply::Silent => return Ok(()),
        };

        if node.reverse {
            node.pending.push_front(completion);
        } else {
            node.pending.push_back(completion);
        }

        Ok(())
    }

    fn wait(&mut self, _timeout: Duration) -> Result<Completion> {
        self.node
            .borrow_mut()
            .pending
            .pop_front()
            .ok_or(Error::IoTimeout)
    }

    fn cancel_pending(&mut self) {
        let mut node = self.node.borrow_mut();
        node.cancelled += node.pending.len();
        node.pending.clear();
    }
}

/// Observation handle over a [`DummyBackend`].
pub struct DummyProbe {
    state: Rc<RefCell<BackendState>>,
}

impl DummyProbe {
    fn with_node<T>(&self, node_id: u16, f: impl FnOnce(&NodeState) -> T) -> T {
        let state = self.state.borrow();
        let node = state
            .nodes
            .iter()
            .find(|n| n.borrow().node_id == node_id)
            .expect("no such dummy node");
        let node = node.borrow();
        f(&node)
    }

    /// Tcodes of every transaction submitted to the node, in order.
    pub fn tcodes(&self, node_id: u16) -> Vec<Tcode> {
        self.with_node(node_id, |n| n.tcodes.clone())
    }

    /// Addresses of every transaction submitted to the node, in order.
    pub fn addresses(&self, node_id: u16) -> Vec<u64> {
        self.with_node(node_id, |n| n.addresses.clone())
    }

    /// Number of pipelined transactions thrown away by cancellation.
    pub fn cancelled(&self, node_id: u16) -> usize {
        self.with_node(node_id, |n| n.cancelled)
    }

    /// Snapshot of the node's backing memory.
    pub fn memory(&self, node_id: u16) -> Vec<u8> {
        self.with_node(node_id, |n| n.mem.clone())
    }

    /// Whether the node's device handle is currently open.
    pub fn opened(&self, node_id: u16) -> bool {
        self.with_node(node_id, |n| n.open)
    }

    /// The descriptor block currently published, if any.
    pub fn published(&self) -> Option<Vec<u32>> {
        self.state.borrow().published.clone()
    }

    /// How many times a block has been published.
    pub fn publish_count(&self) -> usize {
        self.state.borrow().publish_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_memory_is_deterministic() {
        let a = DummyDevice::new(1).with_seeded_memory(0x200, 0x1394);
        let b = DummyDevice::new(2).with_seeded_memory(0x200, 0x1394);
        assert_eq!(a.state.mem, b.state.mem);

        let c = DummyDevice::new(3).with_seeded_memory(0x200, 0x4931);
        assert_ne!(a.state.mem, c.state.mem);
    }

    #[test]
    fn test_discover_skips_local_and_denied_nodes() {
        let mut backend = DummyBackend::new()
            .with_node(DummyDevice::new(0xffc0).local())
            .with_node(DummyDevice::new(0xffc1).denied())
            .with_node(DummyDevice::new(0xffc2).with_memory(0x10));

        let discovery = backend.discover().unwrap();
        assert_eq!(discovery.nodes.len(), 1);
        assert_eq!(discovery.nodes[0].node_id, 0xffc2);
        assert_eq!(discovery.denied, 1);
    }

    #[test]
    fn test_failed_open_is_surfaced() {
        let mut backend =
            DummyBackend::new().with_node(DummyDevice::new(0xffc1).with_memory(0x10).fail_open());

        let mut discovery = backend.discover().unwrap();
        assert!(discovery.nodes[0].handle.open().is_err());
    }

    #[test]
    fn test_publish_with_denied_local_node() {
        let mut backend = DummyBackend::new().with_node(DummyDevice::new(0xffc0).local().denied());

        assert_eq!(backend.publish_sbp2(&[0x1]).unwrap_err(), Error::NoPerm);
    }
}
