/*!
The pipelined request engine.

Batches of read or write requests are pushed through a [`BackendDevice`]
here: submission proceeds greedily while the backend's pipeline has room,
then the engine waits for exactly one completion, applies it, and iterates.
Completions may arrive out of order; the closure index carried by each
transaction routes them back to the right caller buffer.

Any abnormal completion aborts the whole batch: a busy target, a stale bus
generation, a short read payload, a transport error, or the per-completion
timeout. Requests still in the pipeline are cancelled at the backend before
the abort is surfaced.
*/

use std::time::Duration;

use log::{debug, trace};
use smallvec::SmallVec;

use crate::backend::{BackendDevice, Completion, ResponseCode, Tcode, Transaction};
use crate::device::{ReadRequest, WriteRequest};
use crate::error::{Error, Result};

/// How long to wait for each completion before the batch aborts.
///
/// Targets that stop responding mid-acquisition must not wedge the caller.
pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(150);

/// Executes a batch of reads against an open backend device.
///
/// Buffers are filled in completion order; on abort, buffers of requests
/// that never completed are left untouched and the affected address ranges
/// are indeterminate.
pub fn read_batch(
    dev: &mut dyn BackendDevice,
    max_request: usize,
    reqs: &mut [ReadRequest],
) -> Result<()> {
    for (_, buf) in reqs.iter() {
        if buf.len() > max_request {
            return Err(Error::IoSize);
        }
    }

    let depth = dev.read_pipeline().max(1);
    let total = reqs.len();

    let mut next = 0;
    let mut inflight: SmallVec<[u64; 4]> = smallvec![];
    let mut retired = 0;

    while retired < total {
        while inflight.len() < depth && next < total {
            let (addr, buf) = &reqs[next];
            submit(
                dev,
                &Transaction {
                    tcode: Tcode::for_read(buf.len()),
                    addr: addr.masked(),
                    length: buf.len(),
                    data: None,
                    closure: next as u64,
                },
            )?;
            inflight.push(next as u64);
            next += 1;
        }

        let completion = wait_one(dev, &mut inflight)?;

        let buf = &mut reqs[completion.closure as usize].1;
        if completion.data.len() != buf.len() {
            debug!(
                "read response length mismatch: wanted {} got {}",
                buf.len(),
                completion.data.len()
            );
            dev.cancel_pending();
            return Err(Error::Io("read response length mismatch"));
        }
        buf.copy_from_slice(&completion.data);

        retired += 1;
    }

    Ok(())
}

/// Executes a batch of writes against an open backend device.
///
/// Only the response code of each completion is inspected. Writes already
/// in flight at an abort are not retried; the caller must treat the
/// affected address ranges as indeterminate.
pub fn write_batch(
    dev: &mut dyn BackendDevice,
    max_request: usize,
    reqs: &[WriteRequest],
) -> Result<()> {
    for (_, buf) in reqs.iter() {
        if buf.len() > max_request {
            return Err(Error::IoSize);
        }
    }

    let depth = dev.write_pipeline().max(1);
    let total = reqs.len();

    let mut next = 0;
    let mut inflight: SmallVec<[u64; 4]> = smallvec![];
    let mut retired = 0;

    while retired < total {
        while inflight.len() < depth && next < total {
            let (addr, buf) = reqs[next];
            submit(
                dev,
                &Transaction {
                    tcode: Tcode::for_write(buf.len()),
                    addr: addr.masked(),
                    length: buf.len(),
                    data: Some(buf),
                    closure: next as u64,
                },
            )?;
            inflight.push(next as u64);
            next += 1;
        }

        wait_one(dev, &mut inflight)?;
        retired += 1;
    }

    Ok(())
}

fn submit(dev: &mut dyn BackendDevice, xfer: &Transaction) -> Result<()> {
    trace!(
        "submit {:?} addr={:x} len={} closure={}",
        xfer.tcode,
        xfer.addr,
        xfer.length,
        xfer.closure
    );

    dev.submit(xfer).map_err(|e| {
        dev.cancel_pending();
        e
    })
}

/// Waits for one completion, validates its closure against the in-flight
/// window, and classifies the response code. Anything but a clean
/// completion cancels the pipeline and aborts.
fn wait_one(dev: &mut dyn BackendDevice, inflight: &mut SmallVec<[u64; 4]>) -> Result<Completion> {
    let completion = match dev.wait(REQUEST_TIMEOUT) {
        Ok(c) => c,
        Err(e) => {
            debug!("wait for completion failed: {}", e);
            dev.cancel_pending();
            return Err(e);
        }
    };

    let pos = match inflight.iter().position(|&c| c == completion.closure) {
        Some(pos) => pos,
        None => {
            dev.cancel_pending();
            return Err(Error::Io("response does not match any in-flight request"));
        }
    };

    if let Err(e) = classify(completion.code) {
        debug!("transaction {} aborted batch: {}", completion.closure, e);
        dev.cancel_pending();
        return Err(e);
    }

    inflight.remove(pos);
    Ok(completion)
}

fn classify(code: ResponseCode) -> Result<()> {
    match code {
        ResponseCode::Complete => Ok(()),
        ResponseCode::Busy => Err(Error::Busy),
        ResponseCode::Generation => Err(Error::BusReset),
        ResponseCode::Other(_) => Err(Error::Io("transaction failed")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::backend::dummy::{DummyBackend, DummyDevice, DummyReply};
    use crate::backend::FirewireBackend;
    use crate::types::Address;

    fn single_node_backend(dev: DummyDevice) -> (DummyBackend, crate::backend::DiscoveredNode) {
        let mut backend = DummyBackend::new().with_node(dev);
        let mut discovery = backend.discover().unwrap();
        (backend, discovery.nodes.remove(0))
    }

    #[test]
    fn test_tcode_recording() {
        let dev = DummyDevice::new(0xffc1).with_memory(0x1000);
        let (backend, mut node) = single_node_backend(dev);
        node.handle.open().unwrap();

        let mut quad = [0u8; 4];
        let mut block = [0u8; 8];
        read_batch(&mut *node.handle, 512, &mut [(Address::from(0u64), &mut quad)]).unwrap();
        read_batch(&mut *node.handle, 512, &mut [(Address::from(0u64), &mut block)]).unwrap();
        write_batch(&mut *node.handle, 512, &[(Address::from(0u64), &quad)]).unwrap();
        write_batch(&mut *node.handle, 512, &[(Address::from(0u64), &block)]).unwrap();

        assert_eq!(
            backend.probe().tcodes(0xffc1),
            vec![
                Tcode::ReadQuadlet,
                Tcode::ReadBlock,
                Tcode::WriteQuadlet,
                Tcode::WriteBlock
            ]
        );
    }

    #[test]
    fn test_read_fills_buffers_in_request_order() {
        let mut mem = vec![0u8; 0x100];
        for (i, b) in mem.iter_mut().enumerate() {
            *b = i as u8;
        }
        let dev = DummyDevice::new(0xffc1).with_memory_bytes(mem);
        let (_backend, mut node) = single_node_backend(dev);
        node.handle.open().unwrap();

        let mut a = [0u8; 4];
        let mut b = [0u8; 8];
        let mut c = [0u8; 4];
        read_batch(
            &mut *node.handle,
            512,
            &mut [
                (Address::from(0u64), &mut a),
                (Address::from(0x10u64), &mut b),
                (Address::from(0x20u64), &mut c),
            ],
        )
        .unwrap();

        assert_eq!(a, [0x00, 0x01, 0x02, 0x03]);
        assert_eq!(b, [0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17]);
        assert_eq!(c, [0x20, 0x21, 0x22, 0x23]);
    }

    #[test]
    fn test_out_of_order_completions_are_routed_by_closure() {
        let mut mem = vec![0u8; 0x100];
        for (i, b) in mem.iter_mut().enumerate() {
            *b = !(i as u8);
        }
        let dev = DummyDevice::new(0xffc1)
            .with_memory_bytes(mem)
            .with_pipeline(4, 1)
            .complete_in_reverse();
        let (_backend, mut node) = single_node_backend(dev);
        node.handle.open().unwrap();

        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        let mut c = [0u8; 4];
        read_batch(
            &mut *node.handle,
            512,
            &mut [
                (Address::from(0u64), &mut a),
                (Address::from(4u64), &mut b),
                (Address::from(8u64), &mut c),
            ],
        )
        .unwrap();

        assert_eq!(a, [0xff, 0xfe, 0xfd, 0xfc]);
        assert_eq!(b, [0xfb, 0xfa, 0xf9, 0xf8]);
        assert_eq!(c, [0xf7, 0xf6, 0xf5, 0xf4]);
    }

    #[test]
    fn test_generation_mismatch_aborts_batch() {
        let dev = DummyDevice::new(0xffc1)
            .with_memory_bytes(vec![0xaa; 0x100])
            .with_pipeline(4, 1)
            .with_script(vec![
                DummyReply::Complete,
                DummyReply::Generation,
                DummyReply::Complete,
            ]);
        let (_backend, mut node) = single_node_backend(dev);
        node.handle.open().unwrap();

        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        let mut c = [0u8; 4];
        let err = read_batch(
            &mut *node.handle,
            512,
            &mut [
                (Address::from(0u64), &mut a),
                (Address::from(4u64), &mut b),
                (Address::from(8u64), &mut c),
            ],
        )
        .unwrap_err();

        assert_eq!(err, Error::BusReset);
        // The first completion landed, the aborted ones did not
        assert_eq!(a, [0xaa; 4]);
        assert_eq!(b, [0u8; 4]);
        assert_eq!(c, [0u8; 4]);
    }

    #[test]
    fn test_busy_aborts_batch() {
        let dev = DummyDevice::new(0xffc1)
            .with_memory(0x100)
            .with_script(vec![DummyReply::Busy]);
        let (_backend, mut node) = single_node_backend(dev);
        node.handle.open().unwrap();

        let mut buf = [0u8; 4];
        let err = read_batch(&mut *node.handle, 512, &mut [(Address::from(0u64), &mut buf)])
            .unwrap_err();
        assert_eq!(err, Error::Busy);
    }

    #[test]
    fn test_silent_device_times_out() {
        let dev = DummyDevice::new(0xffc1)
            .with_memory(0x100)
            .with_script(vec![DummyReply::Silent]);
        let (_backend, mut node) = single_node_backend(dev);
        node.handle.open().unwrap();

        let mut buf = [0u8; 4];
        let err = read_batch(&mut *node.handle, 512, &mut [(Address::from(0u64), &mut buf)])
            .unwrap_err();
        assert_eq!(err, Error::IoTimeout);
    }

    #[test]
    fn test_oversized_request_is_rejected_up_front() {
        let dev = DummyDevice::new(0xffc1).with_memory(0x4000);
        let (backend, mut node) = single_node_backend(dev);
        node.handle.open().unwrap();

        let mut buf = [0u8; 2048];
        let err = read_batch(&mut *node.handle, 1024, &mut [(Address::from(0u64), &mut buf)])
            .unwrap_err();
        assert_eq!(err, Error::IoSize);
        // Nothing was submitted
        assert!(backend.probe().tcodes(0xffc1).is_empty());
    }

    #[test]
    fn test_abort_cancels_pipeline() {
        let dev = DummyDevice::new(0xffc1)
            .with_memory(0x100)
            .with_pipeline(4, 1)
            .with_script(vec![DummyReply::Busy]);
        let (backend, mut node) = single_node_backend(dev);
        node.handle.open().unwrap();

        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        let err = read_batch(
            &mut *node.handle,
            512,
            &mut [(Address::from(0u64), &mut a), (Address::from(4u64), &mut b)],
        )
        .unwrap_err();

        assert_eq!(err, Error::Busy);
        assert!(backend.probe().cancelled(0xffc1) > 0);
    }

    #[test]
    fn test_write_batch_applies_to_memory() {
        let dev = DummyDevice::new(0xffc1).with_memory(0x100);
        let (backend, mut node) = single_node_backend(dev);
        node.handle.open().unwrap();

        write_batch(
            &mut *node.handle,
            512,
            &[
                (Address::from(0u64), &[1, 2, 3, 4][..]),
                (Address::from(8u64), &[9, 9][..]),
            ],
        )
        .unwrap();

        let mem = backend.probe().memory(0xffc1);
        assert_eq!(&mem[0..4], &[1, 2, 3, 4]);
        assert_eq!(&mem[8..10], &[9, 9]);
    }

    #[test]
    fn test_address_masking() {
        let dev = DummyDevice::new(0xffc1).with_memory_bytes(vec![0x5a; 0x100]);
        let (backend, mut node) = single_node_backend(dev);
        node.handle.open().unwrap();

        let mut buf = [0u8; 4];
        // Top 16 bits are transport-owned and must be clipped
        read_batch(
            &mut *node.handle,
            512,
            &mut [(Address::from(0xffff_0000_0000_0010u64), &mut buf)],
        )
        .unwrap();

        assert_eq!(buf, [0x5a; 4]);
        assert_eq!(backend.probe().addresses(0xffc1), vec![0x10]);
    }
}
