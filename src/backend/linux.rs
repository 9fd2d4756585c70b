/*!
Backend for the Linux `firewire-cdev` ("Juju") stack.

Nodes appear as `/dev/fw*` character devices. Discovery opens each one,
pulls the configuration ROM and bus-reset state out of the `GET_INFO`
ioctl, and keeps the foreign nodes; supplemental identity strings come
from the matching sysfs directory. Transactions go out through the
`SEND_REQUEST` ioctl and come back as response events on the same file
descriptor, with `poll` bounding the wait.

The pipeline depth is pinned to one outstanding request per direction;
the 2.6.x juju stack mishandles overlapping requests on a single file
descriptor.
*/

use std::ffi::CString;
use std::fs;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::slice;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::{
    BackendDevice, Completion, DiscoveredNode, Discovery, FirewireBackend, NodeIdent,
    ResponseCode, Transaction,
};
use crate::csr::ROM_QUADLETS;
use crate::error::{Error, Result};

const FW_CDEV_VERSION: u32 = 4;

const FW_CDEV_EVENT_BUS_RESET: u32 = 0x00;
const FW_CDEV_EVENT_RESPONSE: u32 = 0x01;

const RCODE_COMPLETE: u32 = 0x00;
const RCODE_BUSY: u32 = 0x12;
const RCODE_GENERATION: u32 = 0x13;

// Local-CSR key the unit directory is installed under:
// (CSR_DIRECTORY | CSR_UNIT) << 24
const CSR_UNIT_DIRECTORY_KEY: u32 = 0xd100_0000;

#[repr(C)]
#[derive(Default)]
struct FwCdevGetInfo {
    version: u32,
    rom_length: u32,
    rom: u64,
    bus_reset: u64,
    bus_reset_closure: u64,
    card: u32,
}

#[repr(C)]
#[derive(Default)]
struct FwCdevEventBusReset {
    closure: u64,
    type_: u32,
    node_id: u32,
    local_node_id: u32,
    bm_node_id: u32,
    irm_node_id: u32,
    root_node_id: u32,
    generation: u32,
}

#[repr(C)]
struct FwCdevEventCommon {
    closure: u64,
    type_: u32,
}

#[repr(C)]
struct FwCdevEventResponse {
    closure: u64,
    type_: u32,
    rcode: u32,
    length: u32,
    data: [u32; 0],
}

#[repr(C)]
struct FwCdevSendRequest {
    tcode: u32,
    length: u32,
    offset: u64,
    closure: u64,
    data: u64,
    generation: u32,
}

#[repr(C)]
struct FwCdevAddDescriptor {
    immediate: u32,
    key: u32,
    data: u64,
    length: u32,
    handle: u32,
}

const IOC_WRITE: libc::c_ulong = 1;
const IOC_READ: libc::c_ulong = 2;

const fn ioc(dir: libc::c_ulong, nr: libc::c_ulong, size: usize) -> libc::c_ulong {
    dir << 30 | (size as libc::c_ulong) << 16 | (b'#' as libc::c_ulong) << 8 | nr
}

const FW_CDEV_IOC_GET_INFO: libc::c_ulong =
    ioc(IOC_READ | IOC_WRITE, 0x00, mem::size_of::<FwCdevGetInfo>());
const FW_CDEV_IOC_SEND_REQUEST: libc::c_ulong =
    ioc(IOC_WRITE, 0x01, mem::size_of::<FwCdevSendRequest>());
const FW_CDEV_IOC_ADD_DESCRIPTOR: libc::c_ulong =
    ioc(IOC_READ | IOC_WRITE, 0x06, mem::size_of::<FwCdevAddDescriptor>());

// Event buffer; 8-byte aligned so events can be viewed as their structs
#[repr(C, align(8))]
struct EventBuf([u8; 16 * 1024]);

fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

fn open_rdwr(path: &Path) -> std::result::Result<i32, i32> {
    let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|_| libc::EINVAL)?;
    let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR) };
    if fd == -1 {
        Err(errno())
    } else {
        Ok(fd)
    }
}

/// Lists the `/dev/fw*` character devices in ascending name order, the
/// order targets get enumerated in.
fn firewire_dev_paths() -> Result<Vec<PathBuf>> {
    let entries =
        fs::read_dir("/dev").map_err(|_| Error::Io("unable to enumerate /dev"))?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("fw"))
                .map_or(false, |n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        })
        .collect();

    paths.sort();
    Ok(paths)
}

/// Pulls the bus-reset state, and optionally the configuration ROM, of an
/// open node.
fn node_info(fd: i32, rom: Option<&mut [u32; ROM_QUADLETS]>) -> Result<FwCdevEventBusReset> {
    let mut reset = FwCdevEventBusReset::default();

    let mut info = FwCdevGetInfo {
        version: FW_CDEV_VERSION,
        bus_reset: &mut reset as *mut _ as u64,
        ..Default::default()
    };

    if let Some(rom) = rom {
        info.rom = rom.as_mut_ptr() as u64;
        info.rom_length = (ROM_QUADLETS * 4) as u32;
    }

    if unsafe { libc::ioctl(fd, FW_CDEV_IOC_GET_INFO, &mut info) } == -1 {
        return Err(Error::Io("get info ioctl failed"));
    }

    Ok(reset)
}

/// Reads a sysfs property of `/dev/fw<n>` as a trimmed string.
fn sysfs_prop(devname: &str, prop: &str) -> Option<String> {
    let path = format!("/sys/bus/firewire/devices/{}/{}", devname, prop);
    let mut value = fs::read_to_string(path).ok()?;

    while value.ends_with('\n') {
        value.pop();
    }

    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Parses a sysfs id property; these come as `0x`-prefixed hex or plain
/// decimal.
fn parse_sysfs_id(value: &str) -> Option<u32> {
    let value = value.trim();
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

fn sysfs_ident(path: &Path) -> NodeIdent {
    let devname = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return NodeIdent::default(),
    };

    NodeIdent {
        vendor_name: sysfs_prop(devname, "vendor_name"),
        vendor_id: sysfs_prop(devname, "vendor").as_deref().and_then(parse_sysfs_id),
        model_name: sysfs_prop(devname, "model_name"),
        model_id: sysfs_prop(devname, "model").as_deref().and_then(parse_sysfs_id),
    }
}

/// A [`FirewireBackend`] over the firewire-cdev character devices.
pub struct LinuxBackend {
    sbp2_fd: i32,
}

impl LinuxBackend {
    pub fn new() -> Result<Self> {
        Ok(Self { sbp2_fd: -1 })
    }
}

impl FirewireBackend for LinuxBackend {
    fn discover(&mut self) -> Result<Discovery> {
        let mut nodes = Vec::new();
        let mut denied = 0;

        for path in firewire_dev_paths()? {
            let fd = match open_rdwr(&path) {
                Ok(fd) => fd,
                Err(libc::EACCES) | Err(libc::EPERM) => {
                    warn!("no permission to open {}", path.display());
                    denied += 1;
                    continue;
                }
                Err(_) => continue,
            };

            let mut rom = [0u32; ROM_QUADLETS];
            let reset = match node_info(fd, Some(&mut rom)) {
                Ok(reset) => reset,
                Err(_) => {
                    unsafe { libc::close(fd) };
                    continue;
                }
            };

            // Only foreign nodes are of interest here
            if reset.node_id != reset.local_node_id {
                debug!(
                    "found device {} node_id={:x} generation={}",
                    path.display(),
                    reset.node_id,
                    reset.generation
                );

                nodes.push(DiscoveredNode {
                    node_id: reset.node_id as u16,
                    generation: reset.generation,
                    rom,
                    ident: sysfs_ident(&path),
                    handle: Box::new(LinuxDevice {
                        path: path.clone(),
                        fd: -1,
                        generation: reset.generation,
                    }),
                });
            }

            unsafe { libc::close(fd) };
        }

        Ok(Discovery { nodes, denied })
    }

    fn publish_sbp2(&mut self, block: &[u32]) -> Result<()> {
        if self.sbp2_fd != -1 {
            return Ok(());
        }

        let mut denied = 0;

        for path in firewire_dev_paths()? {
            let fd = match open_rdwr(&path) {
                Ok(fd) => fd,
                Err(libc::EACCES) | Err(libc::EPERM) => {
                    denied += 1;
                    continue;
                }
                Err(_) => continue,
            };

            let reset = match node_info(fd, None) {
                Ok(reset) => reset,
                Err(_) => {
                    unsafe { libc::close(fd) };
                    continue;
                }
            };

            if reset.node_id == reset.local_node_id {
                let mut desc = FwCdevAddDescriptor {
                    immediate: 0,
                    key: CSR_UNIT_DIRECTORY_KEY,
                    data: block.as_ptr() as u64,
                    length: block.len() as u32,
                    handle: 0,
                };

                if unsafe { libc::ioctl(fd, FW_CDEV_IOC_ADD_DESCRIPTOR, &mut desc) } == -1 {
                    unsafe { libc::close(fd) };
                    return Err(Error::Io("add descriptor ioctl failed"));
                }

                info!("unit directory installed via {}", path.display());

                // The descriptor stays published for as long as this fd
                // stays open
                self.sbp2_fd = fd;
                return Ok(());
            }

            unsafe { libc::close(fd) };
        }

        Err(if denied > 0 {
            Error::NoPerm
        } else {
            Error::Io("no local firewire node found")
        })
    }

    fn unpublish_sbp2(&mut self) {
        if self.sbp2_fd != -1 {
            unsafe { libc::close(self.sbp2_fd) };
            self.sbp2_fd = -1;
        }
    }
}

impl Drop for LinuxBackend {
    fn drop(&mut self) {
        self.unpublish_sbp2();
    }
}

struct LinuxDevice {
    path: PathBuf,
    fd: i32,
    generation: u32,
}

impl BackendDevice for LinuxDevice {
    fn open(&mut self) -> Result<()> {
        if self.fd != -1 {
            return Ok(());
        }

        self.fd = open_rdwr(&self.path).map_err(|_| Error::Io("unable to open device"))?;
        Ok(())
    }

    fn close(&mut self) {
        if self.fd != -1 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }

    fn read_pipeline(&self) -> usize {
        1
    }

    fn write_pipeline(&self) -> usize {
        1
    }

    fn submit(&mut self, xfer: &Transaction) -> Result<()> {
        let mut request = FwCdevSendRequest {
            tcode: xfer.tcode as u32,
            length: xfer.length as u32,
            offset: xfer.addr.as_u64(),
            closure: xfer.closure,
            data: xfer.data.map_or(0, |d| d.as_ptr() as u64),
            generation: self.generation,
        };

        if unsafe { libc::ioctl(self.fd, FW_CDEV_IOC_SEND_REQUEST, &mut request) } == -1 {
            return Err(match errno() {
                libc::E2BIG | libc::EINVAL => Error::IoSize,
                _ => Error::Io("send request ioctl failed"),
            });
        }

        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> Result<Completion> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => return Err(Error::IoTimeout),
            };

            let mut pfd = libc::pollfd {
                fd: self.fd,
                events: libc::POLLIN,
                revents: 0,
            };

            let ready = unsafe { libc::poll(&mut pfd, 1, remaining.as_millis() as i32) };
            if ready == -1 {
                if errno() == libc::EINTR {
                    continue;
                }
                return Err(Error::Io("poll failed"));
            }
            if ready == 0 {
                return Err(Error::IoTimeout);
            }

            let mut buf = EventBuf([0u8; 16 * 1024]);
            let len = unsafe {
                libc::read(
                    self.fd,
                    buf.0.as_mut_ptr() as *mut libc::c_void,
                    buf.0.len(),
                )
            };
            if len == -1 {
                return Err(Error::Io("unable to read event"));
            }
            if (len as usize) < mem::size_of::<FwCdevEventCommon>() {
                continue;
            }

            let common = unsafe { &*(buf.0.as_ptr() as *const FwCdevEventCommon) };

            match common.type_ {
                FW_CDEV_EVENT_RESPONSE => {
                    let response = unsafe { &*(buf.0.as_ptr() as *const FwCdevEventResponse) };
                    let data = unsafe {
                        slice::from_raw_parts(
                            response.data.as_ptr() as *const u8,
                            response.length as usize,
                        )
                    }
                    .to_vec();

                    return Ok(Completion {
                        closure: response.closure,
                        code: response_code(response.rcode),
                        data,
                    });
                }
                // Bus resets surface through stale-generation responses;
                // the notification event itself is not interesting here
                FW_CDEV_EVENT_BUS_RESET => continue,
                _ => continue,
            }
        }
    }

    fn cancel_pending(&mut self) {
        // Only one request is ever outstanding on this stack
    }
}

impl Drop for LinuxDevice {
    fn drop(&mut self) {
        self.close();
    }
}

fn response_code(rcode: u32) -> ResponseCode {
    match rcode {
        RCODE_COMPLETE => ResponseCode::Complete,
        RCODE_BUSY => ResponseCode::Busy,
        RCODE_GENERATION => ResponseCode::Generation,
        other => ResponseCode::Other(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioctl_numbers() {
        // Reference values from linux/firewire-cdev.h
        assert_eq!(FW_CDEV_IOC_GET_INFO, 0xc028_2300);
        assert_eq!(FW_CDEV_IOC_SEND_REQUEST, 0x4028_2301);
        assert_eq!(FW_CDEV_IOC_ADD_DESCRIPTOR, 0xc018_2306);
    }

    #[test]
    fn test_parse_sysfs_id() {
        assert_eq!(parse_sysfs_id("0x00609e"), Some(0x609e));
        assert_eq!(parse_sysfs_id("0X1F2"), Some(0x1f2));
        assert_eq!(parse_sysfs_id(" 42 "), Some(42));
        assert_eq!(parse_sysfs_id("bogus"), None);
    }

    #[test]
    fn test_response_code_mapping() {
        assert_eq!(response_code(0x00), ResponseCode::Complete);
        assert_eq!(response_code(0x12), ResponseCode::Busy);
        assert_eq!(response_code(0x13), ResponseCode::Generation);
        assert_eq!(response_code(0x04), ResponseCode::Other(0x04));
    }
}
