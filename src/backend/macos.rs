/*!
Backend for Mac OS X, on top of IOKit and the IOFireWireLib plug-in.

Foreign nodes are matched as `IOFireWireDevice` in the I/O registry, the
local controller as `IOFireWireLocalNode`. Identity comes from registry
properties; the configuration ROM arrives big-endian in the
`FireWire Device ROM / Offset 0` property and is byte-swapped on ingest.

Transactions run through preallocated asynchronous command objects (four
reads, one write). Their completion callbacks are dispatched while the
calling thread runs its run loop in a private mode, which [`wait`]
(BackendDevice::wait) spins for up to the request timeout. Cancellation
aborts any command object still executing.
*/

use std::cell::RefCell;
use std::collections::VecDeque;
use std::ffi::CString;
use std::os::raw::{c_char, c_void};
use std::ptr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, warn};

use core_foundation_sys::base::{kCFAllocatorDefault, CFGetTypeID, CFRelease, CFTypeRef};
use core_foundation_sys::data::{CFDataGetBytes, CFDataGetLength, CFDataGetTypeID, CFDataRef};
use core_foundation_sys::dictionary::{
    CFDictionaryGetTypeID, CFDictionaryGetValue, CFDictionaryRef, CFMutableDictionaryRef,
};
use core_foundation_sys::number::{
    kCFNumberSInt32Type, CFNumberGetTypeID, CFNumberGetValue, CFNumberRef,
};
use core_foundation_sys::runloop::{CFRunLoopGetCurrent, CFRunLoopRunInMode};
use core_foundation_sys::string::{
    kCFStringEncodingUTF8, CFStringCreateWithCString, CFStringGetCString, CFStringGetTypeID,
    CFStringRef,
};
use core_foundation_sys::uuid::{CFUUIDBytes, CFUUIDGetConstantUUIDWithBytes, CFUUIDGetUUIDBytes};

use super::{
    BackendDevice, Completion, DiscoveredNode, Discovery, FirewireBackend, NodeIdent,
    ResponseCode, Transaction,
};
use crate::csr::{DEFAULT_MAX_REQUEST, ROM_QUADLETS};
use crate::error::{Error, Result};

// Hand-rolled subset of IOKitLib.h and IOFireWireLib.h.
mod ffi {
    use super::*;

    pub type MachPortT = u32;
    pub type IoObjectT = MachPortT;
    pub type IoIteratorT = IoObjectT;
    pub type KernReturnT = i32;
    pub type IoReturnT = i32;
    pub type Boolean = u8;

    pub const KIO_RETURN_SUCCESS: IoReturnT = 0;

    // sys_iokit | sub_iokit_firewire
    const FW_ERR_BASE: u32 = 0xe000_8000;
    // kIOFireWireBusReset: the command's generation no longer matches the bus
    pub const KIO_FIREWIRE_BUS_RESET: u32 = FW_ERR_BASE | 0x04;
    // kIOFireWireResponseBase + rcode encodes the wire response
    pub const KIO_FIREWIRE_RESPONSE_BASE: u32 = FW_ERR_BASE | 0x10;
    pub const RCODE_BUSY: u32 = 0x12;

    #[repr(C)]
    #[derive(Copy, Clone, Default)]
    pub struct FwAddress {
        pub node_id: u16,
        pub address_hi: u16,
        pub address_lo: u32,
    }

    pub type CommandCallback = unsafe extern "C" fn(refcon: *mut c_void, status: IoReturnT);

    #[link(name = "IOKit", kind = "framework")]
    extern "C" {
        pub static kIOMasterPortDefault: MachPortT;

        pub fn IOServiceMatching(name: *const c_char) -> CFMutableDictionaryRef;
        pub fn IOServiceGetMatchingServices(
            master_port: MachPortT,
            matching: CFDictionaryRef,
            existing: *mut IoIteratorT,
        ) -> KernReturnT;
        pub fn IOIteratorNext(iterator: IoIteratorT) -> IoObjectT;
        pub fn IOObjectRelease(object: IoObjectT) -> KernReturnT;
        pub fn IORegistryEntryCreateCFProperty(
            entry: IoObjectT,
            key: CFStringRef,
            allocator: *const c_void,
            options: u32,
        ) -> CFTypeRef;
        pub fn IOCreatePlugInInterfaceForService(
            service: IoObjectT,
            plugin_type: *const c_void,
            interface_type: *const c_void,
            interface: *mut *mut *mut IoCfPlugInInterface,
            score: *mut i32,
        ) -> KernReturnT;
        pub fn IODestroyPlugInInterface(interface: *mut *mut IoCfPlugInInterface) -> KernReturnT;
    }

    #[repr(C)]
    pub struct IoCfPlugInInterface {
        pub _reserved: *mut c_void,
        pub query_interface:
            unsafe extern "C" fn(*mut c_void, CFUUIDBytes, *mut *mut c_void) -> i32,
        pub add_ref: unsafe extern "C" fn(*mut c_void) -> u32,
        pub release: unsafe extern "C" fn(*mut c_void) -> u32,
        pub version: u16,
        pub revision: u16,
        pub probe: *mut c_void,
        pub start: *mut c_void,
        pub stop: *mut c_void,
    }

    /// IOFireWireDeviceInterface through v4, the vtable prefix this
    /// backend dispatches into.
    #[repr(C)]
    pub struct DeviceInterface {
        pub _reserved: *mut c_void,
        pub query_interface:
            unsafe extern "C" fn(*mut c_void, CFUUIDBytes, *mut *mut c_void) -> i32,
        pub add_ref: unsafe extern "C" fn(*mut c_void) -> u32,
        pub release: unsafe extern "C" fn(*mut c_void) -> u32,
        pub version: u32,
        pub revision: u32,

        pub interface_is_inited: unsafe extern "C" fn(DeviceRef) -> Boolean,
        pub get_device: unsafe extern "C" fn(DeviceRef) -> IoObjectT,
        pub open: unsafe extern "C" fn(DeviceRef) -> IoReturnT,
        pub open_with_session_ref: *mut c_void,
        pub close: unsafe extern "C" fn(DeviceRef),
        pub notification_is_on: unsafe extern "C" fn(DeviceRef) -> Boolean,
        pub add_callback_dispatcher_to_run_loop:
            unsafe extern "C" fn(DeviceRef, *mut c_void) -> IoReturnT,
        pub remove_callback_dispatcher_from_run_loop: unsafe extern "C" fn(DeviceRef),
        pub turn_on_notification: unsafe extern "C" fn(DeviceRef) -> Boolean,
        pub turn_off_notification: unsafe extern "C" fn(DeviceRef),
        pub set_bus_reset_handler: *mut c_void,
        pub set_bus_reset_done_handler: *mut c_void,
        pub client_command_is_complete: *mut c_void,

        pub read: unsafe extern "C" fn(
            DeviceRef,
            IoObjectT,
            *const FwAddress,
            *mut c_void,
            *mut u32,
            Boolean,
            u32,
        ) -> IoReturnT,
        pub read_quadlet: *mut c_void,
        pub write: unsafe extern "C" fn(
            DeviceRef,
            IoObjectT,
            *const FwAddress,
            *const c_void,
            *mut u32,
            Boolean,
            u32,
        ) -> IoReturnT,
        pub write_quadlet: *mut c_void,
        pub compare_swap: *mut c_void,

        pub create_read_command: unsafe extern "C" fn(
            DeviceRef,
            IoObjectT,
            *const FwAddress,
            *mut c_void,
            u32,
            CommandCallback,
            Boolean,
            u32,
            *mut c_void,
            CFUUIDBytes,
        ) -> CommandRef,
        pub create_read_quadlet_command: *mut c_void,
        pub create_write_command: unsafe extern "C" fn(
            DeviceRef,
            IoObjectT,
            *const FwAddress,
            *mut c_void,
            u32,
            CommandCallback,
            Boolean,
            u32,
            *mut c_void,
            CFUUIDBytes,
        ) -> CommandRef,
        pub create_write_quadlet_command: *mut c_void,
        pub create_compare_swap_command: *mut c_void,

        pub bus_reset: *mut c_void,
        pub get_cycle_time: *mut c_void,
        pub get_generation_and_node_id: *mut c_void,
        pub get_local_node_id: *mut c_void,
        pub get_reset_time: *mut c_void,

        pub create_local_unit_directory: unsafe extern "C" fn(DeviceRef, CFUUIDBytes) -> UnitDirRef,
        pub get_config_directory: *mut c_void,
        pub create_config_directory_with_io_object: *mut c_void,

        pub create_pseudo_address_space: *mut c_void,
        pub create_physical_address_space: *mut c_void,

        pub fire_bug_msg: *mut c_void,

        // v2
        pub add_isoch_callback_dispatcher_to_run_loop: *mut c_void,
        pub create_isoch_channel: *mut c_void,
        pub create_local_isoch_port: *mut c_void,
        pub create_remote_isoch_port: *mut c_void,
        pub create_dcl_command_pool: *mut c_void,
        pub get_ref_con: *mut c_void,
        pub set_ref_con: *mut c_void,
        pub get_debug_property: *mut c_void,
        pub print_dcl_program: *mut c_void,

        // v3
        pub create_pseudo_address_space_in_initial_units: *mut c_void,

        // v4
        pub add_callback_dispatcher_to_run_loop_for_mode:
            unsafe extern "C" fn(DeviceRef, *mut c_void, CFStringRef) -> IoReturnT,
        pub add_isoch_callback_dispatcher_to_run_loop_for_mode: *mut c_void,
        pub remove_isoch_callback_dispatcher_from_run_loop: *mut c_void,
        pub is_opened_by_session_ref: *mut c_void,
        pub get_bus_generation: unsafe extern "C" fn(DeviceRef, *mut u32) -> IoReturnT,
        pub get_local_node_id_with_generation: *mut c_void,
        pub get_remote_node_id: unsafe extern "C" fn(DeviceRef, u32, *mut u16) -> IoReturnT,
        pub get_speed_to_node: *mut c_void,
        pub get_speed_between_nodes: *mut c_void,
    }

    pub type DeviceRef = *mut *mut DeviceInterface;

    #[repr(C)]
    pub struct CommandInterface {
        pub _reserved: *mut c_void,
        pub query_interface:
            unsafe extern "C" fn(*mut c_void, CFUUIDBytes, *mut *mut c_void) -> i32,
        pub add_ref: unsafe extern "C" fn(*mut c_void) -> u32,
        pub release: unsafe extern "C" fn(*mut c_void) -> u32,
        pub version: u32,
        pub revision: u32,

        pub get_status: unsafe extern "C" fn(CommandRef) -> IoReturnT,
        pub get_transferred_bytes: unsafe extern "C" fn(CommandRef) -> u32,
        pub get_target_address: *mut c_void,
        pub set_target: unsafe extern "C" fn(CommandRef, *const FwAddress),
        pub set_generation: unsafe extern "C" fn(CommandRef, u32),
        pub set_callback: *mut c_void,
        pub set_ref_con: unsafe extern "C" fn(CommandRef, *mut c_void),
        pub is_executing: unsafe extern "C" fn(CommandRef) -> Boolean,
        pub submit: unsafe extern "C" fn(CommandRef) -> IoReturnT,
        pub submit_with_refcon_and_callback: *mut c_void,
        pub cancel: unsafe extern "C" fn(CommandRef, IoReturnT) -> IoReturnT,

        // v2
        pub set_buffer: unsafe extern "C" fn(CommandRef, u32, *mut c_void),
        pub get_buffer: *mut c_void,
        pub set_max_packet: *mut c_void,
        pub set_flags: *mut c_void,
    }

    pub type CommandRef = *mut *mut CommandInterface;

    #[repr(C)]
    pub struct UnitDirInterface {
        pub _reserved: *mut c_void,
        pub query_interface:
            unsafe extern "C" fn(*mut c_void, CFUUIDBytes, *mut *mut c_void) -> i32,
        pub add_ref: unsafe extern "C" fn(*mut c_void) -> u32,
        pub release: unsafe extern "C" fn(*mut c_void) -> u32,
        pub version: u32,
        pub revision: u32,

        pub add_entry_ptr: *mut c_void,
        pub add_entry_u32: unsafe extern "C" fn(UnitDirRef, i32, u32, CFStringRef) -> IoReturnT,
        pub add_entry_fw_address: *mut c_void,
        pub publish: unsafe extern "C" fn(UnitDirRef) -> IoReturnT,
        pub unpublish: unsafe extern "C" fn(UnitDirRef) -> IoReturnT,
    }

    pub type UnitDirRef = *mut *mut UnitDirInterface;

    macro_rules! uuid {
        ($name:ident, $($byte:literal),+) => {
            pub unsafe fn $name() -> CFUUIDBytes {
                CFUUIDGetUUIDBytes(CFUUIDGetConstantUUIDWithBytes(
                    ptr::null(),
                    $($byte),+
                ))
            }
        };
    }

    uuid!(
        kio_firewire_device_interface_id_v4,
        0xCE, 0x41, 0x66, 0x28, 0xAE, 0x59, 0x11, 0xD6, 0x8A, 0x43, 0x00, 0x03, 0x93, 0x8B,
        0xEB, 0x0A
    );
    uuid!(
        kio_firewire_local_unit_directory_interface_id,
        0x1B, 0xBC, 0xA9, 0x94, 0xBC, 0x7D, 0x11, 0xD4, 0x9B, 0x58, 0x00, 0x0A, 0x27, 0x78,
        0x7A, 0x50
    );
    uuid!(
        kio_firewire_read_command_interface_id_v3,
        0x15, 0x9E, 0x92, 0x32, 0x5E, 0x64, 0x11, 0xD6, 0xB2, 0xE2, 0x00, 0x03, 0x93, 0x8B,
        0xEB, 0x0A
    );
    uuid!(
        kio_firewire_write_command_interface_id_v3,
        0x42, 0xA2, 0x4E, 0x52, 0x5E, 0x64, 0x11, 0xD6, 0x91, 0xB2, 0x00, 0x03, 0x93, 0x8B,
        0xEB, 0x0A
    );

    pub fn plugin_type_uuid() -> *const c_void {
        unsafe {
            CFUUIDGetConstantUUIDWithBytes(
                ptr::null(),
                0xB8, 0x0B, 0xE4, 0xA8, 0xBC, 0x7D, 0x11, 0xD4, 0xAB, 0x4F, 0x00, 0x0A, 0x27,
                0x78, 0x7A, 0x50,
            ) as *const c_void
        }
    }

    pub fn cf_plugin_interface_uuid() -> *const c_void {
        unsafe {
            CFUUIDGetConstantUUIDWithBytes(
                ptr::null(),
                0xC2, 0x44, 0xE8, 0x58, 0x10, 0x9C, 0x11, 0xD4, 0x91, 0xD4, 0x00, 0x50, 0xE4,
                0xC6, 0x42, 0x6F,
            ) as *const c_void
        }
    }
}

use ffi::*;

const READ_PIPELINE: usize = 4;
const WRITE_PIPELINE: usize = 1;

/// The private run-loop mode completions are dispatched in while waiting.
const RUN_LOOP_MODE: &str = "fireflowCompletion";

fn cfstr(s: &str) -> CFStringRef {
    let cstr = CString::new(s).unwrap();
    unsafe {
        CFStringCreateWithCString(kCFAllocatorDefault, cstr.as_ptr(), kCFStringEncodingUTF8)
    }
}

/// Reads a string property off a registry entry.
fn property_string(entry: IoObjectT, name: &str) -> Option<String> {
    let key = cfstr(name);
    let value =
        unsafe { IORegistryEntryCreateCFProperty(entry, key, ptr::null(), 0) };
    unsafe { CFRelease(key as CFTypeRef) };

    if value.is_null() {
        return None;
    }

    let result = unsafe {
        if CFGetTypeID(value) == CFStringGetTypeID() {
            let mut buf = [0u8; 256];
            if CFStringGetCString(
                value as CFStringRef,
                buf.as_mut_ptr() as *mut c_char,
                buf.len() as isize,
                kCFStringEncodingUTF8,
            ) != 0
            {
                let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
                Some(String::from_utf8_lossy(&buf[..len]).into_owned())
            } else {
                None
            }
        } else {
            None
        }
    };

    unsafe { CFRelease(value) };
    result
}

/// Reads an integer property off a registry entry.
fn property_u32(entry: IoObjectT, name: &str) -> Option<u32> {
    let key = cfstr(name);
    let value =
        unsafe { IORegistryEntryCreateCFProperty(entry, key, ptr::null(), 0) };
    unsafe { CFRelease(key as CFTypeRef) };

    if value.is_null() {
        return None;
    }

    let result = unsafe {
        if CFGetTypeID(value) == CFNumberGetTypeID() {
            let mut num: i32 = 0;
            if CFNumberGetValue(
                value as CFNumberRef,
                kCFNumberSInt32Type,
                &mut num as *mut i32 as *mut c_void,
            ) != 0
            {
                Some(num as u32)
            } else {
                None
            }
        } else {
            None
        }
    };

    unsafe { CFRelease(value) };
    result
}

/// Reads the configuration ROM out of the `FireWire Device ROM` dictionary.
/// The bytes arrive big-endian and are swapped into host quadlets.
fn property_rom(entry: IoObjectT) -> [u32; ROM_QUADLETS] {
    let mut rom = [0u32; ROM_QUADLETS];

    let key = cfstr("FireWire Device ROM");
    let dict = unsafe { IORegistryEntryCreateCFProperty(entry, key, ptr::null(), 0) };
    unsafe { CFRelease(key as CFTypeRef) };

    if dict.is_null() {
        return rom;
    }

    unsafe {
        if CFGetTypeID(dict) == CFDictionaryGetTypeID() {
            let offset_key = cfstr("Offset 0");
            let data =
                CFDictionaryGetValue(dict as CFDictionaryRef, offset_key as *const c_void);
            CFRelease(offset_key as CFTypeRef);

            if !data.is_null() && CFGetTypeID(data as CFTypeRef) == CFDataGetTypeID() {
                let data = data as CFDataRef;
                let len = (CFDataGetLength(data) as usize).min(ROM_QUADLETS * 4);

                let mut bytes = [0u8; ROM_QUADLETS * 4];
                CFDataGetBytes(
                    data,
                    core_foundation_sys::base::CFRange {
                        location: 0,
                        length: len as isize,
                    },
                    bytes.as_mut_ptr(),
                );

                for (i, quadlet) in rom.iter_mut().enumerate().take(len / 4) {
                    *quadlet = BigEndian::read_u32(&bytes[i * 4..]);
                }
            }
        }

        CFRelease(dict);
    }

    rom
}

/// Obtains a FireWire device interface for a registry service.
fn device_interface(service: IoObjectT) -> Option<DeviceRef> {
    let mut plugin: *mut *mut IoCfPlugInInterface = ptr::null_mut();
    let mut score = 0i32;

    let kr = unsafe {
        IOCreatePlugInInterfaceForService(
            service,
            plugin_type_uuid(),
            cf_plugin_interface_uuid(),
            &mut plugin,
            &mut score,
        )
    };
    if kr != KIO_RETURN_SUCCESS || plugin.is_null() {
        return None;
    }

    let mut intrf: *mut c_void = ptr::null_mut();
    let hr = unsafe {
        ((**plugin).query_interface)(
            plugin as *mut c_void,
            kio_firewire_device_interface_id_v4(),
            &mut intrf,
        )
    };

    unsafe { IODestroyPlugInInterface(plugin) };

    if hr != 0 || intrf.is_null() {
        return None;
    }

    Some(intrf as DeviceRef)
}

fn matching_services(class: &str) -> Result<Vec<IoObjectT>> {
    let cname = CString::new(class).unwrap();
    let matching = unsafe { IOServiceMatching(cname.as_ptr()) };

    let mut iterator: IoIteratorT = 0;
    let kr = unsafe {
        IOServiceGetMatchingServices(kIOMasterPortDefault, matching, &mut iterator)
    };
    if kr != KIO_RETURN_SUCCESS {
        return Err(Error::Io("unable to query the io registry"));
    }

    let mut services = Vec::new();
    loop {
        let service = unsafe { IOIteratorNext(iterator) };
        if service == 0 {
            break;
        }
        services.push(service);
    }

    unsafe { IOObjectRelease(iterator) };
    Ok(services)
}

/// A [`FirewireBackend`] over IOKit.
pub struct IokitBackend {
    local: Option<LocalNode>,
}

struct LocalNode {
    device: DeviceRef,
    unit_dir: UnitDirRef,
}

impl IokitBackend {
    pub fn new() -> Result<Self> {
        Ok(Self { local: None })
    }
}

impl FirewireBackend for IokitBackend {
    fn discover(&mut self) -> Result<Discovery> {
        let mut nodes = Vec::new();
        let mut denied = 0;

        for service in matching_services("IOFireWireDevice")? {
            let intrf = match device_interface(service) {
                Some(intrf) => intrf,
                None => {
                    warn!("unable to obtain an interface for a firewire device");
                    denied += 1;
                    unsafe { IOObjectRelease(service) };
                    continue;
                }
            };

            unsafe { ((**intrf).interface_is_inited)(intrf) };

            let mut generation = 0u32;
            let mut node_id = 0u16;
            unsafe {
                ((**intrf).get_bus_generation)(intrf, &mut generation);
                ((**intrf).get_remote_node_id)(intrf, generation, &mut node_id);
            }

            let ident = NodeIdent {
                vendor_name: property_string(service, "FireWire Vendor Name"),
                vendor_id: property_u32(service, "FireWire Vendor ID"),
                model_name: property_string(service, "FireWire Product Name"),
                model_id: property_u32(service, "FireWire Product ID"),
            };

            let rom = property_rom(service);

            debug!("found device node_id={:x} generation={}", node_id, generation);

            nodes.push(DiscoveredNode {
                node_id,
                generation,
                rom,
                ident,
                handle: Box::new(IokitDevice {
                    intrf,
                    service,
                    generation,
                    open: false,
                    run_loop_mode: ptr::null(),
                    slots: Vec::new(),
                    completions: Rc::new(RefCell::new(VecDeque::new())),
                }),
            });
        }

        Ok(Discovery { nodes, denied })
    }

    fn publish_sbp2(&mut self, block: &[u32]) -> Result<()> {
        if self.local.is_some() {
            return Ok(());
        }

        let services = matching_services("IOFireWireLocalNode")?;
        let service = match services.first() {
            Some(&service) => service,
            None => return Err(Error::Io("no local firewire node found")),
        };

        let device = device_interface(service)
            .ok_or(Error::NoPerm)?;
        for &extra in &services[1..] {
            unsafe { IOObjectRelease(extra) };
        }
        unsafe { IOObjectRelease(service) };

        unsafe {
            if ((**device).open)(device) != KIO_RETURN_SUCCESS {
                ((**device).release)(device as *mut c_void);
                return Err(Error::Io("unable to open the local node"));
            }

            let unit_dir = ((**device).create_local_unit_directory)(
                device,
                kio_firewire_local_unit_directory_interface_id(),
            );
            if unit_dir.is_null() {
                ((**device).close)(device);
                ((**device).release)(device as *mut c_void);
                return Err(Error::Io("unable to create a local unit directory"));
            }

            // The pre-formed block leads with the header quadlet; entries
            // go in one by one here
            for &entry in &block[1..] {
                ((**unit_dir).add_entry_u32)(
                    unit_dir,
                    (entry >> 24) as i32,
                    entry & 0x00ff_ffff,
                    ptr::null(),
                );
            }

            ((**unit_dir).publish)(unit_dir);

            info!("unit directory published on the local node");
            self.local = Some(LocalNode { device, unit_dir });
        }

        Ok(())
    }

    fn unpublish_sbp2(&mut self) {
        if let Some(local) = self.local.take() {
            unsafe {
                ((**local.unit_dir).unpublish)(local.unit_dir);
                ((**local.unit_dir).release)(local.unit_dir as *mut c_void);

                ((**local.device).close)(local.device);
                ((**local.device).release)(local.device as *mut c_void);
            }
        }
    }
}

impl Drop for IokitBackend {
    fn drop(&mut self) {
        self.unpublish_sbp2();
    }
}

/// Shared between a command slot and its completion callback.
struct SlotShared {
    completions: Rc<RefCell<VecDeque<Completion>>>,
    closure: u64,
    length: usize,
    is_read: bool,
    scratch: Vec<u8>,
    busy: bool,
}

struct CmdSlot {
    cmd: CommandRef,
    shared: Box<RefCell<SlotShared>>,
    is_read: bool,
}

unsafe extern "C" fn command_complete(refcon: *mut c_void, status: IoReturnT) {
    let shared = &*(refcon as *const RefCell<SlotShared>);
    let mut shared = shared.borrow_mut();

    let code = response_code(status);
    let data = if shared.is_read && code == ResponseCode::Complete {
        shared.scratch[..shared.length].to_vec()
    } else {
        Vec::new()
    };

    let completion = Completion {
        closure: shared.closure,
        code,
        data,
    };

    shared.busy = false;
    shared.completions.borrow_mut().push_back(completion);
}

fn response_code(status: IoReturnT) -> ResponseCode {
    let status = status as u32;
    if status == KIO_RETURN_SUCCESS as u32 {
        ResponseCode::Complete
    } else if status == KIO_FIREWIRE_BUS_RESET {
        ResponseCode::Generation
    } else if status == KIO_FIREWIRE_RESPONSE_BASE + RCODE_BUSY {
        ResponseCode::Busy
    } else {
        ResponseCode::Other(status)
    }
}

struct IokitDevice {
    intrf: DeviceRef,
    service: IoObjectT,
    generation: u32,
    open: bool,
    run_loop_mode: CFStringRef,
    slots: Vec<CmdSlot>,
    completions: Rc<RefCell<VecDeque<Completion>>>,
}

impl IokitDevice {
    /// Preallocates one command object.
    unsafe fn make_slot(&mut self, is_read: bool) -> Result<CmdSlot> {
        let shared = Box::new(RefCell::new(SlotShared {
            completions: self.completions.clone(),
            closure: 0,
            length: 0,
            is_read,
            scratch: vec![0u8; DEFAULT_MAX_REQUEST.max(4096)],
            busy: false,
        }));
        let refcon = &*shared as *const RefCell<SlotShared> as *mut c_void;

        let addr = FwAddress::default();
        let buf = shared.borrow_mut().scratch.as_mut_ptr() as *mut c_void;
        let len = shared.borrow().scratch.len() as u32;

        let cmd = if is_read {
            ((**self.intrf).create_read_command)(
                self.intrf,
                self.service,
                &addr,
                buf,
                len,
                command_complete,
                0,
                self.generation,
                refcon,
                kio_firewire_read_command_interface_id_v3(),
            )
        } else {
            ((**self.intrf).create_write_command)(
                self.intrf,
                self.service,
                &addr,
                buf,
                len,
                command_complete,
                0,
                self.generation,
                refcon,
                kio_firewire_write_command_interface_id_v3(),
            )
        };

        if cmd.is_null() {
            return Err(Error::Io("unable to allocate a command object"));
        }

        Ok(CmdSlot {
            cmd,
            shared,
            is_read,
        })
    }
}

impl BackendDevice for IokitDevice {
    fn open(&mut self) -> Result<()> {
        if self.open {
            return Ok(());
        }

        unsafe {
            if ((**self.intrf).open)(self.intrf) != KIO_RETURN_SUCCESS {
                return Err(Error::Io("unable to open device"));
            }

            self.run_loop_mode = cfstr(RUN_LOOP_MODE);
            ((**self.intrf).add_callback_dispatcher_to_run_loop_for_mode)(
                self.intrf,
                CFRunLoopGetCurrent() as *mut c_void,
                self.run_loop_mode,
            );
            ((**self.intrf).turn_on_notification)(self.intrf);

            for _ in 0..READ_PIPELINE {
                let slot = self.make_slot(true)?;
                self.slots.push(slot);
            }
            for _ in 0..WRITE_PIPELINE {
                let slot = self.make_slot(false)?;
                self.slots.push(slot);
            }
        }

        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }

        self.cancel_pending();

        unsafe {
            for slot in self.slots.drain(..) {
                ((**slot.cmd).release)(slot.cmd as *mut c_void);
            }

            ((**self.intrf).turn_off_notification)(self.intrf);
            ((**self.intrf).remove_callback_dispatcher_from_run_loop)(self.intrf);

            if !self.run_loop_mode.is_null() {
                CFRelease(self.run_loop_mode as CFTypeRef);
                self.run_loop_mode = ptr::null();
            }

            ((**self.intrf).close)(self.intrf);
        }

        self.completions.borrow_mut().clear();
        self.open = false;
    }

    fn read_pipeline(&self) -> usize {
        READ_PIPELINE
    }

    fn write_pipeline(&self) -> usize {
        WRITE_PIPELINE
    }

    fn submit(&mut self, xfer: &Transaction) -> Result<()> {
        let is_read = xfer.tcode.is_read();

        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.is_read == is_read && !s.shared.borrow().busy)
            .ok_or(Error::Io("command pipeline exhausted"))?;

        {
            let mut shared = slot.shared.borrow_mut();
            if xfer.length > shared.scratch.len() {
                return Err(Error::IoSize);
            }

            shared.closure = xfer.closure;
            shared.length = xfer.length;
            if let Some(data) = xfer.data {
                shared.scratch[..data.len()].copy_from_slice(data);
            }
            shared.busy = true;
        }

        let addr = FwAddress {
            node_id: 0,
            address_hi: (xfer.addr.as_u64() >> 32) as u16,
            address_lo: xfer.addr.as_u64() as u32,
        };

        let status = unsafe {
            let buf = slot.shared.borrow_mut().scratch.as_mut_ptr() as *mut c_void;
            ((**slot.cmd).set_target)(slot.cmd, &addr);
            ((**slot.cmd).set_buffer)(slot.cmd, xfer.length as u32, buf);
            ((**slot.cmd).set_generation)(slot.cmd, self.generation);
            ((**slot.cmd).submit)(slot.cmd)
        };

        if status != KIO_RETURN_SUCCESS {
            slot.shared.borrow_mut().busy = false;
            return Err(Error::Io("unable to submit command"));
        }

        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> Result<Completion> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(completion) = self.completions.borrow_mut().pop_front() {
                return Ok(completion);
            }

            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => return Err(Error::IoTimeout),
            };

            unsafe {
                CFRunLoopRunInMode(self.run_loop_mode, remaining.as_secs_f64(), 1);
            }
        }
    }

    fn cancel_pending(&mut self) {
        unsafe {
            for slot in self.slots.iter_mut() {
                if slot.shared.borrow().busy {
                    ((**slot.cmd).cancel)(slot.cmd, KIO_RETURN_SUCCESS);
                    slot.shared.borrow_mut().busy = false;
                }
            }
        }

        self.completions.borrow_mut().clear();
    }
}

impl Drop for IokitDevice {
    fn drop(&mut self) {
        self.close();

        unsafe {
            ((**self.intrf).release)(self.intrf as *mut c_void);
            IOObjectRelease(self.service);
        }
    }
}
