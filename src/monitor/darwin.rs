// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors
//! macOS device discovery over IOKit.
//!
//! Matching notifications (one per IOKit class of interest) and a global
//! termination notification are registered on an IONotificationPort whose Mach
//! port lives in a port set; a kqueue with an EVFILT_MACHPORT filter on that
//! port set is the monitor's poll handle. `refresh` drains the Mach messages,
//! dispatches them back into IOKit and walks the armed iterators.
//!
//! Device keys are the decimal IORegistry session/entry ID, locations are
//! decoded from the 32-bit USB locationID (top byte: controller index, then
//! one port nibble per hub level).

use std::collections::VecDeque;
use std::ffi::{CStr, c_void};
use std::ops::ControlFlow;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use core_foundation::base::{CFRelease, CFType, TCFType, kCFAllocatorDefault};
use core_foundation::dictionary::CFMutableDictionaryRef;
use core_foundation::number::CFNumber;
use core_foundation::string::{CFString, CFStringRef};
use io_kit_sys::ret::kIOReturnSuccess;
use io_kit_sys::types::{io_iterator_t, io_object_t, io_registry_entry_t};
use io_kit_sys::*;
use log::{debug, warn};
use mach2::mach_port::{mach_port_allocate, mach_port_insert_member};
use mach2::port::{MACH_PORT_NULL, mach_port_t};
use mach2::traps::mach_task_self;

use super::DeviceTable;
use crate::device::{Device, DeviceType, SharedDevice};
use crate::error::{ErrorKind, Result};
use crate::hid_report::parse_report_descriptor;
use crate::match_spec::MatchSet;
use crate::platform::Handle;

const MACH_PORT_RIGHT_PORT_SET: u32 = 3;

/// The USB stack was rewritten around macOS 10.11; the IOKit class names we
/// must match differ between the two generations.
fn uses_new_usb_stack() -> bool
{
	let mut release = [0u8; 64];
	let mut len = release.len();
	let name = c"kern.osrelease";
	let r = unsafe {
		libc::sysctlbyname(
			name.as_ptr(),
			release.as_mut_ptr() as *mut c_void,
			&mut len,
			std::ptr::null_mut(),
			0,
		)
	};
	if r != 0 {
		return true;
	}

	// Darwin 15 == OS X 10.11 (El Capitan)
	let release = CStr::from_bytes_until_nul(&release)
		.ok()
		.and_then(|s| s.to_str().ok())
		.unwrap_or("");
	let major: u32 = release.split('.').next().and_then(|s| s.parse().ok()).unwrap_or(0);
	major >= 15
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind
{
	Attached(DeviceType),
	Terminated,
}

struct PendingIterators
{
	events: VecDeque<(EventKind, io_iterator_t)>,
}

pub(super) struct MonitorBackend
{
	notify_port: IONotificationPortRef,
	port_set: mach_port_t,
	kq: OwnedFd,
	/// Armed notification iterators, (kind, iterator). Kept for the whole
	/// monitor lifetime, releasing one disarms its notification.
	iterators: Vec<(EventKind, io_iterator_t)>,
	started: bool,
}

// IOKit objects are reference-counted kernel handles, usable from any thread
// as long as access is serialized (which the owning Monitor guarantees)
unsafe impl Send for MonitorBackend {}

impl MonitorBackend
{
	pub(super) fn new() -> Result<Self>
	{
		unsafe {
			let notify_port = IONotificationPortCreate(kIOMasterPortDefault);
			if notify_port.is_null() {
				return Err(ErrorKind::System.report("IONotificationPortCreate() failed"));
			}

			let mut port_set: mach_port_t = MACH_PORT_NULL;
			let kr =
				mach_port_allocate(mach_task_self(), MACH_PORT_RIGHT_PORT_SET, &mut port_set);
			if kr != 0 {
				IONotificationPortDestroy(notify_port);
				return Err(ErrorKind::System.report("mach_port_allocate() failed"));
			}

			let mach_port = IONotificationPortGetMachPort(notify_port);
			let kr = mach_port_insert_member(mach_task_self(), mach_port, port_set);
			if kr != 0 {
				IONotificationPortDestroy(notify_port);
				return Err(ErrorKind::System.report("mach_port_insert_member() failed"));
			}

			let kq = libc::kqueue();
			if kq < 0 {
				IONotificationPortDestroy(notify_port);
				return Err(ErrorKind::System
					.report(format!("kqueue() failed: {}", std::io::Error::last_os_error())));
			}
			let kq = OwnedFd::from_raw_fd(kq);

			let event = libc::kevent {
				ident: port_set as usize,
				filter: libc::EVFILT_MACHPORT,
				flags: libc::EV_ADD,
				fflags: 0,
				data: 0,
				udata: std::ptr::null_mut(),
			};
			let r = libc::kevent(
				kq.as_raw_fd(),
				&event,
				1,
				std::ptr::null_mut(),
				0,
				std::ptr::null(),
			);
			if r < 0 {
				IONotificationPortDestroy(notify_port);
				return Err(ErrorKind::System
					.report(format!("kevent() failed: {}", std::io::Error::last_os_error())));
			}

			Ok(Self {
				notify_port,
				port_set,
				kq,
				iterators: Vec::new(),
				started: false,
			})
		}
	}

	pub(super) fn start(&mut self, match_set: &MatchSet, devices: &mut DeviceTable) -> Result<()>
	{
		if self.started {
			return Ok(());
		}

		let new_stack = uses_new_usb_stack();

		let mut classes: Vec<(&str, EventKind)> = Vec::new();
		if match_set.has_type(DeviceType::Hid) {
			let class = if new_stack { "IOUSBHostHIDDevice" } else { "IOHIDDevice" };
			classes.push((class, EventKind::Attached(DeviceType::Hid)));
		}
		if match_set.has_type(DeviceType::Serial) {
			classes.push(("IOSerialBSDClient", EventKind::Attached(DeviceType::Serial)));
		}
		let usb_class = if new_stack { "IOUSBHostDevice" } else { "IOUSBDevice" };
		classes.push((usb_class, EventKind::Terminated));

		for (class, kind) in classes {
			let iterator = self.register_notification(class, kind)?;
			self.iterators.push((kind, iterator));

			// The initial iterator content is the current device set; for the
			// termination notification it only arms the iterator
			let _ = self.drain_iterator(kind, iterator, match_set, devices, &mut None)?;
		}

		self.started = true;
		Ok(())
	}

	fn register_notification(&mut self, class: &str, kind: EventKind) -> Result<io_iterator_t>
	{
		unsafe {
			let matching = IOServiceMatching(
				std::ffi::CString::new(class).unwrap().as_ptr(),
			);
			if matching.is_null() {
				return Err(ErrorKind::System
					.report(format!("IOServiceMatching('{}') failed", class)));
			}

			let notification_type = match kind {
				EventKind::Attached(_) => kIOFirstMatchNotification,
				EventKind::Terminated => kIOTerminatedNotification,
			};

			let mut iterator: io_iterator_t = 0;
			let kr = IOServiceAddMatchingNotification(
				self.notify_port,
				notification_type,
				matching as CFMutableDictionaryRef as *mut _,
				notification_callback,
				std::ptr::null_mut(),
				&mut iterator,
			);
			if kr != kIOReturnSuccess {
				return Err(ErrorKind::System
					.report(format!("IOServiceAddMatchingNotification('{}') failed", class)));
			}

			Ok(iterator)
		}
	}

	pub(super) fn stop(&mut self)
	{
		if !self.started {
			return;
		}

		unsafe {
			for (_, iterator) in self.iterators.drain(..) {
				IOObjectRelease(iterator);
			}
		}
		self.started = false;
	}

	pub(super) fn poll_handle(&self) -> Handle
	{
		self.kq.as_raw_fd()
	}

	pub(super) fn refresh(
		&mut self, match_set: &MatchSet, devices: &mut DeviceTable,
		callback: &mut dyn FnMut(&SharedDevice) -> ControlFlow<()>,
	) -> Result<ControlFlow<()>>
	{
		if !self.started {
			return Ok(ControlFlow::Continue(()));
		}

		self.drain_mach_messages();

		let mut cb = Some(callback);
		let iterators = self.iterators.clone();
		for (kind, iterator) in iterators {
			if self.drain_iterator(kind, iterator, match_set, devices, &mut cb)?.is_break() {
				return Ok(ControlFlow::Break(()));
			}
		}

		Ok(ControlFlow::Continue(()))
	}

	/// Receive pending notification messages so the kqueue handle disarms. The
	/// payloads only say "iterators have content", the walk happens next.
	fn drain_mach_messages(&self)
	{
		#[repr(C)]
		struct RawMessage
		{
			header: mach2::message::mach_msg_header_t,
			body: [u8; 1024],
		}

		unsafe {
			loop {
				let mut msg: RawMessage = std::mem::zeroed();
				let kr = mach2::message::mach_msg(
					&mut msg.header,
					mach2::message::MACH_RCV_MSG | mach2::message::MACH_RCV_TIMEOUT,
					0,
					std::mem::size_of::<RawMessage>() as u32,
					self.port_set,
					0,
					MACH_PORT_NULL,
				);
				if kr != 0 {
					break;
				}
			}
		}
	}

	fn drain_iterator(
		&mut self, kind: EventKind, iterator: io_iterator_t, match_set: &MatchSet,
		devices: &mut DeviceTable,
		callback: &mut Option<&mut dyn FnMut(&SharedDevice) -> ControlFlow<()>>,
	) -> Result<ControlFlow<()>>
	{
		loop {
			let service = unsafe { IOIteratorNext(iterator) };
			if service == 0 {
				return Ok(ControlFlow::Continue(()));
			}

			let flow = match kind {
				EventKind::Attached(dev_type) => {
					let flow = match read_device_information(service, dev_type) {
						Some(mut dev) => match match_set.matches(&dev) {
							Some(tag) => {
								dev.match_tag = tag;
								devices.add(Arc::new(dev), callback.as_deref_mut())
							},
							None => ControlFlow::Continue(()),
						},
						None => ControlFlow::Continue(()),
					};
					flow
				},
				EventKind::Terminated => {
					// Terminations come for the whole USB device; every
					// interface key derives from its session ID
					match registry_entry_id(service) {
						Some(session) => {
							remove_by_session(devices, session, callback.as_deref_mut())
						},
						None => ControlFlow::Continue(()),
					}
				},
			};

			unsafe {
				IOObjectRelease(service);
			}

			if flow.is_break() {
				return Ok(ControlFlow::Break(()));
			}
		}
	}
}

impl Drop for MonitorBackend
{
	fn drop(&mut self)
	{
		self.stop();
		unsafe {
			IONotificationPortDestroy(self.notify_port);
		}
	}
}

/// Interface keys are `<usb session id>/<iface>`, so a termination of the USB
/// device removes every interface sharing the session prefix.
fn remove_by_session(
	devices: &mut DeviceTable, session: u64,
	mut callback: Option<&mut dyn FnMut(&SharedDevice) -> ControlFlow<()>>,
) -> ControlFlow<()>
{
	let prefix = format!("{}/", session);
	let keys = devices.keys_with_prefix(&prefix);
	for key in keys {
		devices.remove(&key, callback.as_deref_mut())?;
	}
	ControlFlow::Continue(())
}

extern "C" fn notification_callback(_refcon: *mut c_void, _iterator: io_iterator_t)
{
	// Nothing to do: refresh() walks the iterators itself, the message receive
	// in drain_mach_messages() is what re-arms the kqueue
}

pub(super) fn enumerate(
	match_set: &MatchSet, callback: &mut dyn FnMut(&SharedDevice) -> ControlFlow<()>,
) -> Result<ControlFlow<()>>
{
	let new_stack = uses_new_usb_stack();

	let mut classes: Vec<(&str, DeviceType)> = Vec::new();
	if match_set.has_type(DeviceType::Hid) {
		classes.push((if new_stack { "IOUSBHostHIDDevice" } else { "IOHIDDevice" }, DeviceType::Hid));
	}
	if match_set.has_type(DeviceType::Serial) {
		classes.push(("IOSerialBSDClient", DeviceType::Serial));
	}

	for (class, dev_type) in classes {
		unsafe {
			let matching =
				IOServiceMatching(std::ffi::CString::new(class).unwrap().as_ptr());
			if matching.is_null() {
				continue;
			}

			let mut iterator: io_iterator_t = 0;
			let kr = IOServiceGetMatchingServices(
				kIOMasterPortDefault,
				matching as CFMutableDictionaryRef as *const _,
				&mut iterator,
			);
			if kr != kIOReturnSuccess {
				return Err(ErrorKind::System
					.report(format!("IOServiceGetMatchingServices('{}') failed", class)));
			}

			loop {
				let service = IOIteratorNext(iterator);
				if service == 0 {
					break;
				}

				let r = match read_device_information(service, dev_type) {
					Some(mut dev) => match match_set.matches(&dev) {
						Some(tag) => {
							dev.match_tag = tag;
							callback(&Arc::new(dev))
						},
						None => ControlFlow::Continue(()),
					},
					None => ControlFlow::Continue(()),
				};

				IOObjectRelease(service);
				if r.is_break() {
					IOObjectRelease(iterator);
					return Ok(ControlFlow::Break(()));
				}
			}

			IOObjectRelease(iterator);
		}
	}

	Ok(ControlFlow::Continue(()))
}

fn registry_entry_id(service: io_object_t) -> Option<u64>
{
	let mut id = 0u64;
	let kr = unsafe { IORegistryEntryGetRegistryEntryID(service, &mut id) };
	(kr == kIOReturnSuccess).then_some(id)
}

fn string_property(entry: io_registry_entry_t, name: &str) -> Option<String>
{
	unsafe {
		let key = CFString::new(name);
		let value = IORegistryEntryCreateCFProperty(
			entry,
			key.as_concrete_TypeRef() as CFStringRef,
			kCFAllocatorDefault,
			0,
		);
		if value.is_null() {
			return None;
		}

		let value = CFType::wrap_under_create_rule(value);
		value.downcast::<CFString>().map(|s| s.to_string())
	}
}

fn number_property(entry: io_registry_entry_t, name: &str) -> Option<i64>
{
	unsafe {
		let key = CFString::new(name);
		let value = IORegistryEntryCreateCFProperty(
			entry,
			key.as_concrete_TypeRef() as CFStringRef,
			kCFAllocatorDefault,
			0,
		);
		if value.is_null() {
			return None;
		}

		let value = CFType::wrap_under_create_rule(value);
		value.downcast::<CFNumber>().and_then(|n| n.to_i64())
	}
}

/// Decode a 32-bit USB locationID: top byte is the controller index, then one
/// port number nibble per hub level (up to 6, zero-terminated).
fn location_from_location_id(location_id: u32) -> String
{
	let mut location = format!("usb-{}", location_id >> 24);
	let mut shift = 20i32;
	while shift >= 0 {
		let port = (location_id >> shift) & 0xF;
		if port == 0 {
			break;
		}
		location.push_str(&format!("-{}", port));
		shift -= 4;
	}
	location
}

/// Walk up the IORegistry to the owning USB device (and interface) entries.
fn usb_ancestors(service: io_object_t) -> Option<(io_registry_entry_t, Option<io_registry_entry_t>)>
{
	unsafe {
		let mut iface: Option<io_registry_entry_t> = None;
		let mut current = service;
		IOObjectRetain(current);

		loop {
			if number_property(current, "bInterfaceNumber").is_some() {
				iface = Some(current);
				IOObjectRetain(current);
			}
			if number_property(current, "locationID").is_some()
				&& number_property(current, "idVendor").is_some()
			{
				return Some((current, iface));
			}

			let mut parent: io_registry_entry_t = 0;
			let plane = c"IOService";
			let kr = IORegistryEntryGetParentEntry(current, plane.as_ptr(), &mut parent);
			IOObjectRelease(current);
			if kr != kIOReturnSuccess {
				if let Some(iface) = iface {
					IOObjectRelease(iface);
				}
				return None;
			}
			current = parent;
		}
	}
}

fn read_device_information(service: io_object_t, dev_type: DeviceType) -> Option<Device>
{
	let (usb_dev, iface) = usb_ancestors(service)?;

	let release = |obj: io_object_t| unsafe {
		IOObjectRelease(obj);
	};

	let result = (|| {
		let session = registry_entry_id(usb_dev)?;
		let iface_number = iface
			.and_then(|iface| number_property(iface, "bInterfaceNumber"))
			.unwrap_or(0) as u8;
		let key = format!("{}/{}", session, iface_number);

		let location_id = number_property(usb_dev, "locationID")? as u32;
		let location = location_from_location_id(location_id);

		// Serial devices are used through their callout node; HID devices have
		// no device node on macOS, the registry path re-opens the service
		let path = match dev_type {
			DeviceType::Serial => string_property(service, "IOCalloutDevice")?,
			DeviceType::Hid => registry_entry_path(service)?,
		};

		let mut dev = Device::new(dev_type, key, location, path);
		dev.vid = number_property(usb_dev, "idVendor")? as u16;
		dev.pid = number_property(usb_dev, "idProduct")? as u16;
		dev.bcd_device = number_property(usb_dev, "bcdDevice").unwrap_or(0) as u16;
		dev.iface_number = iface_number;

		dev.manufacturer = string_property(usb_dev, "USB Vendor Name");
		dev.product = string_property(usb_dev, "USB Product Name");
		dev.serial_number = string_property(usb_dev, "USB Serial Number");

		if dev_type == DeviceType::Hid {
			fill_hid_properties(service, &mut dev);
		}

		Some(dev)
	})();

	release(usb_dev);
	if let Some(iface) = iface {
		release(iface);
	}

	if result.is_none() {
		debug!("Dropping incomplete IOKit device entry");
	}
	result
}

fn registry_entry_path(service: io_object_t) -> Option<String>
{
	let mut buf = [0u8; 512];
	let plane = c"IOService";
	let kr = unsafe {
		IORegistryEntryGetPath(service, plane.as_ptr(), buf.as_mut_ptr() as *mut _)
	};
	if kr != kIOReturnSuccess {
		return None;
	}

	CStr::from_bytes_until_nul(&buf)
		.ok()
		.and_then(|s| s.to_str().ok())
		.map(|s| s.to_string())
}

/// HID usage comes straight from registry properties; the report descriptor
/// is only needed for the numbered-reports flag.
fn fill_hid_properties(service: io_object_t, dev: &mut Device)
{
	dev.hid.usage_page = number_property(service, "PrimaryUsagePage").unwrap_or(0) as u16;
	dev.hid.usage = number_property(service, "PrimaryUsage").unwrap_or(0) as u16;
	dev.hid.max_input_len = number_property(service, "MaxInputReportSize").unwrap_or(0) as usize;

	unsafe {
		let key = CFString::new("ReportDescriptor");
		let value = IORegistryEntryCreateCFProperty(
			service,
			key.as_concrete_TypeRef() as CFStringRef,
			kCFAllocatorDefault,
			0,
		);
		if value.is_null() {
			warn!("Cannot read report descriptor for '{}'", dev.path);
			return;
		}

		// CFData layout: we only need the byte range
		let data = value as core_foundation::data::CFDataRef;
		let len = core_foundation::data::CFDataGetLength(data) as usize;
		let ptr = core_foundation::data::CFDataGetBytePtr(data);
		let desc = std::slice::from_raw_parts(ptr, len);

		let parsed = parse_report_descriptor(desc, &dev.path);
		dev.hid.numbered_reports = parsed.numbered_reports;
		CFRelease(value);
	}
}
