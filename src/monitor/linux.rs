// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors
//! Linux device discovery over udev.
//!
//! Enumeration and hotplug both go through udev, watching the `hidraw` and `tty`
//! subsystems and walking each node's parents to the `usb_device`/`usb_interface`
//! ancestors for the USB identity. The monitor's poll handle is kept stable
//! across start/stop by `dup3`-ing either a never-ready eventfd or the udev
//! netlink socket onto the same descriptor.

use std::ops::ControlFlow;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use log::debug;

use super::DeviceTable;
use crate::device::{Device, DeviceType, SharedDevice};
use crate::error::{ErrorKind, Result};
use crate::hid_report::parse_report_descriptor;
use crate::match_spec::MatchSet;
use crate::platform::Handle;

const DEVICE_SUBSYSTEMS: [(&str, DeviceType); 2] =
	[("hidraw", DeviceType::Hid), ("tty", DeviceType::Serial)];

const HID_MAX_DESCRIPTOR_SIZE: usize = 4096;

#[repr(C)]
pub struct HidrawReportDescriptor
{
	size: u32,
	value: [u8; HID_MAX_DESCRIPTOR_SIZE],
}

nix::ioctl_read!(hidraw_grdescsize, b'H', 0x01, libc::c_int);
nix::ioctl_read!(hidraw_grdesc, b'H', 0x02, HidrawReportDescriptor);

pub(super) struct MonitorBackend
{
	socket: Option<udev::MonitorSocket>,
	/// Never-ready placeholder for the poll handle while the monitor is stopped.
	placeholder_fd: OwnedFd,
	/// The stable descriptor handed out by `poll_handle`.
	wait_fd: OwnedFd,
}

// libudev objects are not thread-safe but may be used from any thread as long
// as access is serialized, which the Mutex around the owning Monitor guarantees
unsafe impl Send for MonitorBackend {}

impl MonitorBackend
{
	pub(super) fn new() -> Result<Self>
	{
		let placeholder_fd =
			unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
		if placeholder_fd < 0 {
			let errno = std::io::Error::last_os_error();
			return Err(ErrorKind::System.report(format!("eventfd() failed: {}", errno)));
		}
		let placeholder_fd = unsafe { OwnedFd::from_raw_fd(placeholder_fd) };

		let wait_fd = unsafe {
			libc::fcntl(placeholder_fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 0)
		};
		if wait_fd < 0 {
			let errno = std::io::Error::last_os_error();
			return Err(ErrorKind::System
				.report(format!("fcntl(F_DUPFD_CLOEXEC) failed: {}", errno)));
		}
		let wait_fd = unsafe { OwnedFd::from_raw_fd(wait_fd) };

		Ok(Self {
			socket: None,
			placeholder_fd,
			wait_fd,
		})
	}

	pub(super) fn start(&mut self, match_set: &MatchSet, devices: &mut DeviceTable) -> Result<()>
	{
		if self.socket.is_some() {
			return Ok(());
		}

		let socket = (|| -> std::io::Result<udev::MonitorSocket> {
			let mut builder = udev::MonitorBuilder::new()?;
			for (subsystem, dev_type) in DEVICE_SUBSYSTEMS {
				if match_set.has_type(dev_type) {
					builder = builder.match_subsystem(subsystem)?;
				}
			}
			builder.listen()
		})()
		.map_err(|e| ErrorKind::System.report(format!("Cannot create udev monitor: {}", e)))?;

		// Snapshot the current devices before swapping the poll handle over, so a
		// device that shows up in between is seen again through the socket.
		enumerate(match_set, &mut |dev| {
			let _ = devices.add(dev.clone(), None);
			ControlFlow::Continue(())
		})?;

		redirect_fd(socket.as_raw_fd(), self.wait_fd.as_raw_fd())?;
		self.socket = Some(socket);

		Ok(())
	}

	pub(super) fn stop(&mut self)
	{
		if self.socket.take().is_some() {
			// Cannot fail, the placeholder descriptor is alive and valid
			let _ = redirect_fd(self.placeholder_fd.as_raw_fd(), self.wait_fd.as_raw_fd());
		}
	}

	pub(super) fn poll_handle(&self) -> Handle
	{
		self.wait_fd.as_raw_fd()
	}

	pub(super) fn refresh(
		&mut self, match_set: &MatchSet, devices: &mut DeviceTable,
		callback: &mut dyn FnMut(&SharedDevice) -> ControlFlow<()>,
	) -> Result<ControlFlow<()>>
	{
		let Some(socket) = &self.socket else {
			return Ok(ControlFlow::Continue(()));
		};

		for event in socket.iter() {
			let flow = match event.event_type() {
				udev::EventType::Add => {
					match read_device_information(&event.device())? {
						Some(mut dev) => match match_set.matches(&dev) {
							Some(tag) => {
								dev.match_tag = tag;
								devices.add(Arc::new(dev), Some(&mut *callback))
							},
							None => ControlFlow::Continue(()),
						},
						None => ControlFlow::Continue(()),
					}
				},
				udev::EventType::Remove => {
					let key = event.device().devpath().to_string_lossy().into_owned();
					devices.remove(&key, Some(&mut *callback))
				},
				_ => ControlFlow::Continue(()),
			};

			if flow.is_break() {
				return Ok(ControlFlow::Break(()));
			}
		}

		Ok(ControlFlow::Continue(()))
	}
}

/// Replace `wait` with a duplicate of `target` without changing the descriptor number.
fn redirect_fd(target: RawFd, wait: RawFd) -> Result<()>
{
	let r = unsafe { libc::dup3(target, wait, libc::O_CLOEXEC) };
	if r < 0 {
		let errno = std::io::Error::last_os_error();
		return Err(ErrorKind::System.report(format!("dup3() failed: {}", errno)));
	}
	Ok(())
}

pub(super) fn enumerate(
	match_set: &MatchSet, callback: &mut dyn FnMut(&SharedDevice) -> ControlFlow<()>,
) -> Result<ControlFlow<()>>
{
	let scan_error =
		|e: std::io::Error| ErrorKind::System.report(format!("udev device scan failed: {}", e));

	let mut enumerator = udev::Enumerator::new().map_err(scan_error)?;
	enumerator.match_is_initialized().map_err(scan_error)?;
	for (subsystem, dev_type) in DEVICE_SUBSYSTEMS {
		if match_set.has_type(dev_type) {
			enumerator.match_subsystem(subsystem).map_err(scan_error)?;
		}
	}
	let devices = enumerator.scan_devices().map_err(scan_error)?;

	for udev_dev in devices {
		let Some(mut dev) = read_device_information(&udev_dev)? else {
			continue;
		};
		let Some(tag) = match_set.matches(&dev) else {
			continue;
		};
		dev.match_tag = tag;

		if callback(&Arc::new(dev)).is_break() {
			return Ok(ControlFlow::Break(()));
		}
	}

	Ok(ControlFlow::Continue(()))
}

fn attribute(udev_dev: &udev::Device, name: &str) -> Option<String>
{
	udev_dev
		.attribute_value(name)
		.map(|value| value.to_string_lossy().into_owned())
}

fn attribute_hex(udev_dev: &udev::Device, name: &str) -> Option<u16>
{
	attribute(udev_dev, name).and_then(|value| u16::from_str_radix(value.trim(), 16).ok())
}

/// Build a device record from a hidraw/tty udev node, walking up to its USB
/// ancestors. Returns `None` for nodes we cannot use (virtual terminals, devices
/// going away mid-read, missing attributes).
fn read_device_information(udev_dev: &udev::Device) -> Result<Option<Device>>
{
	let Some(subsystem) = udev_dev.subsystem() else {
		return Ok(None);
	};
	let dev_type = match subsystem.to_str() {
		Some("hidraw") => DeviceType::Hid,
		Some("tty") => DeviceType::Serial,
		_ => return Ok(None),
	};

	let Some(node) = udev_dev.devnode() else {
		return Ok(None);
	};
	if !node.exists() {
		return Ok(None);
	}

	let (Ok(Some(usb)), Ok(Some(iface))) = (
		udev_dev.parent_with_subsystem_devtype("usb", "usb_device"),
		udev_dev.parent_with_subsystem_devtype("usb", "usb_interface"),
	) else {
		return Ok(None);
	};

	let (Some(busnum), Some(devpath)) = (attribute(&usb, "busnum"), attribute(&usb, "devpath"))
	else {
		return Ok(None);
	};
	let location = format!("usb-{}-{}", busnum, devpath).replace('.', "-");

	let key = udev_dev.devpath().to_string_lossy().into_owned();
	let mut dev = Device::new(dev_type, key, location, node.to_string_lossy().into_owned());

	let (Some(vid), Some(pid), Some(bcd_device)) = (
		attribute_hex(&usb, "idVendor"),
		attribute_hex(&usb, "idProduct"),
		attribute_hex(&usb, "bcdDevice"),
	) else {
		return Ok(None);
	};
	dev.vid = vid;
	dev.pid = pid;
	dev.bcd_device = bcd_device;

	dev.manufacturer = attribute(&usb, "manufacturer");
	dev.product = attribute(&usb, "product");
	dev.serial_number = attribute(&usb, "serial");

	let Some(iface_number) = attribute_hex(&iface, "bInterfaceNumber") else {
		return Ok(None);
	};
	dev.iface_number = iface_number as u8;

	if dev.dev_type == DeviceType::Hid {
		fill_hid_properties(udev_dev, &mut dev);
	}

	Ok(Some(dev))
}

/// The sysfs report_descriptor file appeared around Linux 2.6.38, fall back to
/// the hidraw ioctls on older kernels (where most HID nodes are root-only anyway).
fn fill_hid_properties(udev_dev: &udev::Device, dev: &mut Device)
{
	let desc = read_hid_descriptor_sysfs(udev_dev)
		.or_else(|| read_hid_descriptor_hidraw(&dev.path));

	match desc {
		Some(desc) => dev.hid = parse_report_descriptor(&desc, &dev.path),
		None => debug!("Cannot get HID report descriptor from '{}'", dev.path),
	}
}

fn read_hid_descriptor_sysfs(udev_dev: &udev::Device) -> Option<Vec<u8>>
{
	let hid_dev = udev_dev.parent_with_subsystem("hid").ok().flatten()?;
	let report_path = hid_dev.syspath().join("report_descriptor");
	std::fs::read(report_path).ok()
}

fn read_hid_descriptor_hidraw(node: &str) -> Option<Vec<u8>>
{
	let file = std::fs::File::open(node).ok()?;
	let fd = file.as_raw_fd();

	let mut desc_size: libc::c_int = 0;
	unsafe { hidraw_grdescsize(fd, &mut desc_size) }.ok()?;
	if desc_size <= 0 || desc_size as usize > HID_MAX_DESCRIPTOR_SIZE {
		return None;
	}

	let mut desc = HidrawReportDescriptor {
		size: desc_size as u32,
		value: [0; HID_MAX_DESCRIPTOR_SIZE],
	};
	unsafe { hidraw_grdesc(fd, &mut desc) }.ok()?;

	Some(desc.value[..desc.size as usize].to_vec())
}
