// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors
//! Shared device records.
//!
//! A [Device] describes one USB interface as reported by the OS. Records are
//! published behind an [`Arc`] and never mutated afterwards, with one documented
//! exception: the status flips to [DeviceStatus::Disconnected] when the owning
//! monitor processes a removal event.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use log::debug;

use crate::error::{Error, ErrorKind};

/// Device type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType
{
	Hid = 1,
	Serial = 2,
}

impl DeviceType
{
	pub fn as_str(self) -> &'static str
	{
		match self {
			DeviceType::Hid => "hid",
			DeviceType::Serial => "serial",
		}
	}
}

impl Display for DeviceType
{
	fn fmt(&self, f: &mut Formatter) -> fmt::Result
	{
		f.write_str(self.as_str())
	}
}

impl FromStr for DeviceType
{
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Error>
	{
		match s {
			"hid" => Ok(DeviceType::Hid),
			"serial" => Ok(DeviceType::Serial),
			_ => Err(ErrorKind::Parse.report(format!("Unknown device type '{}'", s))),
		}
	}
}

/// Current device status. The status only changes when the owning monitor
/// processes events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus
{
	Online = 1,
	Disconnected = 2,
}

/// Device open mode, see [`crate::port::Port::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMode
{
	Read = 1,
	Write = 2,
	ReadWrite = 3,
}

impl PortMode
{
	pub fn can_read(self) -> bool
	{
		self as u8 & PortMode::Read as u8 != 0
	}

	pub fn can_write(self) -> bool
	{
		self as u8 & PortMode::Write as u8 != 0
	}
}

/// HID properties extracted from the report descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct HidInfo
{
	/// Primary usage page value read from the HID report descriptor.
	pub usage_page: u16,
	/// Primary usage value read from the HID report descriptor.
	pub usage: u16,
	/// Whether the device uses numbered reports, steers the hidraw read path.
	pub numbered_reports: bool,
	/// Maximum input report length in bytes, without the report ID byte.
	pub max_input_len: usize,
}

/// One USB interface as reported by the OS.
#[derive(Debug)]
pub struct Device
{
	pub dev_type: DeviceType,
	status: AtomicU8,

	/// OS-stable identifier, unique within one monitor: the device instance ID on
	/// Windows, the udev devpath on Linux, the IORegistry session ID on macOS.
	pub key: String,
	/// Canonical USB topology string, `usb-<controller>[-<port>]+` (e.g. "usb-2-5-4").
	/// All interfaces on the same physical port share it.
	pub location: String,
	/// Device node path usable to open the device. On macOS HID devices this is the
	/// IORegistry entry path, there is no usable device node.
	pub path: String,

	pub vid: u16,
	pub pid: u16,
	pub bcd_device: u16,
	pub iface_number: u8,

	pub manufacturer: Option<String>,
	pub product: Option<String>,
	pub serial_number: Option<String>,

	/// User tag copied from the matching [`crate::match_spec::MatchSpec`].
	pub match_tag: u64,

	/// Only meaningful when `dev_type` is [DeviceType::Hid].
	pub hid: HidInfo,
}

impl Device
{
	/// Build a bare device record. Mostly used by the monitor backends, but
	/// public so synthetic devices can be fed through the matching machinery.
	pub fn new(dev_type: DeviceType, key: String, location: String, path: String) -> Self
	{
		Self {
			dev_type,
			status: AtomicU8::new(DeviceStatus::Online as u8),
			key,
			location,
			path,
			vid: 0,
			pid: 0,
			bcd_device: 0,
			iface_number: 0,
			manufacturer: None,
			product: None,
			serial_number: None,
			match_tag: 0,
			hid: HidInfo::default(),
		}
	}

	pub fn status(&self) -> DeviceStatus
	{
		match self.status.load(Ordering::Acquire) {
			1 => DeviceStatus::Online,
			_ => DeviceStatus::Disconnected,
		}
	}

	pub(crate) fn set_status(&self, status: DeviceStatus)
	{
		self.status.store(status as u8, Ordering::Release);
	}

	pub(crate) fn log_event(&self, verb: &str)
	{
		debug!(
			"{} device '{}' (type {}, ID {:04x}:{:04x}) @ {}/{}",
			verb, self.key, self.dev_type, self.vid, self.pid, self.location, self.iface_number
		);
	}
}

impl Display for Device
{
	fn fmt(&self, f: &mut Formatter) -> fmt::Result
	{
		write!(
			f,
			"{} {:04x}:{:04x} @ {} (iface {})",
			self.dev_type, self.vid, self.pid, self.location, self.iface_number
		)
	}
}

/// Shared, refcounted device record as handed out by monitors and kept alive by ports.
pub type SharedDevice = Arc<Device>;
