// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors
//! Device I/O ports.
//!
//! A [Port] owns one OS handle opened from a device record and keeps that record
//! alive. Ports are single-owner objects: reads and writes take `&mut self`, one
//! thread drives a port at a time.
//!
//! Read/write timeouts follow the crate-wide convention: milliseconds, `0` polls,
//! `-1` blocks indefinitely.

use crate::device::{DeviceType, PortMode, SharedDevice};
use crate::error::Result;
use crate::platform::Handle;

#[cfg(unix)]
#[path = "posix.rs"]
mod posix;
#[cfg(windows)]
#[path = "windows.rs"]
mod imp;
#[cfg(target_os = "macos")]
#[path = "darwin.rs"]
mod darwin;

/// Serial parity modes. Mark and space parity are unsupported on POSIX systems
/// without `CMSPAR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity
{
	Off,
	Even,
	Odd,
	Mark,
	Space,
}

/// RTS pin modes and RTS/CTS hardware flow control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rts
{
	Off,
	On,
	Flow,
}

/// DTR pin modes. DTR is asserted by default when a serial device is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtr
{
	Off,
	On,
}

/// XON/XOFF (software) flow control modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XonXoff
{
	Off,
	In,
	Out,
	InOut,
}

/// Baud rates accepted by [SerialConfig].
pub const SERIAL_RATES: [u32; 16] = [
	110, 134, 150, 200, 300, 600, 1200, 1800, 2400, 4800, 9600, 19200, 38400, 57600, 115200,
	230400,
];

/// Serial line configuration.
///
/// Fields set to `None` are left untouched by [Port::serial_set_config], and come
/// back as `None` from [Port::serial_get_config] when the OS value has no
/// cross-platform equivalent. So a get/modify/set round trip does not lose
/// OS-specific settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SerialConfig
{
	/// Baud rate, one of [SERIAL_RATES].
	pub baudrate: Option<u32>,
	/// Data bits, 5 to 8.
	pub databits: Option<u8>,
	/// Stop bits, 1 or 2.
	pub stopbits: Option<u8>,
	pub parity: Option<Parity>,
	pub rts: Option<Rts>,
	pub dtr: Option<Dtr>,
	pub xonxoff: Option<XonXoff>,
}

impl SerialConfig
{
	/// Plain 8N1 configuration at the given rate, the common case.
	pub fn rate(baudrate: u32) -> Self
	{
		Self {
			baudrate: Some(baudrate),
			databits: Some(8),
			stopbits: Some(1),
			parity: Some(Parity::Off),
			..Default::default()
		}
	}
}

#[cfg(any(target_os = "linux", target_os = "android"))]
enum PortImpl
{
	File(posix::FilePort),
}

#[cfg(target_os = "macos")]
enum PortImpl
{
	File(posix::FilePort),
	Hid(darwin::HidPort),
}

#[cfg(windows)]
enum PortImpl
{
	File(imp::OverlappedPort),
}

/// An open device handle, see module docs.
pub struct Port
{
	imp: PortImpl,
}

impl Port
{
	/// Open a device for I/O. The port keeps its own reference to the device
	/// record, the caller is free to drop theirs.
	pub fn open(dev: &SharedDevice, mode: PortMode) -> Result<Self>
	{
		#[cfg(any(target_os = "linux", target_os = "android"))]
		let imp = PortImpl::File(posix::FilePort::open(dev, mode)?);

		#[cfg(target_os = "macos")]
		let imp = match dev.dev_type {
			DeviceType::Serial => PortImpl::File(posix::FilePort::open(dev, mode)?),
			DeviceType::Hid => PortImpl::Hid(darwin::HidPort::open(dev, mode)?),
		};

		#[cfg(windows)]
		let imp = PortImpl::File(imp::OverlappedPort::open(dev, mode)?);

		Ok(Self {
			imp,
		})
	}

	/// The device record this port was opened from.
	pub fn device(&self) -> &SharedDevice
	{
		match &self.imp {
			PortImpl::File(port) => port.device(),
			#[cfg(target_os = "macos")]
			PortImpl::Hid(port) => port.device(),
		}
	}

	pub fn mode(&self) -> PortMode
	{
		match &self.imp {
			PortImpl::File(port) => port.mode(),
			#[cfg(target_os = "macos")]
			PortImpl::Hid(port) => port.mode(),
		}
	}

	/// A handle that polls readable when the port has input. Note that on some
	/// platforms this is not the device handle itself: for macOS HID ports it is
	/// a pipe signalled by the background run-loop thread.
	pub fn poll_handle(&self) -> Handle
	{
		match &self.imp {
			PortImpl::File(port) => port.poll_handle(),
			#[cfg(target_os = "macos")]
			PortImpl::Hid(port) => port.poll_handle(),
		}
	}

	fn file(&mut self) -> &mut FileImpl
	{
		match &mut self.imp {
			PortImpl::File(port) => port,
			#[cfg(target_os = "macos")]
			PortImpl::Hid(_) => panic!("operation requires a file-backed port"),
		}
	}

	/// Change the serial line configuration; `None` fields are left as they are.
	pub fn serial_set_config(&mut self, config: &SerialConfig) -> Result<()>
	{
		assert_eq!(self.device().dev_type, DeviceType::Serial);
		self.file().serial_set_config(config)
	}

	/// Read back the current serial line configuration.
	pub fn serial_get_config(&mut self) -> Result<SerialConfig>
	{
		assert_eq!(self.device().dev_type, DeviceType::Serial);
		self.file().serial_get_config()
	}

	/// Read up to `buf.len()` bytes from a serial device. Returns 0 on timeout.
	pub fn serial_read(&mut self, buf: &mut [u8], timeout: i32) -> Result<usize>
	{
		assert_eq!(self.device().dev_type, DeviceType::Serial);
		assert!(self.mode().can_read());
		assert!(!buf.is_empty());
		self.file().serial_read(buf, timeout)
	}

	/// Write bytes to a serial device, retrying until everything is sent or the
	/// timeout elapses. Returns the number of bytes actually written.
	pub fn serial_write(&mut self, buf: &[u8], timeout: i32) -> Result<usize>
	{
		assert_eq!(self.device().dev_type, DeviceType::Serial);
		assert!(self.mode().can_write());
		self.file().serial_write(buf, timeout)
	}

	/// Read one HID input report, including the report ID byte (0 for devices
	/// without numbered reports). HID reads are message-oriented: bytes beyond
	/// `buf.len()` from a single report are discarded.
	pub fn hid_read(&mut self, buf: &mut [u8], timeout: i32) -> Result<usize>
	{
		assert_eq!(self.device().dev_type, DeviceType::Hid);
		assert!(self.mode().can_read());
		assert!(!buf.is_empty());

		match &mut self.imp {
			PortImpl::File(port) => port.hid_read(buf, timeout),
			#[cfg(target_os = "macos")]
			PortImpl::Hid(port) => port.hid_read(buf, timeout),
		}
	}

	/// Send one HID output report. `buf[0]` is the report ID, which must be
	/// present (as 0) even for unnumbered reports; buffers shorter than 2 bytes
	/// return 0 without touching the device.
	pub fn hid_write(&mut self, buf: &[u8]) -> Result<usize>
	{
		assert_eq!(self.device().dev_type, DeviceType::Hid);
		assert!(self.mode().can_write());

		match &mut self.imp {
			PortImpl::File(port) => port.hid_write(buf),
			#[cfg(target_os = "macos")]
			PortImpl::Hid(port) => port.hid_write(buf),
		}
	}

	/// Read a feature report into `buf[1..]`; `buf[0]` receives the report ID.
	/// Returns report length + 1.
	pub fn hid_get_feature_report(&mut self, report_id: u8, buf: &mut [u8]) -> Result<usize>
	{
		assert_eq!(self.device().dev_type, DeviceType::Hid);
		assert!(self.mode().can_read());
		assert!(!buf.is_empty());

		match &mut self.imp {
			PortImpl::File(port) => port.hid_get_feature_report(report_id, buf),
			#[cfg(target_os = "macos")]
			PortImpl::Hid(port) => port.hid_get_feature_report(report_id, buf),
		}
	}

	/// Send a feature report, same framing rules as [Port::hid_write].
	pub fn hid_send_feature_report(&mut self, buf: &[u8]) -> Result<usize>
	{
		assert_eq!(self.device().dev_type, DeviceType::Hid);
		assert!(self.mode().can_write());

		match &mut self.imp {
			PortImpl::File(port) => port.hid_send_feature_report(buf),
			#[cfg(target_os = "macos")]
			PortImpl::Hid(port) => port.hid_send_feature_report(buf),
		}
	}
}

#[cfg(unix)]
type FileImpl = posix::FilePort;
#[cfg(windows)]
type FileImpl = imp::OverlappedPort;
