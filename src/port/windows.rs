// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors
//! Windows ports over handle-based overlapped I/O.
//!
//! Read-mode ports keep one asynchronous read permanently in flight into a
//! fixed buffer; the OVERLAPPED event doubles as the poll handle. Serial ports
//! behave as byte streams (callers drain the buffer across calls), HID ports
//! are message oriented (one report per completed read, excess truncated).
//!
//! Pre-Vista Windows is not supported, so `CancelIoEx` is always available and
//! the historical cleanup-thread fallback for cancelling a read owned by
//! another thread is not carried here.

use std::ffi::c_void;

use log::warn;
use windows::Win32::Devices::Communication::*;
use windows::Win32::Foundation::*;
use windows::Win32::Storage::FileSystem::*;
use windows::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};
use windows::Win32::System::Threading::{CreateEventW, WaitForSingleObject, INFINITE};
use windows::core::PCWSTR;

use crate::device::{DeviceType, PortMode, SharedDevice};
use crate::error::{ErrorKind, Result};
use crate::platform::{Handle, adjust_timeout, millis};
use crate::port::{Dtr, Parity, Rts, SerialConfig, XonXoff};

/// Serial read buffer size; HID buffers are sized from the input report length.
const SERIAL_READ_BUFFER: usize = 16384;
const WRITE_TIMEOUT_MS: u32 = 5000;

pub(super) struct OverlappedPort
{
	handle: HANDLE,
	mode: PortMode,
	dev: SharedDevice,

	overlapped: Box<OVERLAPPED>,
	read_buf: Vec<u8>,
	/// Bytes available from the last completed read and the drain cursor into
	/// them (serial stream semantics).
	read_len: usize,
	read_ptr: usize,
	read_pending: bool,
}

// One thread drives a port at a time; the kernel handles inside are plain
// process-global references
unsafe impl Send for OverlappedPort {}

fn io_error(path: &str, detail: impl std::fmt::Display) -> crate::error::Error
{
	ErrorKind::Io.report(format!("I/O error while accessing '{}': {}", path, detail))
}

impl OverlappedPort
{
	pub(super) fn open(dev: &SharedDevice, mode: PortMode) -> Result<Self>
	{
		let mut access = 0u32;
		if mode.can_read() {
			access |= GENERIC_READ.0;
		}
		if mode.can_write() {
			access |= GENERIC_WRITE.0;
		}

		let wide: Vec<u16> = dev.path.encode_utf16().chain(std::iter::once(0)).collect();
		let handle = unsafe {
			CreateFileW(
				PCWSTR(wide.as_ptr()),
				access,
				FILE_SHARE_READ | FILE_SHARE_WRITE,
				None,
				OPEN_EXISTING,
				FILE_FLAG_OVERLAPPED,
				None,
			)
		}
		.map_err(|e| match WIN32_ERROR::from_error(&e) {
			Some(ERROR_FILE_NOT_FOUND) | Some(ERROR_PATH_NOT_FOUND) => {
				ErrorKind::NotFound.report(format!("Device '{}' not found", dev.path))
			},
			Some(ERROR_ACCESS_DENIED) | Some(ERROR_SHARING_VIOLATION) => {
				ErrorKind::Access.report(format!("Permission denied for device '{}'", dev.path))
			},
			_ => ErrorKind::System.report(format!("CreateFile('{}') failed: {}", dev.path, e)),
		})?;

		let event = unsafe { CreateEventW(None, true, false, None) }
			.map_err(|e| ErrorKind::System.report(format!("CreateEvent() failed: {}", e)))?;
		let mut overlapped = Box::new(OVERLAPPED::default());
		overlapped.hEvent = event;

		let read_buf_size = match dev.dev_type {
			DeviceType::Serial => SERIAL_READ_BUFFER,
			// Report ID byte plus the biggest input report the interface declares
			DeviceType::Hid => dev.hid.max_input_len + 1,
		};

		let mut port = Self {
			handle,
			mode,
			dev: dev.clone(),
			overlapped,
			read_buf: vec![0; read_buf_size.max(2)],
			read_len: 0,
			read_ptr: 0,
			read_pending: false,
		};

		if dev.dev_type == DeviceType::Serial {
			port.setup_serial()?;
		}

		if mode.can_read() {
			port.start_async_read()?;
		}

		Ok(port)
	}

	fn setup_serial(&mut self) -> Result<()>
	{
		let path = &self.dev.path;

		let mut dcb = DCB {
			DCBlength: std::mem::size_of::<DCB>() as u32,
			..Default::default()
		};
		unsafe { GetCommState(self.handle, &mut dcb) }
			.map_err(|e| ErrorKind::System.report(format!("GetCommState('{}') failed: {}", path, e)))?;

		dcb._bitfield |= 1; // fBinary
		dcb._bitfield &= !(1 << 14); // fAbortOnError
		dcb._bitfield = (dcb._bitfield & !(0b11 << 4)) | ((DTR_CONTROL_ENABLE.0) << 4); // fDtrControl

		unsafe { SetCommState(self.handle, &dcb) }
			.map_err(|e| ErrorKind::System.report(format!("SetCommState('{}') failed: {}", path, e)))?;

		// Read "whatever is already available" semantics, so reads never block
		// inside the driver; writes get a fixed generous timeout
		let timeouts = COMMTIMEOUTS {
			ReadIntervalTimeout: u32::MAX,
			ReadTotalTimeoutMultiplier: u32::MAX,
			ReadTotalTimeoutConstant: u32::MAX - 1,
			WriteTotalTimeoutMultiplier: 0,
			WriteTotalTimeoutConstant: WRITE_TIMEOUT_MS,
		};
		unsafe { SetCommTimeouts(self.handle, &timeouts) }
			.map_err(|e| ErrorKind::System.report(format!("SetCommTimeouts('{}') failed: {}", path, e)))?;

		unsafe { PurgeComm(self.handle, PURGE_RXCLEAR) }
			.map_err(|e| ErrorKind::System.report(format!("PurgeComm('{}') failed: {}", path, e)))?;

		Ok(())
	}

	pub(super) fn device(&self) -> &SharedDevice
	{
		&self.dev
	}

	pub(super) fn mode(&self) -> PortMode
	{
		self.mode
	}

	pub(super) fn poll_handle(&self) -> Handle
	{
		self.overlapped.hEvent
	}

	/// Issue the always-pending background read.
	fn start_async_read(&mut self) -> Result<()>
	{
		if self.read_pending {
			return Ok(());
		}

		let r = unsafe {
			ReadFile(
				self.handle,
				Some(&mut self.read_buf[..]),
				None,
				Some(self.overlapped.as_mut() as *mut OVERLAPPED),
			)
		};

		match r {
			Ok(()) => {
				self.read_pending = true;
				Ok(())
			},
			Err(e) if WIN32_ERROR::from_error(&e) == Some(ERROR_IO_PENDING) => {
				self.read_pending = true;
				Ok(())
			},
			Err(e) => Err(io_error(&self.dev.path, e)),
		}
	}

	/// Wait for the pending read. Returns the completed byte count, or `None`
	/// while it is still incomplete within the timeout.
	fn finalize_async_read(&mut self, timeout: i32) -> Result<Option<usize>>
	{
		if !self.read_pending {
			return Ok(Some(0));
		}

		if timeout != 0 {
			let wait = if timeout < 0 { INFINITE } else { timeout as u32 };
			unsafe { WaitForSingleObject(self.overlapped.hEvent, wait) };
		}

		let mut transferred = 0u32;
		let r = unsafe {
			GetOverlappedResult(
				self.handle,
				self.overlapped.as_ref() as *const OVERLAPPED,
				&mut transferred,
				false,
			)
		};

		match r {
			Ok(()) => {
				self.read_pending = false;
				Ok(Some(transferred as usize))
			},
			Err(e) if WIN32_ERROR::from_error(&e) == Some(ERROR_IO_INCOMPLETE) => Ok(None),
			Err(e) => {
				self.read_pending = false;
				Err(io_error(&self.dev.path, e))
			},
		}
	}

	pub(super) fn serial_read(&mut self, buf: &mut [u8], timeout: i32) -> Result<usize>
	{
		// Drain leftovers from the last completed read first
		if self.read_ptr < self.read_len {
			let n = buf.len().min(self.read_len - self.read_ptr);
			buf[..n].copy_from_slice(&self.read_buf[self.read_ptr..self.read_ptr + n]);
			self.read_ptr += n;

			if self.read_ptr == self.read_len {
				self.read_len = 0;
				self.read_ptr = 0;
				self.start_async_read()?;
			}
			return Ok(n);
		}

		self.start_async_read()?;
		let Some(len) = self.finalize_async_read(timeout)? else {
			return Ok(0);
		};

		self.read_len = len;
		self.read_ptr = 0;
		let n = buf.len().min(len);
		buf[..n].copy_from_slice(&self.read_buf[..n]);
		self.read_ptr = n;

		if self.read_ptr >= self.read_len {
			self.read_len = 0;
			self.read_ptr = 0;
			self.start_async_read()?;
		}

		Ok(n)
	}

	pub(super) fn serial_write(&mut self, buf: &[u8], timeout: i32) -> Result<usize>
	{
		let start = millis();
		let mut written = 0usize;

		while written < buf.len() {
			let n = self.write_overlapped(&buf[written..])?;
			if n == 0 {
				break;
			}
			written += n;

			if timeout >= 0 && adjust_timeout(timeout, start) == 0 {
				break;
			}
		}

		Ok(written)
	}

	fn write_overlapped(&mut self, buf: &[u8]) -> Result<usize>
	{
		let event = unsafe { CreateEventW(None, true, false, None) }
			.map_err(|e| ErrorKind::System.report(format!("CreateEvent() failed: {}", e)))?;
		let mut overlapped = OVERLAPPED {
			hEvent: event,
			..Default::default()
		};

		let r = unsafe {
			WriteFile(self.handle, Some(buf), None, Some(&mut overlapped as *mut OVERLAPPED))
		};
		if let Err(e) = &r {
			if WIN32_ERROR::from_error(e) != Some(ERROR_IO_PENDING) {
				unsafe {
					let _ = CloseHandle(event);
				}
				return Err(io_error(&self.dev.path, e));
			}
		}

		let mut transferred = 0u32;
		let r = unsafe { GetOverlappedResult(self.handle, &overlapped, &mut transferred, true) };
		unsafe {
			let _ = CloseHandle(event);
		}
		r.map_err(|e| io_error(&self.dev.path, e))?;

		Ok(transferred as usize)
	}

	pub(super) fn hid_read(&mut self, buf: &mut [u8], timeout: i32) -> Result<usize>
	{
		self.start_async_read()?;
		let Some(len) = self.finalize_async_read(timeout)? else {
			return Ok(0);
		};

		// Message semantics: one report per completed read, excess dropped
		let n = buf.len().min(len);
		buf[..n].copy_from_slice(&self.read_buf[..n]);
		self.start_async_read()?;

		Ok(n)
	}

	pub(super) fn hid_write(&mut self, buf: &[u8]) -> Result<usize>
	{
		if buf.len() < 2 {
			return Ok(0);
		}

		self.write_overlapped(buf)
	}

	pub(super) fn hid_get_feature_report(&mut self, report_id: u8, buf: &mut [u8]) -> Result<usize>
	{
		use windows::Win32::Devices::HumanInterfaceDevice::HidD_GetFeature;

		if buf.is_empty() {
			return Ok(0);
		}
		buf[0] = report_id;

		let ok = unsafe {
			HidD_GetFeature(self.handle, buf.as_mut_ptr() as *mut c_void, buf.len() as u32)
		};
		if !ok.as_bool() {
			return Err(io_error(&self.dev.path, std::io::Error::last_os_error()));
		}

		Ok(buf.len())
	}

	pub(super) fn hid_send_feature_report(&mut self, buf: &[u8]) -> Result<usize>
	{
		use windows::Win32::Devices::HumanInterfaceDevice::HidD_SetFeature;

		if buf.len() < 2 {
			return Ok(0);
		}

		let ok = unsafe {
			HidD_SetFeature(self.handle, buf.as_ptr() as *const c_void, buf.len() as u32)
		};
		if !ok.as_bool() {
			return Err(io_error(&self.dev.path, std::io::Error::last_os_error()));
		}

		Ok(buf.len())
	}

	pub(super) fn serial_set_config(&mut self, config: &SerialConfig) -> Result<()>
	{
		let path = &self.dev.path;

		let mut dcb = DCB {
			DCBlength: std::mem::size_of::<DCB>() as u32,
			..Default::default()
		};
		unsafe { GetCommState(self.handle, &mut dcb) }
			.map_err(|e| ErrorKind::System.report(format!("GetCommState('{}') failed: {}", path, e)))?;

		if let Some(baudrate) = config.baudrate {
			if !crate::port::SERIAL_RATES.contains(&baudrate) {
				return Err(ErrorKind::System
					.report(format!("Unsupported baud rate value: {}", baudrate)));
			}
			dcb.BaudRate = baudrate;
		}

		if let Some(databits) = config.databits {
			if !(5..=8).contains(&databits) {
				return Err(ErrorKind::System
					.report(format!("Invalid data bits setting: {}", databits)));
			}
			dcb.ByteSize = databits;
		}

		if let Some(stopbits) = config.stopbits {
			dcb.StopBits = match stopbits {
				1 => ONESTOPBIT,
				2 => TWOSTOPBITS,
				_ => {
					return Err(ErrorKind::System
						.report(format!("Invalid stop bits setting: {}", stopbits)));
				},
			};
		}

		if let Some(parity) = config.parity {
			// fParity
			dcb._bitfield = (dcb._bitfield & !(1 << 1)) | (((parity != Parity::Off) as u32) << 1);
			dcb.Parity = match parity {
				Parity::Off => NOPARITY,
				Parity::Even => EVENPARITY,
				Parity::Odd => ODDPARITY,
				Parity::Mark => MARKPARITY,
				Parity::Space => SPACEPARITY,
			};
		}

		if let Some(rts) = config.rts {
			let control = match rts {
				Rts::Off => RTS_CONTROL_DISABLE,
				Rts::On => RTS_CONTROL_ENABLE,
				Rts::Flow => RTS_CONTROL_HANDSHAKE,
			};
			// fRtsControl (2 bits) and fOutxCtsFlow
			dcb._bitfield = (dcb._bitfield & !(0b11 << 12)) | (control.0 << 12);
			dcb._bitfield =
				(dcb._bitfield & !(1 << 2)) | (((rts == Rts::Flow) as u32) << 2);
		}

		if let Some(dtr) = config.dtr {
			let control = match dtr {
				Dtr::Off => DTR_CONTROL_DISABLE,
				Dtr::On => DTR_CONTROL_ENABLE,
			};
			dcb._bitfield = (dcb._bitfield & !(0b11 << 4)) | (control.0 << 4);
		}

		if let Some(xonxoff) = config.xonxoff {
			let (out_x, in_x) = match xonxoff {
				XonXoff::Off => (0u32, 0u32),
				XonXoff::In => (0, 1),
				XonXoff::Out => (1, 0),
				XonXoff::InOut => (1, 1),
			};
			// fOutX and fInX
			dcb._bitfield = (dcb._bitfield & !(1 << 8)) | (out_x << 8);
			dcb._bitfield = (dcb._bitfield & !(1 << 9)) | (in_x << 9);
		}

		unsafe { SetCommState(self.handle, &dcb) }
			.map_err(|e| ErrorKind::System.report(format!("SetCommState('{}') failed: {}", path, e)))
	}

	pub(super) fn serial_get_config(&mut self) -> Result<SerialConfig>
	{
		let path = &self.dev.path;

		let mut dcb = DCB {
			DCBlength: std::mem::size_of::<DCB>() as u32,
			..Default::default()
		};
		unsafe { GetCommState(self.handle, &mut dcb) }
			.map_err(|e| ErrorKind::System.report(format!("GetCommState('{}') failed: {}", path, e)))?;

		let mut config = SerialConfig::default();

		if crate::port::SERIAL_RATES.contains(&dcb.BaudRate) {
			config.baudrate = Some(dcb.BaudRate);
		}
		if (5..=8).contains(&dcb.ByteSize) {
			config.databits = Some(dcb.ByteSize);
		}
		config.stopbits = match dcb.StopBits {
			ONESTOPBIT => Some(1),
			TWOSTOPBITS => Some(2),
			_ => None,
		};
		config.parity = match dcb.Parity {
			NOPARITY => Some(Parity::Off),
			EVENPARITY => Some(Parity::Even),
			ODDPARITY => Some(Parity::Odd),
			MARKPARITY => Some(Parity::Mark),
			SPACEPARITY => Some(Parity::Space),
			_ => None,
		};
		config.rts = match DCB_RTS_CONTROL((dcb._bitfield >> 12) & 0b11) {
			RTS_CONTROL_DISABLE => Some(Rts::Off),
			RTS_CONTROL_ENABLE => Some(Rts::On),
			RTS_CONTROL_HANDSHAKE => Some(Rts::Flow),
			_ => None,
		};
		config.dtr = match DCB_DTR_CONTROL((dcb._bitfield >> 4) & 0b11) {
			DTR_CONTROL_DISABLE => Some(Dtr::Off),
			DTR_CONTROL_ENABLE => Some(Dtr::On),
			_ => None,
		};
		config.xonxoff = match ((dcb._bitfield >> 8) & 1, (dcb._bitfield >> 9) & 1) {
			(0, 0) => Some(XonXoff::Off),
			(0, 1) => Some(XonXoff::In),
			(1, 0) => Some(XonXoff::Out),
			_ => Some(XonXoff::InOut),
		};

		Ok(config)
	}
}

impl Drop for OverlappedPort
{
	fn drop(&mut self)
	{
		unsafe {
			if self.read_pending {
				if CancelIoEx(self.handle, Some(self.overlapped.as_ref() as *const OVERLAPPED))
					.is_ok()
				{
					// Let the cancellation drain before the OVERLAPPED goes away
					let mut transferred = 0u32;
					let _ = GetOverlappedResult(
						self.handle,
						self.overlapped.as_ref() as *const OVERLAPPED,
						&mut transferred,
						true,
					);
				} else {
					warn!("Cannot cancel pending read on '{}'", self.dev.path);
				}
			}

			let _ = CloseHandle(self.overlapped.hEvent);
			let _ = CloseHandle(self.handle);
		}
	}
}
