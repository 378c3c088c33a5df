// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors
//! macOS HID ports.
//!
//! IOKit HID I/O is callback driven, so each open HID port runs a dedicated
//! thread owning a CFRunLoop with the IOHIDDevice scheduled on it. Input
//! reports are appended to a bounded queue (oldest dropped on overflow) and a
//! pipe stands in as the poll handle: one byte is written when the queue goes
//! from empty to non-empty, and the pipe is drained once the queue empties.

use std::collections::VecDeque;
use std::ffi::{CString, c_void};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use core_foundation::base::CFRelease;
use core_foundation::runloop::{
	CFRunLoopGetCurrent, CFRunLoopRef, CFRunLoopRun, CFRunLoopStop, kCFRunLoopCommonModes,
};
use io_kit_sys::hid::base::{IOHIDDeviceRef, IOHIDReportCallback};
use io_kit_sys::hid::device::*;
use io_kit_sys::ret::{IOReturn, kIOReturnSuccess};
use io_kit_sys::types::io_registry_entry_t;
use io_kit_sys::{IOObjectRelease, IORegistryEntryFromPath, kIOMasterPortDefault};
use log::warn;

use crate::device::{PortMode, SharedDevice};
use crate::error::{ErrorKind, Result};
use crate::platform::{Handle, PollSource, adjust_timeout, millis, poll};

/// Reports queued but not yet read; beyond this the oldest are dropped.
const MAX_REPORT_QUEUE_SIZE: usize = 128;

const KIO_HID_REPORT_TYPE_OUTPUT: u32 = 1;
const KIO_HID_REPORT_TYPE_FEATURE: u32 = 2;

struct SharedState
{
	reports: Mutex<VecDeque<Vec<u8>>>,
	removed: AtomicBool,
	/// Write end of the poll pipe; a single pending byte mirrors "queue
	/// non-empty or device removed".
	pipe_write: OwnedFd,
	signalled: AtomicBool,
}

impl SharedState
{
	fn signal(&self)
	{
		if !self.signalled.swap(true, Ordering::AcqRel) {
			let byte = [0u8; 1];
			unsafe {
				libc::write(self.pipe_write.as_raw_fd(), byte.as_ptr() as *const c_void, 1);
			}
		}
	}
}

struct ThreadStartup
{
	ready: Mutex<Option<std::result::Result<(usize, usize), String>>>,
	cond: Condvar,
}

pub(super) struct HidPort
{
	dev: SharedDevice,
	mode: PortMode,
	state: Arc<SharedState>,
	pipe_read: OwnedFd,
	/// Only touched from this struct's owner thread.
	hid_device: IOHIDDeviceRef,
	run_loop: CFRunLoopRef,
	thread: Option<std::thread::JoinHandle<()>>,
	/// Buffer the input-report callback writes into, sized once at open.
	_report_buf: Box<[u8]>,
}

// The IOHIDDevice is driven from the run-loop thread, this handle only issues
// synchronous set-report calls and owns the references
unsafe impl Send for HidPort {}

extern "C" fn input_report_callback(
	context: *mut c_void, _result: IOReturn, _sender: *mut c_void, _report_type: u32,
	report_id: u32, report: *mut u8, report_length: isize,
)
{
	let state = unsafe { &*(context as *const SharedState) };

	let mut data = Vec::with_capacity(report_length as usize + 1);
	data.push(report_id as u8);
	data.extend_from_slice(unsafe {
		std::slice::from_raw_parts(report, report_length as usize)
	});

	let mut reports = state.reports.lock().unwrap();
	if reports.len() >= MAX_REPORT_QUEUE_SIZE {
		// The consumer is not keeping up, shed the oldest report
		reports.pop_front();
	}
	let was_empty = reports.is_empty();
	reports.push_back(data);
	drop(reports);

	if was_empty {
		state.signal();
	}
}

extern "C" fn removal_callback(context: *mut c_void, _result: IOReturn, _sender: *mut c_void)
{
	let state = unsafe { &*(context as *const SharedState) };
	state.removed.store(true, Ordering::Release);
	state.signal();
}

impl HidPort
{
	pub(super) fn open(dev: &SharedDevice, mode: PortMode) -> Result<Self>
	{
		let mut pipe_fds = [0i32; 2];
		if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } < 0 {
			return Err(ErrorKind::System
				.report(format!("pipe() failed: {}", std::io::Error::last_os_error())));
		}
		let (pipe_read, pipe_write) = unsafe {
			(OwnedFd::from_raw_fd(pipe_fds[0]), OwnedFd::from_raw_fd(pipe_fds[1]))
		};
		for fd in pipe_fds {
			unsafe {
				libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
				libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
			}
		}

		let state = Arc::new(SharedState {
			reports: Mutex::new(VecDeque::new()),
			removed: AtomicBool::new(false),
			pipe_write,
			signalled: AtomicBool::new(false),
		});

		let startup = Arc::new(ThreadStartup {
			ready: Mutex::new(None),
			cond: Condvar::new(),
		});

		let report_buf = vec![0u8; dev.hid.max_input_len.max(64)].into_boxed_slice();

		let thread = {
			let state = state.clone();
			let startup = startup.clone();
			let path = dev.path.clone();
			let can_read = mode.can_read();
			let buf_ptr = report_buf.as_ptr() as usize;
			let buf_len = report_buf.len();

			std::thread::Builder::new()
				.name("hid-runloop".to_string())
				.spawn(move ||

					hid_thread(state, startup, path, can_read, buf_ptr, buf_len))
				.map_err(|e| ErrorKind::System.report(format!("Cannot start HID thread: {}", e)))?
		};

		// Wait for the thread to open the device and enter its run loop
		let opened = {
			let mut ready = startup.ready.lock().unwrap();
			while ready.is_none() {
				ready = startup.cond.wait(ready).unwrap();
			}
			ready.take().unwrap()
		};

		let (hid_device, run_loop) = match opened {
			Ok(ptrs) => ptrs,
			Err(msg) => {
				let _ = thread.join();
				return Err(ErrorKind::NotFound
					.report(format!("Cannot open HID device '{}': {}", dev.path, msg)));
			},
		};

		Ok(Self {
			dev: dev.clone(),
			mode,
			state,
			pipe_read,
			hid_device: hid_device as IOHIDDeviceRef,
			run_loop: run_loop as CFRunLoopRef,
			thread: Some(thread),
			_report_buf: report_buf,
		})
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
		self.pipe_read.as_raw_fd()
	}

	fn check_removed(&self) -> Result<()>
	{
		if self.state.removed.load(Ordering::Acquire) {
			return Err(ErrorKind::Io
				.report(format!("Device '{}' was removed", self.dev.path)));
		}
		Ok(())
	}

	pub(super) fn hid_read(&mut self, buf: &mut [u8], timeout: i32) -> Result<usize>
	{
		self.check_removed()?;

		if timeout != 0 {
			let start = millis();
			loop {
				if !self.state.reports.lock().unwrap().is_empty() {
					break;
				}
				let mut sources = [PollSource::new(self.pipe_read.as_raw_fd(), 0)];
				let remaining = adjust_timeout(timeout, start);
				if poll(&mut sources, remaining)? == 0 {
					return Ok(0);
				}
				self.check_removed()?;
			}
		}

		let mut reports = self.state.reports.lock().unwrap();
		let Some(report) = reports.pop_front() else {
			return Ok(0);
		};

		// Reset the pipe once the queue drains so the poll handle disarms
		if reports.is_empty() {
			self.state.signalled.store(false, Ordering::Release);
			let mut scratch = [0u8; 16];
			unsafe {
				libc::read(
					self.pipe_read.as_raw_fd(),
					scratch.as_mut_ptr() as *mut c_void,
					scratch.len(),
				);
			}
		}
		drop(reports);

		// Message semantics: one report per call, excess truncated
		let n = buf.len().min(report.len());
		buf[..n].copy_from_slice(&report[..n]);
		Ok(n)
	}

	fn set_report(&mut self, report_type: u32, buf: &[u8]) -> Result<usize>
	{
		if buf.len() < 2 {
			return Ok(0);
		}
		self.check_removed()?;

		// A zero report ID means "no numbered reports", the byte itself must
		// not go on the wire
		let (report_id, payload) = if buf[0] == 0 {
			(0u32, &buf[1..])
		} else {
			(buf[0] as u32, buf)
		};

		// Known OS bug: IOHIDDeviceSetReport can block forever if the device
		// stops responding; there is no timeout variant we can rely on
		let kr = unsafe {
			IOHIDDeviceSetReport(
				self.hid_device,
				report_type,
				report_id as isize,
				payload.as_ptr(),
				payload.len() as isize,
			)
		};
		if kr != kIOReturnSuccess {
			return Err(ErrorKind::Io
				.report(format!("IOHIDDeviceSetReport() failed on '{}'", self.dev.path)));
		}

		Ok(buf.len())
	}

	pub(super) fn hid_write(&mut self, buf: &[u8]) -> Result<usize>
	{
		self.set_report(KIO_HID_REPORT_TYPE_OUTPUT, buf)
	}

	pub(super) fn hid_send_feature_report(&mut self, buf: &[u8]) -> Result<usize>
	{
		self.set_report(KIO_HID_REPORT_TYPE_FEATURE, buf)
	}

	pub(super) fn hid_get_feature_report(&mut self, report_id: u8, buf: &mut [u8]) -> Result<usize>
	{
		self.check_removed()?;
		if buf.len() < 2 {
			return Ok(0);
		}

		let mut length = (buf.len() - 1) as isize;
		let kr = unsafe {
			IOHIDDeviceGetReport(
				self.hid_device,
				KIO_HID_REPORT_TYPE_FEATURE,
				report_id as isize,
				buf[1..].as_mut_ptr(),
				&mut length,
			)
		};
		if kr != kIOReturnSuccess {
			return Err(ErrorKind::Io
				.report(format!("IOHIDDeviceGetReport() failed on '{}'", self.dev.path)));
		}

		buf[0] = report_id;
		Ok(length as usize + 1)
	}
}

impl Drop for HidPort
{
	fn drop(&mut self)
	{
		unsafe {
			CFRunLoopStop(self.run_loop);
		}
		if let Some(thread) = self.thread.take() {
			let _ = thread.join();
		}
		self.state.reports.lock().unwrap().clear();
	}
}

/// Body of the per-port run-loop thread: re-open the IOHIDDevice from its
/// registry path, register the callbacks and spin the run loop until stopped.
fn hid_thread(
	state: Arc<SharedState>, startup: Arc<ThreadStartup>, path: String, can_read: bool,
	buf_ptr: usize, buf_len: usize,
)
{
	let fail = |msg: String| {
		*startup.ready.lock().unwrap() = Some(Err(msg));
		startup.cond.notify_all();
	};

	unsafe {
		let c_path = match CString::new(path.clone()) {
			Ok(c_path) => c_path,
			Err(_) => return fail("invalid registry path".to_string()),
		};
		let entry: io_registry_entry_t =
			IORegistryEntryFromPath(kIOMasterPortDefault, c_path.as_ptr());
		if entry == 0 {
			return fail("registry entry not found".to_string());
		}

		let hid_device = IOHIDDeviceCreate(core_foundation::base::kCFAllocatorDefault, entry);
		IOObjectRelease(entry);
		if hid_device.is_null() {
			return fail("IOHIDDeviceCreate() failed".to_string());
		}

		if IOHIDDeviceOpen(hid_device, 0) != kIOReturnSuccess {
			CFRelease(hid_device as *const c_void);
			return fail("IOHIDDeviceOpen() failed".to_string());
		}

		let run_loop = CFRunLoopGetCurrent();
		IOHIDDeviceScheduleWithRunLoop(hid_device, run_loop, kCFRunLoopCommonModes);

		let context = Arc::as_ptr(&state) as *mut c_void;
		if can_read {
			IOHIDDeviceRegisterInputReportCallback(
				hid_device,
				buf_ptr as *mut u8,
				buf_len as isize,
				input_report_callback as IOHIDReportCallback,
				context,
			);
		}
		IOHIDDeviceRegisterRemovalCallback(hid_device, removal_callback, context);

		*startup.ready.lock().unwrap() =
			Some(Ok((hid_device as usize, run_loop as usize)));
		startup.cond.notify_all();

		CFRunLoopRun();

		// Stopped by Drop: tear the device down on the thread that owned it
		IOHIDDeviceUnscheduleFromRunLoop(hid_device, run_loop, kCFRunLoopCommonModes);
		if IOHIDDeviceClose(hid_device, 0) != kIOReturnSuccess {
			warn!("IOHIDDeviceClose() failed on '{}'", path);
		}
		CFRelease(hid_device as *const c_void);
	}
}
