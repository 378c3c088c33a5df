// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors
//! Small platform abstraction: monotonic clock, timeout arithmetic and a
//! pollable-descriptor multiplexer.
//!
//! All timeouts in this crate follow the same convention: a value in
//! milliseconds, where `0` polls without blocking and `-1` blocks indefinitely.

use std::sync::OnceLock;
use std::time::Instant;

use crate::error::{ErrorKind, Result};

/// Maximum number of sources accepted by [poll].
pub const POLL_MAX_SOURCES: usize = 64;

/// OS descriptor/handle type: a file descriptor on POSIX platforms, a
/// wait-object `HANDLE` on Windows.
#[cfg(unix)]
pub type Handle = std::os::unix::io::RawFd;
#[cfg(windows)]
pub type Handle = windows::Win32::Foundation::HANDLE;

/// One pollable source. `ready` is updated by [poll].
#[derive(Debug, Clone, Copy)]
pub struct PollSource
{
	pub handle: Handle,
	/// Free for the caller, [poll] does not interpret it.
	pub tag: u64,
	pub ready: bool,
}

impl PollSource
{
	pub fn new(handle: Handle, tag: u64) -> Self
	{
		Self {
			handle,
			tag,
			ready: false,
		}
	}
}

/// Milliseconds elapsed on the monotonic clock since the first call into this module.
pub fn millis() -> u64
{
	static EPOCH: OnceLock<Instant> = OnceLock::new();
	EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Compute the time remaining from a total timeout and the [millis] value captured
/// when the operation started. Negative (infinite) timeouts pass through unchanged.
pub fn adjust_timeout(timeout: i32, start: u64) -> i32
{
	if timeout < 0 {
		return -1;
	}

	let now = millis();
	if now > start + timeout as u64 {
		return 0;
	}
	(start + timeout as u64 - now) as i32
}

/// Block until at least one source becomes readable, the timeout expires or an
/// error occurs. On return each source's `ready` flag is up to date; the number
/// of ready sources is returned (0 on timeout).
///
/// Interrupted waits are restarted with the remaining time.
#[cfg(unix)]
pub fn poll(sources: &mut [PollSource], timeout: i32) -> Result<usize>
{
	assert!(!sources.is_empty());
	assert!(sources.len() <= POLL_MAX_SOURCES);

	let mut pollfds: Vec<libc::pollfd> = sources
		.iter()
		.map(|source| libc::pollfd {
			fd: source.handle,
			events: libc::POLLIN,
			revents: 0,
		})
		.collect();

	let start = millis();
	let ready = loop {
		let adjusted = adjust_timeout(timeout, start);
		let r = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, adjusted) };
		if r >= 0 {
			break r as usize;
		}

		let errno = std::io::Error::last_os_error();
		if errno.raw_os_error() == Some(libc::EINTR) {
			continue;
		}
		return Err(ErrorKind::System.report_from(format!("poll() failed: {}", errno), errno));
	};

	for (source, pollfd) in sources.iter_mut().zip(&pollfds) {
		source.ready = pollfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0;
	}

	Ok(ready)
}

#[cfg(windows)]
pub fn poll(sources: &mut [PollSource], timeout: i32) -> Result<usize>
{
	use windows::Win32::Foundation::{WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT};
	use windows::Win32::System::Threading::{INFINITE, WaitForMultipleObjects, WaitForSingleObject};

	assert!(!sources.is_empty());
	assert!(sources.len() <= POLL_MAX_SOURCES);

	let handles: Vec<windows::Win32::Foundation::HANDLE> =
		sources.iter().map(|source| source.handle).collect();
	let wait_timeout = if timeout < 0 { INFINITE } else { timeout as u32 };

	let event = unsafe { WaitForMultipleObjects(&handles, false, wait_timeout) };
	if event == WAIT_FAILED {
		let errno = std::io::Error::last_os_error();
		return Err(ErrorKind::System
			.report_from(format!("WaitForMultipleObjects() failed: {}", errno), errno));
	}
	if event == WAIT_TIMEOUT {
		for source in sources.iter_mut() {
			source.ready = false;
		}
		return Ok(0);
	}

	// WaitForMultipleObjects() only reports the lowest signaled object, test
	// the others individually so every ready flag is accurate.
	let first = (event.0 - WAIT_OBJECT_0.0) as usize;
	let mut ready = 0;
	for (idx, source) in sources.iter_mut().enumerate() {
		source.ready = idx == first
			|| unsafe { WaitForSingleObject(source.handle, 0) } == WAIT_OBJECT_0;
		ready += source.ready as usize;
	}

	Ok(ready)
}

/// Kernel version as a single ordered number: major * 10^7 + minor * 10^5 + patch * 10^3.
/// Linux 2.6.28 maps to 20628000.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn linux_version() -> u32
{
	static VERSION: OnceLock<u32> = OnceLock::new();

	*VERSION.get_or_init(|| {
		let mut utsname: libc::utsname = unsafe { std::mem::zeroed() };
		if unsafe { libc::uname(&mut utsname) } < 0 {
			return 0;
		}

		let release = unsafe { std::ffi::CStr::from_ptr(utsname.release.as_ptr()) };
		let release = release.to_string_lossy();

		// Release strings look like "6.8.0-41-generic", only the dotted prefix matters
		let mut parts = release
			.split(|c: char| !c.is_ascii_digit())
			.take(3)
			.map(|part| part.parse::<u32>().unwrap_or(0));
		let major = parts.next().unwrap_or(0);
		let minor = parts.next().unwrap_or(0);
		let patch = parts.next().unwrap_or(0);

		major * 10_000_000 + minor * 100_000 + patch * 1_000
	})
}

/// True when running on Windows 10 or later, used to size the default task pool.
#[cfg(windows)]
pub fn windows_is_10_or_later() -> bool
{
	use windows::Win32::System::SystemInformation::{GetVersionExW, OSVERSIONINFOW};

	static IS_10: OnceLock<bool> = OnceLock::new();

	*IS_10.get_or_init(|| {
		let mut info = OSVERSIONINFOW {
			dwOSVersionInfoSize: std::mem::size_of::<OSVERSIONINFOW>() as u32,
			..Default::default()
		};
		unsafe { GetVersionExW(&mut info) }.is_ok() && info.dwMajorVersion >= 10
	})
}
