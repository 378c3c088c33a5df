// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors
//! File-descriptor backed ports for POSIX systems: serial devices everywhere,
//! hidraw nodes on Linux.

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use crate::device::{DeviceType, PortMode, SharedDevice};
use crate::error::{ErrorKind, Result};
use crate::platform::{Handle, adjust_timeout, millis};
use crate::port::{Dtr, Parity, Rts, SerialConfig, XonXoff};

#[cfg(any(target_os = "linux", target_os = "android"))]
nix::ioctl_readwrite_buf!(hidraw_sfeature, b'H', 0x06, u8);
#[cfg(any(target_os = "linux", target_os = "android"))]
nix::ioctl_readwrite_buf!(hidraw_gfeature, b'H', 0x07, u8);

pub(super) struct FilePort
{
	fd: OwnedFd,
	mode: PortMode,
	dev: SharedDevice,

	#[cfg(any(target_os = "linux", target_os = "android"))]
	numbered_reports: bool,
	/// Scratch buffer for the old-kernel hidraw workaround, see [FilePort::hid_read].
	#[cfg(any(target_os = "linux", target_os = "android"))]
	read_buf: Vec<u8>,
}

fn io_error(path: &str, errno: std::io::Error) -> crate::error::Error
{
	ErrorKind::Io.report(format!("I/O error while accessing '{}': {}", path, errno))
}

impl FilePort
{
	pub(super) fn open(dev: &SharedDevice, mode: PortMode) -> Result<Self>
	{
		let path = CString::new(dev.path.as_str())
			.map_err(|_| ErrorKind::System.report(format!("Invalid device path '{}'", dev.path)))?;

		let mut fd_flags = libc::O_CLOEXEC | libc::O_NOCTTY | libc::O_NONBLOCK;
		fd_flags |= match mode {
			PortMode::Read => libc::O_RDONLY,
			PortMode::Write => libc::O_WRONLY,
			PortMode::ReadWrite => libc::O_RDWR,
		};

		#[cfg(target_os = "macos")]
		let mut busy_retries = 4u32;

		let fd = loop {
			let fd = unsafe { libc::open(path.as_ptr(), fd_flags) };
			if fd >= 0 {
				break unsafe { OwnedFd::from_raw_fd(fd) };
			}

			let errno = std::io::Error::last_os_error();
			match errno.raw_os_error().unwrap_or(0) {
				libc::EINTR => continue,

				libc::EACCES => {
					return Err(ErrorKind::Access
						.report(format!("Permission denied for device '{}'", dev.path)));
				},
				libc::EIO | libc::ENXIO | libc::ENODEV => {
					return Err(ErrorKind::Io
						.report(format!("I/O error while opening device '{}'", dev.path)));
				},
				libc::ENOENT | libc::ENOTDIR => {
					return Err(ErrorKind::NotFound
						.report(format!("Device '{}' not found", dev.path)));
				},

				// On El Capitan (and maybe before), open fails for several tens of
				// milliseconds after the device notification
				#[cfg(target_os = "macos")]
				libc::EBUSY if busy_retries > 0 => {
					busy_retries -= 1;
					std::thread::sleep(std::time::Duration::from_millis(20));
					continue;
				},

				_ => {
					return Err(ErrorKind::System
						.report(format!("open('{}') failed: {}", dev.path, errno)));
				},
			}
		};

		let port = Self {
			fd,
			mode,
			dev: dev.clone(),
			#[cfg(any(target_os = "linux", target_os = "android"))]
			numbered_reports: dev.hid.numbered_reports,
			#[cfg(any(target_os = "linux", target_os = "android"))]
			read_buf: Vec::new(),
		};

		if dev.dev_type == DeviceType::Serial {
			port.setup_serial()?;
		}

		Ok(port)
	}

	/// Raw I/O and sane settings, with DTR set by default even on platforms
	/// that don't enforce that.
	fn setup_serial(&self) -> Result<()>
	{
		let fd = self.fd.as_raw_fd();
		let path = &self.dev.path;

		let mut tio: libc::termios = unsafe { std::mem::zeroed() };
		if unsafe { libc::tcgetattr(fd, &mut tio) } < 0 {
			let errno = std::io::Error::last_os_error();
			return Err(ErrorKind::System
				.report(format!("tcgetattr() failed on '{}': {}", path, errno)));
		}

		unsafe { libc::cfmakeraw(&mut tio) };
		tio.c_cc[libc::VMIN] = 0;
		tio.c_cc[libc::VTIME] = 0;
		tio.c_cflag |= libc::CLOCAL | libc::CREAD | libc::HUPCL;

		if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tio) } < 0 {
			let errno = std::io::Error::last_os_error();
			return Err(ErrorKind::System
				.report(format!("tcsetattr() failed on '{}': {}", path, errno)));
		}

		let modem_bits: libc::c_int = libc::TIOCM_DTR;
		if unsafe { libc::ioctl(fd, libc::TIOCMBIS, &modem_bits) } < 0 {
			let errno = std::io::Error::last_os_error();
			return Err(ErrorKind::System.report(format!(
				"ioctl(TIOCMBIS, TIOCM_DTR) failed on '{}': {}",
				path, errno
			)));
		}

		if unsafe { libc::tcflush(fd, libc::TCIFLUSH) } < 0 {
			let errno = std::io::Error::last_os_error();
			return Err(ErrorKind::System
				.report(format!("tcflush(TCIFLUSH) failed on '{}': {}", path, errno)));
		}

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
		self.fd.as_raw_fd()
	}

	/// Wait for the descriptor with the time remaining from `start`, restarting on
	/// EINTR. Returns false on timeout.
	fn wait_readable(&self, timeout: i32, start: u64) -> Result<bool>
	{
		self.wait(libc::POLLIN, timeout, start)
	}

	fn wait(&self, events: libc::c_short, timeout: i32, start: u64) -> Result<bool>
	{
		let mut pollfd = libc::pollfd {
			fd: self.fd.as_raw_fd(),
			events,
			revents: 0,
		};

		loop {
			let r = unsafe { libc::poll(&mut pollfd, 1, adjust_timeout(timeout, start)) };
			if r >= 0 {
				return Ok(r > 0);
			}

			let errno = std::io::Error::last_os_error();
			if errno.raw_os_error() == Some(libc::EINTR) {
				continue;
			}
			return Err(io_error(&self.dev.path, errno));
		}
	}

	pub(super) fn serial_read(&mut self, buf: &mut [u8], timeout: i32) -> Result<usize>
	{
		if timeout != 0 && !self.wait_readable(timeout, millis())? {
			return Ok(0);
		}

		let r = unsafe {
			libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
		};
		if r < 0 {
			let errno = std::io::Error::last_os_error();
			match errno.raw_os_error().unwrap_or(0) {
				libc::EAGAIN => return Ok(0),
				_ => return Err(io_error(&self.dev.path, errno)),
			}
		}

		Ok(r as usize)
	}

	pub(super) fn serial_write(&mut self, buf: &[u8], timeout: i32) -> Result<usize>
	{
		let start = millis();
		let mut written = 0usize;

		while written < buf.len() {
			if !self.wait(libc::POLLOUT, timeout, start)? {
				break;
			}

			let r = unsafe {
				libc::write(
					self.fd.as_raw_fd(),
					buf[written..].as_ptr() as *const libc::c_void,
					buf.len() - written,
				)
			};
			if r < 0 {
				let errno = std::io::Error::last_os_error();
				if errno.raw_os_error() == Some(libc::EINTR) {
					continue;
				}
				return Err(io_error(&self.dev.path, errno));
			}
			written += r as usize;

			if adjust_timeout(timeout, start) == 0 {
				break;
			}
		}

		Ok(written)
	}

	pub(super) fn serial_set_config(&mut self, config: &SerialConfig) -> Result<()>
	{
		let fd = self.fd.as_raw_fd();
		let path = &self.dev.path;

		let mut tio: libc::termios = unsafe { std::mem::zeroed() };
		if unsafe { libc::tcgetattr(fd, &mut tio) } < 0 {
			let errno = std::io::Error::last_os_error();
			return Err(ErrorKind::System
				.report(format!("Unable to get serial port settings from '{}': {}", path, errno)));
		}
		let mut modem_bits: libc::c_int = 0;
		if unsafe { libc::ioctl(fd, libc::TIOCMGET, &mut modem_bits) } < 0 {
			let errno = std::io::Error::last_os_error();
			return Err(ErrorKind::System
				.report(format!("Unable to get modem bits from '{}': {}", path, errno)));
		}

		if let Some(baudrate) = config.baudrate {
			let std_baudrate = match baudrate {
				110 => libc::B110,
				134 => libc::B134,
				150 => libc::B150,
				200 => libc::B200,
				300 => libc::B300,
				600 => libc::B600,
				1200 => libc::B1200,
				1800 => libc::B1800,
				2400 => libc::B2400,
				4800 => libc::B4800,
				9600 => libc::B9600,
				19200 => libc::B19200,
				38400 => libc::B38400,
				57600 => libc::B57600,
				115200 => libc::B115200,
				230400 => libc::B230400,
				_ => {
					return Err(ErrorKind::System
						.report(format!("Unsupported baud rate value: {}", baudrate)));
				},
			};

			unsafe {
				libc::cfsetispeed(&mut tio, std_baudrate);
				libc::cfsetospeed(&mut tio, std_baudrate);
			}
		}

		if let Some(databits) = config.databits {
			tio.c_cflag &= !libc::CSIZE;
			tio.c_cflag |= match databits {
				5 => libc::CS5,
				6 => libc::CS6,
				7 => libc::CS7,
				8 => libc::CS8,
				_ => {
					return Err(ErrorKind::System
						.report(format!("Invalid data bits setting: {}", databits)));
				},
			};
		}

		if let Some(stopbits) = config.stopbits {
			tio.c_cflag &= !libc::CSTOPB;
			match stopbits {
				1 => {},
				2 => tio.c_cflag |= libc::CSTOPB,
				_ => {
					return Err(ErrorKind::System
						.report(format!("Invalid stop bits setting: {}", stopbits)));
				},
			}
		}

		if let Some(parity) = config.parity {
			tio.c_cflag &= !(libc::PARENB | libc::PARODD);
			#[cfg(any(target_os = "linux", target_os = "android"))]
			{
				tio.c_cflag &= !libc::CMSPAR;
			}

			match parity {
				Parity::Off => {},
				Parity::Even => tio.c_cflag |= libc::PARENB,
				Parity::Odd => tio.c_cflag |= libc::PARENB | libc::PARODD,
				#[cfg(any(target_os = "linux", target_os = "android"))]
				Parity::Space => tio.c_cflag |= libc::PARENB | libc::CMSPAR,
				#[cfg(any(target_os = "linux", target_os = "android"))]
				Parity::Mark => tio.c_cflag |= libc::PARENB | libc::PARODD | libc::CMSPAR,
				#[cfg(not(any(target_os = "linux", target_os = "android")))]
				Parity::Mark | Parity::Space => {
					return Err(ErrorKind::System.report("Mark/space parity is not supported"));
				},
			}
		}

		if let Some(rts) = config.rts {
			tio.c_cflag &= !libc::CRTSCTS;
			modem_bits &= !libc::TIOCM_RTS;

			match rts {
				Rts::Off => {},
				Rts::On => modem_bits |= libc::TIOCM_RTS,
				Rts::Flow => tio.c_cflag |= libc::CRTSCTS,
			}
		}

		match config.dtr {
			None => {},
			Some(Dtr::Off) => modem_bits &= !libc::TIOCM_DTR,
			Some(Dtr::On) => modem_bits |= libc::TIOCM_DTR,
		}

		if let Some(xonxoff) = config.xonxoff {
			tio.c_iflag &= !(libc::IXON | libc::IXOFF | libc::IXANY);

			match xonxoff {
				XonXoff::Off => {},
				XonXoff::In => tio.c_iflag |= libc::IXOFF,
				XonXoff::Out => tio.c_iflag |= libc::IXON | libc::IXANY,
				XonXoff::InOut => tio.c_iflag |= libc::IXOFF | libc::IXON | libc::IXANY,
			}
		}

		if unsafe { libc::ioctl(fd, libc::TIOCMSET, &modem_bits) } < 0 {
			let errno = std::io::Error::last_os_error();
			return Err(ErrorKind::System
				.report(format!("Unable to set modem bits of '{}': {}", path, errno)));
		}
		if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tio) } < 0 {
			let errno = std::io::Error::last_os_error();
			return Err(ErrorKind::System
				.report(format!("Unable to change serial port settings of '{}': {}", path, errno)));
		}

		Ok(())
	}

	pub(super) fn serial_get_config(&mut self) -> Result<SerialConfig>
	{
		let fd = self.fd.as_raw_fd();
		let path = &self.dev.path;

		let mut tio: libc::termios = unsafe { std::mem::zeroed() };
		if unsafe { libc::tcgetattr(fd, &mut tio) } < 0 {
			let errno = std::io::Error::last_os_error();
			return Err(ErrorKind::System
				.report(format!("Unable to read port settings from '{}': {}", path, errno)));
		}
		let mut modem_bits: libc::c_int = 0;
		if unsafe { libc::ioctl(fd, libc::TIOCMGET, &mut modem_bits) } < 0 {
			let errno = std::io::Error::last_os_error();
			return Err(ErrorKind::System
				.report(format!("Unable to get modem bits from '{}': {}", path, errno)));
		}

		// None is the unknown value for every field: settings we cannot express
		// stay None so a subsequent set_config() does not clobber them
		let mut config = SerialConfig::default();

		config.baudrate = match unsafe { libc::cfgetispeed(&tio) } {
			libc::B110 => Some(110),
			libc::B134 => Some(134),
			libc::B150 => Some(150),
			libc::B200 => Some(200),
			libc::B300 => Some(300),
			libc::B600 => Some(600),
			libc::B1200 => Some(1200),
			libc::B1800 => Some(1800),
			libc::B2400 => Some(2400),
			libc::B4800 => Some(4800),
			libc::B9600 => Some(9600),
			libc::B19200 => Some(19200),
			libc::B38400 => Some(38400),
			libc::B57600 => Some(57600),
			libc::B115200 => Some(115200),
			libc::B230400 => Some(230400),
			_ => None,
		};

		config.databits = match tio.c_cflag & libc::CSIZE {
			libc::CS5 => Some(5),
			libc::CS6 => Some(6),
			libc::CS7 => Some(7),
			libc::CS8 => Some(8),
			_ => None,
		};

		config.stopbits = Some(if tio.c_cflag & libc::CSTOPB != 0 { 2 } else { 1 });

		config.parity = if tio.c_cflag & libc::PARENB != 0 {
			#[cfg(any(target_os = "linux", target_os = "android"))]
			{
				match tio.c_cflag & (libc::PARODD | libc::CMSPAR) {
					0 => Some(Parity::Even),
					libc::PARODD => Some(Parity::Odd),
					libc::CMSPAR => Some(Parity::Space),
					_ => Some(Parity::Mark),
				}
			}
			#[cfg(not(any(target_os = "linux", target_os = "android")))]
			{
				if tio.c_cflag & libc::PARODD != 0 {
					Some(Parity::Odd)
				} else {
					Some(Parity::Even)
				}
			}
		} else {
			Some(Parity::Off)
		};

		config.rts = if tio.c_cflag & libc::CRTSCTS != 0 {
			Some(Rts::Flow)
		} else if modem_bits & libc::TIOCM_RTS != 0 {
			Some(Rts::On)
		} else {
			Some(Rts::Off)
		};

		config.dtr = Some(if modem_bits & libc::TIOCM_DTR != 0 { Dtr::On } else { Dtr::Off });

		config.xonxoff = match tio.c_iflag & (libc::IXON | libc::IXOFF) {
			0 => Some(XonXoff::Off),
			libc::IXOFF => Some(XonXoff::In),
			libc::IXON => Some(XonXoff::Out),
			_ => Some(XonXoff::InOut),
		};

		Ok(config)
	}
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl FilePort
{
	/// Work around a hidraw bug introduced in Linux 2.6.28 and fixed in 2.6.34:
	/// numbered reports come back with a spurious extra byte that has to be
	/// stripped, see kernel commit 5a38f2c7c4dd.
	fn kernel26_byte_bug() -> bool
	{
		let version = crate::platform::linux_version();
		(20_628_000..20_634_000).contains(&version)
	}

	pub(super) fn hid_read(&mut self, buf: &mut [u8], timeout: i32) -> Result<usize>
	{
		if timeout != 0 && !self.wait_readable(timeout, millis())? {
			return Ok(0);
		}

		let fd = self.fd.as_raw_fd();
		let r = if self.numbered_reports {
			if Self::kernel26_byte_bug() {
				self.read_buf.resize(buf.len() + 1, 0);
				let mut r = unsafe {
					libc::read(fd, self.read_buf.as_mut_ptr() as *mut libc::c_void, buf.len() + 1)
				};
				if r > 0 {
					r -= 1;
					buf[..r as usize].copy_from_slice(&self.read_buf[1..=r as usize]);
				}
				r
			} else {
				unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) }
			}
		} else {
			// The kernel does not hand us a report ID for unnumbered reports,
			// synthesize the conventional zero byte
			let r = unsafe {
				libc::read(fd, buf[1..].as_mut_ptr() as *mut libc::c_void, buf.len() - 1)
			};
			if r > 0 {
				buf[0] = 0;
				r + 1
			} else {
				r
			}
		};

		if r < 0 {
			let errno = std::io::Error::last_os_error();
			match errno.raw_os_error().unwrap_or(0) {
				libc::EAGAIN => return Ok(0),
				_ => return Err(io_error(&self.dev.path, errno)),
			}
		}

		Ok(r as usize)
	}

	pub(super) fn hid_write(&mut self, buf: &[u8]) -> Result<usize>
	{
		if buf.len() < 2 {
			return Ok(0);
		}

		// On Linux, USB requests time out after 5000ms and O_NONBLOCK is not
		// honoured for write
		loop {
			let r = unsafe {
				libc::write(self.fd.as_raw_fd(), buf.as_ptr() as *const libc::c_void, buf.len())
			};
			if r >= 0 {
				return Ok(r as usize);
			}

			let errno = std::io::Error::last_os_error();
			if errno.raw_os_error() == Some(libc::EINTR) {
				continue;
			}
			return Err(io_error(&self.dev.path, errno));
		}
	}

	pub(super) fn hid_get_feature_report(&mut self, report_id: u8, buf: &mut [u8]) -> Result<usize>
	{
		if buf.len() >= 2 {
			buf[1] = report_id;
		}

		let fd = self.fd.as_raw_fd();
		let len = buf.len();
		let r = loop {
			match unsafe { hidraw_gfeature(fd, &mut buf[1..len]) } {
				Ok(r) => break r,
				Err(nix::errno::Errno::EINTR) => continue,
				Err(errno) => return Err(io_error(&self.dev.path, errno.into())),
			}
		};

		buf[0] = report_id;
		Ok(r as usize + 1)
	}

	pub(super) fn hid_send_feature_report(&mut self, buf: &[u8]) -> Result<usize>
	{
		if buf.len() < 2 {
			return Ok(0);
		}

		// The ioctl is defined read-write, it needs a mutable copy
		let mut report = buf.to_vec();
		let fd = self.fd.as_raw_fd();
		let r = loop {
			match unsafe { hidraw_sfeature(fd, &mut report) } {
				Ok(r) => break r,
				Err(nix::errno::Errno::EINTR) => continue,
				Err(errno) => return Err(io_error(&self.dev.path, errno.into())),
			}
		};

		Ok(r as usize)
	}
}

#[cfg(target_os = "macos")]
impl FilePort
{
	// HID I/O goes through the IOKit run-loop port on macOS, file ports only ever
	// carry serial devices there

	pub(super) fn hid_read(&mut self, _buf: &mut [u8], _timeout: i32) -> Result<usize>
	{
		unreachable!("HID devices are not file-backed on macOS");
	}

	pub(super) fn hid_write(&mut self, _buf: &[u8]) -> Result<usize>
	{
		unreachable!("HID devices are not file-backed on macOS");
	}

	pub(super) fn hid_get_feature_report(&mut self, _report_id: u8, _buf: &mut [u8]) -> Result<usize>
	{
		unreachable!("HID devices are not file-backed on macOS");
	}

	pub(super) fn hid_send_feature_report(&mut self, _buf: &[u8]) -> Result<usize>
	{
		unreachable!("HID devices are not file-backed on macOS");
	}
}
