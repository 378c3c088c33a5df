// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors
//! Module for error handling code.
//!
//! Every fallible operation in this crate returns [`Result<T>`]. On top of that,
//! the last formatted error message is kept in a thread-local buffer so front-ends
//! can display it without threading the [`Error`] value around, and error kinds can
//! be temporarily masked to keep expected failures (such as probing for a device
//! that may not be there) out of the log.

use std::cell::RefCell;
#[cfg(feature = "backtrace")]
use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error as StdError;
use std::fmt::{Display, Formatter};

use thiserror::Error as ThisError;

/// More convenient alias for `Box<dyn StdError + Send + Sync>`,
/// which shows up in a few signatures and structs.
type BoxedError = Box<dyn StdError + Send + Sync>;

pub type Result<T> = std::result::Result<T, Error>;

/// Kinds of errors for [Error]. Use [ErrorKind::report] and [ErrorKind::report_from] to
/// generate the [Error] value for this ErrorKind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind
{
	/// Allocation or other memory failure.
	Memory,

	/// Missing resource (device, file, interface).
	NotFound,

	/// Permission denied.
	Access,

	/// Input/output error.
	Io,

	/// Parse error (match strings, firmware files).
	Parse,

	/// Generic system error.
	System,
}

thread_local! {
	static LAST_MESSAGE: RefCell<String> = const { RefCell::new(String::new()) };
	static MASKED_KINDS: RefCell<Vec<ErrorKind>> = const { RefCell::new(Vec::new()) };
}

/// Get the last error message reported on the current thread.
///
/// This only exists as a convenience for CLI/GUI display code, the message is
/// always carried by the [Error] value itself too.
pub fn last_error_message() -> String
{
	LAST_MESSAGE.with_borrow(|msg| msg.clone())
}

impl ErrorKind
{
	fn generic_message(self) -> &'static str
	{
		match self {
			ErrorKind::Memory => "Memory error",
			ErrorKind::NotFound => "Not found",
			ErrorKind::Access => "Permission error",
			ErrorKind::Io => "I/O error",
			ErrorKind::Parse => "Parse error",
			ErrorKind::System => "System error",
		}
	}

	/// Creates a new [Error] of this kind carrying the generic message for the kind.
	#[inline]
	pub fn error(self) -> Error
	{
		Error::new(self, self.generic_message().to_string(), None)
	}

	/// Creates a new [Error] with a formatted message, records the message in the
	/// thread-local buffer and logs it unless this kind is currently masked.
	///
	/// Enables convenient code like:
	/// ```ignore
	/// return Err(ErrorKind::Io.report(format!("I/O error while reading from '{path}'")));
	/// ```
	#[inline]
	pub fn report(self, msg: impl Into<String>) -> Error
	{
		Error::new(self, msg.into(), None)
	}

	/// Like [ErrorKind::report], with the passed error attached as the source.
	#[inline]
	pub fn report_from<E: StdError + Send + Sync + 'static>(self, msg: impl Into<String>, source: E) -> Error
	{
		Error::new(self, msg.into(), Some(Box::new(source)))
	}

	/// Mask this error kind on the current thread until the returned guard is dropped.
	///
	/// Masking does not change what the failing function returns, it only keeps the
	/// message out of the log. The masked kinds form a stack, guards must be dropped
	/// in reverse creation order (which scoping enforces naturally).
	#[must_use]
	pub fn mask(self) -> MaskGuard
	{
		MASKED_KINDS.with_borrow_mut(|masked| masked.push(self));
		MaskGuard(())
	}

	/// Check whether this error kind is currently masked on this thread.
	pub fn is_masked(self) -> bool
	{
		MASKED_KINDS.with_borrow(|masked| masked.contains(&self))
	}

	/// Pick the kind best describing an OS-level I/O failure.
	pub(crate) fn from_io(e: &std::io::Error) -> ErrorKind
	{
		match e.kind() {
			std::io::ErrorKind::NotFound => ErrorKind::NotFound,
			std::io::ErrorKind::PermissionDenied => ErrorKind::Access,
			_ => ErrorKind::Io,
		}
	}
}

/// RAII guard returned by [ErrorKind::mask], unmasks on drop.
pub struct MaskGuard(());

impl Drop for MaskGuard
{
	fn drop(&mut self)
	{
		MASKED_KINDS.with_borrow_mut(|masked| {
			masked.pop();
		});
	}
}

impl Display for ErrorKind
{
	fn fmt(&self, f: &mut Formatter) -> std::fmt::Result
	{
		write!(f, "{}", self.generic_message())
	}
}

#[derive(Debug)]
/// Error type for device and board operations. Easily constructed from [ErrorKind].
pub struct Error
{
	pub kind: ErrorKind,
	message: String,
	pub source: Option<BoxedError>,

	/// Stores the backtrace for this error.
	#[cfg(feature = "backtrace")]
	pub backtrace: Box<Backtrace>,

	/// A string for additional context about what was being attempted when this error occurred.
	///
	/// Example: "switching board to bootloader mode".
	pub context: Option<String>,
}

impl Error
{
	pub fn new(kind: ErrorKind, message: String, source: Option<BoxedError>) -> Self
	{
		LAST_MESSAGE.with_borrow_mut(|last| last.clone_from(&message));
		if !kind.is_masked() {
			log::error!("{}", message);
		}

		Self {
			kind,
			message,
			source,
			context: None,
			#[cfg(feature = "backtrace")]
			backtrace: Box::new(Backtrace::capture()),
		}
	}

	pub fn message(&self) -> &str
	{
		&self.message
	}

	/// Add additional context about what was being attempted when this error occurred.
	pub fn with_ctx(mut self, ctx: &str) -> Self
	{
		self.context = Some(ctx.to_string());
		self
	}
}

impl Display for Error
{
	fn fmt(&self, f: &mut Formatter) -> std::fmt::Result
	{
		if let Some(ctx) = &self.context {
			write!(f, "(while {}): {}", ctx, self.message)?;
		} else {
			write!(f, "{}", self.message)?;
		}

		#[cfg(feature = "backtrace")]
		{
			if self.backtrace.status() == BacktraceStatus::Captured {
				write!(f, "\nBacktrace:\n{}", self.backtrace)?;
			}
		}

		if let Some(source) = &self.source {
			write!(f, "\nCaused by: {}", source)?;
		}

		Ok(())
	}
}

impl StdError for Error
{
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)>
	{
		self.source.as_deref().map(|e| e as &dyn StdError)
	}
}

impl From<ErrorKind> for Error
{
	fn from(other: ErrorKind) -> Self
	{
		other.error()
	}
}

impl From<std::io::Error> for Error
{
	fn from(other: std::io::Error) -> Self
	{
		use std::io::ErrorKind as IoKind;
		let kind = match other.kind() {
			IoKind::NotFound => ErrorKind::NotFound,
			IoKind::PermissionDenied => ErrorKind::Access,
			IoKind::OutOfMemory => ErrorKind::Memory,
			IoKind::BrokenPipe | IoKind::UnexpectedEof | IoKind::TimedOut => ErrorKind::Io,
			_ => ErrorKind::System,
		};
		kind.report_from(other.to_string(), ErrorSource::StdIo(other))
	}
}

impl From<goblin::error::Error> for Error
{
	fn from(other: goblin::error::Error) -> Self
	{
		ErrorKind::Parse.report_from(format!("ELF parsing error: {}", other), ErrorSource::Goblin(other))
	}
}

/// Sources of external error in this library.
#[derive(Debug, ThisError)]
pub enum ErrorSource
{
	#[error(transparent)]
	StdIo(#[from] std::io::Error),

	#[error(transparent)]
	Goblin(#[from] goblin::error::Error),
}
