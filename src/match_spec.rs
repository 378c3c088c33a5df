// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors
//! Device match predicates.
//!
//! A [MatchSpec] selects devices by type, VID/PID and/or device path; fields left
//! unset match anything. Monitors and [`crate::monitor::enumerate`] take a slice of
//! specs, a device is reported if any spec accepts it and the accepting spec's tag
//! is copied onto the device record.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use crate::device::{Device, DeviceType};
use crate::error::{Error, ErrorKind};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchSpec
{
	dev_type: Option<DeviceType>,
	vid: Option<u16>,
	pid: Option<u16>,
	path: Option<String>,
	/// Opaque user value copied to [`Device::match_tag`] on matching devices.
	pub tag: u64,
}

impl MatchSpec
{
	pub fn new() -> Self
	{
		Default::default()
	}

	/// Match devices with this USB VID/PID pair. Zero means "any", mirroring
	/// the match string grammar.
	#[must_use]
	pub fn vid_pid(mut self, vid: u16, pid: u16) -> Self
	{
		self.vid = (vid != 0).then_some(vid);
		self.pid = (pid != 0).then_some(pid);
		self
	}

	/// Restrict the spec to one device type.
	#[must_use]
	pub fn dev_type(mut self, dev_type: DeviceType) -> Self
	{
		self.dev_type = Some(dev_type);
		self
	}

	/// Match a single device node path.
	#[must_use]
	pub fn path(mut self, path: impl Into<String>) -> Self
	{
		self.path = Some(path.into());
		self
	}

	/// Attach an opaque tag, delivered on matching devices.
	#[must_use]
	pub fn with_tag(mut self, tag: u64) -> Self
	{
		self.tag = tag;
		self
	}

	pub fn get_type(&self) -> Option<DeviceType>
	{
		self.dev_type
	}

	/// Test one device against this spec: every present field must agree.
	pub fn matches(&self, dev: &Device) -> bool
	{
		if self.dev_type.is_some_and(|t| t != dev.dev_type) {
			return false;
		}
		if self.vid.is_some_and(|vid| vid != dev.vid) {
			return false;
		}
		if self.pid.is_some_and(|pid| pid != dev.pid) {
			return false;
		}
		if let Some(path) = &self.path {
			if !same_path(path, &dev.path) {
				return false;
			}
		}

		true
	}
}

/// Compare two device paths by filesystem identity where possible, falling back
/// to a plain string comparison (Windows device interface paths, macOS registry
/// paths and unlinked nodes).
fn same_path(a: &str, b: &str) -> bool
{
	if a == b {
		return true;
	}

	#[cfg(unix)]
	{
		use std::os::unix::fs::MetadataExt;

		if let (Ok(meta_a), Ok(meta_b)) = (std::fs::metadata(a), std::fs::metadata(b)) {
			return meta_a.dev() == meta_b.dev() && meta_a.ino() == meta_b.ino();
		}
	}

	false
}

impl FromStr for MatchSpec
{
	type Err = Error;

	/// Parse a `VID:PID[/TYPE]` match string: hex VID and PID, `TYPE` one of
	/// `hid`/`serial`, zero values mean "any". Leading whitespace is tolerated.
	fn from_str(s: &str) -> Result<Self, Error>
	{
		let trimmed = s.trim_start();
		if trimmed.is_empty() {
			return Ok(MatchSpec::new());
		}

		let (ids, type_str) = match trimmed.split_once('/') {
			Some((ids, type_str)) => (ids, Some(type_str)),
			None => (trimmed, None),
		};

		let (vid_str, pid_str) = ids
			.split_once(':')
			.ok_or_else(|| ErrorKind::Parse.report(format!("Malformed device match string '{}'", s)))?;
		let vid = u16::from_str_radix(vid_str, 16)
			.map_err(|_| ErrorKind::Parse.report(format!("Malformed device match string '{}'", s)))?;
		let pid = u16::from_str_radix(pid_str, 16)
			.map_err(|_| ErrorKind::Parse.report(format!("Malformed device match string '{}'", s)))?;

		let mut spec = MatchSpec::new().vid_pid(vid, pid);
		if let Some(type_str) = type_str {
			spec = spec.dev_type(type_str.parse().map_err(|_| {
				ErrorKind::Parse
					.report(format!("Unknown device type '{}' in match string '{}'", type_str, s))
			})?);
		}

		Ok(spec)
	}
}

impl Display for MatchSpec
{
	/// Canonical form, parseable back by [FromStr]. The path field has no place
	/// in the grammar and is omitted.
	fn fmt(&self, f: &mut Formatter) -> fmt::Result
	{
		write!(f, "{:04x}:{:04x}", self.vid.unwrap_or(0), self.pid.unwrap_or(0))?;
		if let Some(dev_type) = self.dev_type {
			write!(f, "/{}", dev_type)?;
		}
		Ok(())
	}
}

/// A compiled set of match specs with a precomputed type mask, so monitors can
/// skip whole OS subsystems no spec is interested in.
#[derive(Debug, Clone, Default)]
pub struct MatchSet
{
	specs: Vec<MatchSpec>,
	types: u32,
}

impl MatchSet
{
	pub fn new(specs: Vec<MatchSpec>) -> Self
	{
		let mut types = 0u32;
		for spec in &specs {
			match spec.get_type() {
				Some(dev_type) => types |= 1 << dev_type as u32,
				None => {
					types = u32::MAX;
					break;
				},
			}
		}
		if specs.is_empty() {
			types = u32::MAX;
		}

		Self {
			specs,
			types,
		}
	}

	pub fn has_type(&self, dev_type: DeviceType) -> bool
	{
		self.types & (1 << dev_type as u32) != 0
	}

	/// Test a device against the whole set. An empty set accepts everything.
	/// Returns the accepting spec's tag.
	pub fn matches(&self, dev: &Device) -> Option<u64>
	{
		if !self.has_type(dev.dev_type) {
			return None;
		}
		if self.specs.is_empty() {
			return Some(0);
		}

		self.specs
			.iter()
			.find(|spec| spec.matches(dev))
			.map(|spec| spec.tag)
	}
}
