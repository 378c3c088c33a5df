// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors
//! Firmware image loading.
//!
//! Four on-disk formats are understood: Intel HEX, Motorola SREC, ELF and raw
//! binary. Whatever the input, loading produces the same normalized form: a
//! sorted list of non-overlapping, coalesced memory segments. Whether an image
//! actually fits a given board is checked at upload time, not here.

use std::path::Path;

use crate::error::{ErrorKind, Result};

mod elf;
mod ihex;
mod raw;
mod srec;

/// Hard cap on the total image size any loader will produce, well above the
/// largest supported board.
pub const FIRMWARE_MAX_SIZE: usize = 64 * 1024 * 1024;

/// One contiguous run of firmware bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareSegment
{
	pub address: u32,
	pub data: Vec<u8>,
}

impl FirmwareSegment
{
	/// One past the last address covered by this segment.
	fn end(&self) -> u64
	{
		self.address as u64 + self.data.len() as u64
	}
}

/// A loaded, normalized firmware image. Immutable once built.
#[derive(Debug, Clone)]
pub struct Firmware
{
	name: String,
	filename: String,
	segments: Vec<FirmwareSegment>,
	total_size: usize,
}

impl Firmware
{
	/// Load a firmware file, picking the format from the file extension and
	/// falling back to content sniffing for unknown extensions.
	pub fn load(path: impl AsRef<Path>) -> Result<Self>
	{
		let path = path.as_ref();
		let bytes = std::fs::read(path).map_err(|e| {
			ErrorKind::from_io(&e).report(format!("Failed to read firmware file '{}': {}", path.display(), e))
		})?;

		let extension = path
			.extension()
			.and_then(|ext| ext.to_str())
			.map(|ext| ext.to_ascii_lowercase());
		let segments = match extension.as_deref() {
			Some("hex" | "ihex") => ihex::load(&bytes, path)?,
			Some("srec" | "s19" | "s28" | "s37") => srec::load(&bytes, path)?,
			Some("elf") => elf::load(&bytes, path)?,
			Some("bin") => raw::load(&bytes)?,
			_ => match bytes.first().copied() {
				Some(0x7F) if bytes.starts_with(b"\x7fELF") => elf::load(&bytes, path)?,
				Some(b':') => ihex::load(&bytes, path)?,
				Some(b'S') if bytes.get(1).is_some_and(u8::is_ascii_digit) => {
					srec::load(&bytes, path)?
				},
				_ => raw::load(&bytes)?,
			},
		};

		let name = path
			.file_stem()
			.map(|stem| stem.to_string_lossy().into_owned())
			.unwrap_or_else(|| path.display().to_string());

		Self::from_segments(name, path.display().to_string(), segments)
	}

	/// Normalize raw segments into a firmware image: sort, reject overlaps,
	/// coalesce contiguous runs.
	pub fn from_segments(
		name: String, filename: String, mut segments: Vec<FirmwareSegment>,
	) -> Result<Self>
	{
		segments.retain(|segment| !segment.data.is_empty());
		segments.sort_by_key(|segment| segment.address);

		let mut merged: Vec<FirmwareSegment> = Vec::with_capacity(segments.len());
		for segment in segments {
			match merged.last_mut() {
				Some(last) if (segment.address as u64) < last.end() => {
					return Err(ErrorKind::Parse.report(format!(
						"Firmware '{}' contains overlapping segments at 0x{:x}",
						filename, segment.address
					)));
				},
				Some(last) if segment.address as u64 == last.end() => {
					last.data.extend_from_slice(&segment.data);
				},
				_ => merged.push(segment),
			}
		}

		let total_size: usize = merged.iter().map(|segment| segment.data.len()).sum();
		if total_size > FIRMWARE_MAX_SIZE {
			return Err(ErrorKind::Parse
				.report(format!("Firmware '{}' is too big ({} bytes)", filename, total_size)));
		}
		if total_size == 0 {
			return Err(ErrorKind::Parse
				.report(format!("Firmware '{}' is empty", filename)));
		}

		Ok(Self {
			name,
			filename,
			segments: merged,
			total_size,
		})
	}

	pub fn name(&self) -> &str
	{
		&self.name
	}

	pub fn filename(&self) -> &str
	{
		&self.filename
	}

	pub fn segments(&self) -> &[FirmwareSegment]
	{
		&self.segments
	}

	/// Lowest address covered by the image.
	pub fn min_address(&self) -> u32
	{
		self.segments.first().map_or(0, |segment| segment.address)
	}

	/// Highest address covered by the image.
	pub fn max_address(&self) -> u32
	{
		self.segments.last().map_or(0, |segment| (segment.end() - 1) as u32)
	}

	/// Sum of all segment lengths, gaps excluded.
	pub fn total_size(&self) -> usize
	{
		self.total_size
	}

	/// Re-emit the image as Intel HEX with extended linear addressing.
	pub fn to_ihex(&self) -> String
	{
		ihex::emit(&self.segments)
	}
}
