// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors
//! Motorola S-record loader.

use std::path::Path;

use super::FirmwareSegment;
use crate::error::{ErrorKind, Result};

pub(super) fn load(bytes: &[u8], path: &Path) -> Result<Vec<FirmwareSegment>>
{
	let parse_error = |line_no: usize, what: &str| {
		ErrorKind::Parse.report(format!(
			"Invalid S-record on line {} of '{}': {}",
			line_no, path.display(), what
		))
	};

	let text = str::from_utf8(bytes)
		.map_err(|_| ErrorKind::Parse.report(format!("'{}' is not a text file", path.display())))?;

	let mut segments = Vec::new();

	for (idx, line) in text.lines().enumerate() {
		let line_no = idx + 1;
		let line = line.trim();
		if line.is_empty() {
			continue;
		}

		let record_type = line
			.strip_prefix('S')
			.and_then(|rest| rest.chars().next())
			.ok_or_else(|| parse_error(line_no, "missing S prefix"))?;
		let raw = decode_payload(&line[2..]).ok_or_else(|| parse_error(line_no, "malformed record"))?;

		// Address width depends on the record type; S1/S2/S3 carry data, S7/S8/S9
		// terminate, S0 (header) and S5/S6 (record counts) are ignored
		let address_len = match record_type {
			'0' | '5' => 2,
			'1' => 2,
			'2' | '6' | '8' => 3,
			'3' | '7' => 4,
			'9' => 2,
			_ => return Err(parse_error(line_no, "unknown record type")),
		};
		if raw.len() < address_len {
			return Err(parse_error(line_no, "record too short"));
		}

		match record_type {
			'1' | '2' | '3' => {
				let address = raw[..address_len]
					.iter()
					.fold(0u32, |acc, byte| (acc << 8) | *byte as u32);
				segments.push(FirmwareSegment {
					address,
					data: raw[address_len..].to_vec(),
				});
			},
			'7' | '8' | '9' => break,
			_ => {},
		}
	}

	if segments.is_empty() {
		return Err(ErrorKind::Parse
			.report(format!("No data records in S-record file '{}'", path.display())));
	}

	Ok(segments)
}

/// Decode the hex payload following the type character: a count byte, then
/// `count` bytes of address+data+checksum. Validates both the count and the
/// checksum (ones' complement of the sum of count, address and data bytes).
/// Returns address+data without the checksum.
fn decode_payload(hex: &str) -> Option<Vec<u8>>
{
	if hex.len() % 2 != 0 {
		return None;
	}

	let raw: Vec<u8> = (0..hex.len() / 2)
		.map(|idx| u8::from_str_radix(hex.get(idx * 2..idx * 2 + 2)?, 16).ok())
		.collect::<Option<_>>()?;
	// Count, at least one address byte, checksum
	if raw.len() < 3 {
		return None;
	}

	let count = raw[0] as usize;
	if raw.len() != count + 1 {
		return None;
	}

	let sum = raw[..raw.len() - 1]
		.iter()
		.fold(0u8, |acc, byte| acc.wrapping_add(*byte));
	if !sum != raw[raw.len() - 1] {
		return None;
	}

	Some(raw[1..raw.len() - 1].to_vec())
}
