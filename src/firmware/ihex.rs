// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors
//! Intel HEX loader and emitter.

use std::fmt::Write;
use std::path::Path;

use log::debug;

use super::FirmwareSegment;
use crate::error::{ErrorKind, Result};

const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;
const RECORD_EXT_SEGMENT: u8 = 0x02;
const RECORD_START_SEGMENT: u8 = 0x03;
const RECORD_EXT_LINEAR: u8 = 0x04;
const RECORD_START_LINEAR: u8 = 0x05;

pub(super) fn load(bytes: &[u8], path: &Path) -> Result<Vec<FirmwareSegment>>
{
	let parse_error = |line_no: usize, what: &str| {
		ErrorKind::Parse.report(format!(
			"Invalid Intel HEX record on line {} of '{}': {}",
			line_no, path.display(), what
		))
	};

	let text = str::from_utf8(bytes)
		.map_err(|_| ErrorKind::Parse.report(format!("'{}' is not a text file", path.display())))?;

	let mut segments = Vec::new();
	let mut base_address = 0u32;
	let mut ended = false;

	for (idx, line) in text.lines().enumerate() {
		let line_no = idx + 1;
		let line = line.trim();
		if line.is_empty() {
			continue;
		}
		if ended {
			return Err(parse_error(line_no, "data after EOF record"));
		}

		let record = decode_record(line).ok_or_else(|| parse_error(line_no, "malformed record"))?;
		let (record_type, address, data) = record;

		match record_type {
			RECORD_DATA => {
				segments.push(FirmwareSegment {
					address: base_address.wrapping_add(address as u32),
					data,
				});
			},
			RECORD_EOF => {
				if !data.is_empty() {
					return Err(parse_error(line_no, "EOF record with data"));
				}
				ended = true;
			},
			RECORD_EXT_SEGMENT => {
				if data.len() != 2 {
					return Err(parse_error(line_no, "extended segment record needs 2 bytes"));
				}
				base_address = (u16::from_be_bytes([data[0], data[1]]) as u32) << 4;
			},
			RECORD_EXT_LINEAR => {
				if data.len() != 2 {
					return Err(parse_error(line_no, "extended linear record needs 2 bytes"));
				}
				base_address = (u16::from_be_bytes([data[0], data[1]]) as u32) << 16;
			},
			// Start addresses are irrelevant for flashing
			RECORD_START_SEGMENT | RECORD_START_LINEAR => {},
			_ => return Err(parse_error(line_no, "unknown record type")),
		}
	}

	if !ended {
		return Err(ErrorKind::Parse
			.report(format!("Missing EOF record in Intel HEX file '{}'", path.display())));
	}

	debug!("Recovered {} data records from '{}'", segments.len(), path.display());
	Ok(segments)
}

/// Decode one `:llaaaatt...cc` line into (type, address, data), validating the
/// length field and checksum. Returns `None` on any malformation.
fn decode_record(line: &str) -> Option<(u8, u16, Vec<u8>)>
{
	let hex = line.strip_prefix(':')?;
	if hex.len() % 2 != 0 {
		return None;
	}

	let raw: Vec<u8> = (0..hex.len() / 2)
		.map(|idx| u8::from_str_radix(hex.get(idx * 2..idx * 2 + 2)?, 16).ok())
		.collect::<Option<_>>()?;
	// Shortest legal record: count + address + type + checksum
	if raw.len() < 5 {
		return None;
	}

	let byte_count = raw[0] as usize;
	if raw.len() != byte_count + 5 {
		return None;
	}

	// The checksum byte makes the record sum to zero modulo 256
	let sum = raw.iter().fold(0u8, |acc, byte| acc.wrapping_add(*byte));
	if sum != 0 {
		return None;
	}

	let address = u16::from_be_bytes([raw[1], raw[2]]);
	let record_type = raw[3];
	let data = raw[4..4 + byte_count].to_vec();

	Some((record_type, address, data))
}

/// Emit normalized segments as Intel HEX, 16 bytes per data record, using
/// extended linear addressing.
pub(super) fn emit(segments: &[FirmwareSegment]) -> String
{
	let mut out = String::new();
	let mut high_address = 0u16;

	for segment in segments {
		let mut address = segment.address;
		for chunk in segment.data.chunks(16) {
			let high = (address >> 16) as u16;
			if high != high_address {
				emit_record(&mut out, 0, RECORD_EXT_LINEAR, &high.to_be_bytes());
				high_address = high;
			}
			emit_record(&mut out, address as u16, RECORD_DATA, chunk);
			address = address.wrapping_add(chunk.len() as u32);
		}
	}

	emit_record(&mut out, 0, RECORD_EOF, &[]);
	out
}

fn emit_record(out: &mut String, address: u16, record_type: u8, data: &[u8])
{
	let mut sum = (data.len() as u8)
		.wrapping_add((address >> 8) as u8)
		.wrapping_add(address as u8)
		.wrapping_add(record_type);

	let _ = write!(out, ":{:02X}{:04X}{:02X}", data.len(), address, record_type);
	for byte in data {
		let _ = write!(out, "{:02X}", byte);
		sum = sum.wrapping_add(*byte);
	}
	let _ = writeln!(out, "{:02X}", sum.wrapping_neg());
}
