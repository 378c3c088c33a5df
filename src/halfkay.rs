// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors
//! HalfKay bootloader protocol.
//!
//! HalfKay is the tiny HID bootloader shipped on Teensy boards. Programming is
//! a sequence of output reports, one flash block each, carrying the block
//! address in a small header; a final report addressed to 0xFFFFFF reboots the
//! board into the freshly written program. The header layout varies by
//! bootloader generation, see [`HalfKay`].
//!
//! Getting *into* the bootloader from run mode uses a different trick per
//! interface flavour: CDC serial interfaces reboot when the host selects the
//! magic 134 baud rate, raw-HID serial emulation ("seremu") interfaces on a
//! feature report with a fixed signature.

use std::thread;
use std::time::Duration;

use log::debug;

use crate::error::{ErrorKind, Result};
use crate::firmware::Firmware;
use crate::models::{HalfKay, McuFamily, Model};
use crate::port::{Port, SerialConfig};

/// Feature report that reboots a seremu interface into the bootloader.
const SEREMU_REBOOT_REPORT: [u8; 5] = [0x00, 0xA9, 0x45, 0xC2, 0x6B];

/// Magic baud rate that reboots a CDC serial interface into the bootloader.
const SERIAL_REBOOT_RATE: u32 = 134;

/// The first report triggers a whole-chip erase before it is acknowledged,
/// allow a couple of retries with a generous pause.
const FIRST_BLOCK_RETRIES: u32 = 8;
const RETRY_DELAY: Duration = Duration::from_millis(250);

impl HalfKay
{
	fn header_size(self) -> usize
	{
		match self {
			HalfKay::V1 | HalfKay::V2 => 2,
			HalfKay::V3 => 64,
		}
	}

	fn encode_address(self, address: u32, header: &mut [u8])
	{
		match self {
			HalfKay::V1 => {
				header[0] = address as u8;
				header[1] = (address >> 8) as u8;
			},
			// Big-flash AVR parts address by 256-byte page
			HalfKay::V2 => {
				header[0] = (address >> 8) as u8;
				header[1] = (address >> 16) as u8;
			},
			HalfKay::V3 => {
				header[0] = address as u8;
				header[1] = (address >> 8) as u8;
				header[2] = (address >> 16) as u8;
			},
		}
	}
}

/// Flash base the block addresses are relative to.
fn flash_base(model: &Model) -> u32
{
	match model.family {
		McuFamily::Imxrt => 0x6000_0000,
		_ => 0,
	}
}

/// Check an image against a model's flash geometry. Performed at upload time,
/// after the bootloader has told us the exact model.
pub fn validate(model: &Model, fw: &Firmware) -> Result<()>
{
	let base = flash_base(model) as u64;
	let limit = base + model.code_size as u64;

	if fw.total_size() as u64 > model.code_size as u64 {
		return Err(ErrorKind::Parse.report(format!(
			"Firmware '{}' is too big for {} ({} bytes, {} available)",
			fw.name(),
			model.name,
			fw.total_size(),
			model.code_size
		)));
	}

	for segment in fw.segments() {
		let start = segment.address as u64;
		let end = start + segment.data.len() as u64;
		if start < base || end > limit {
			return Err(ErrorKind::Parse.report(format!(
				"Firmware '{}' does not fit in the flash range of {}",
				fw.name(),
				model.name
			)));
		}
	}

	Ok(())
}

/// Assemble the report for one block: report ID, address header, then the block
/// data with gaps filled with the erased-flash value. Returns `None` when no
/// segment intersects the block.
fn block_report(model: &Model, address: u32, fw: &Firmware) -> Option<(Vec<u8>, usize)>
{
	let block_size = model.block_size as usize;
	let header_size = model.halfkay.header_size();

	let mut report = vec![0u8; 1 + header_size + block_size];
	model.halfkay.encode_address(address - flash_base(model), &mut report[1..]);
	// Bytes not covered by any segment keep the erased-flash value
	report[1 + header_size..].fill(0xFF);

	let block_start = address as u64;
	let block_end = block_start + block_size as u64;
	let mut data_bytes = 0usize;

	for segment in fw.segments() {
		let seg_start = segment.address as u64;
		let seg_end = seg_start + segment.data.len() as u64;
		if seg_end <= block_start || seg_start >= block_end {
			continue;
		}

		let copy_start = seg_start.max(block_start);
		let copy_end = seg_end.min(block_end);
		let src = (copy_start - seg_start) as usize..(copy_end - seg_start) as usize;
		let dst_off = 1 + header_size + (copy_start - block_start) as usize;

		report[dst_off..dst_off + src.len()].copy_from_slice(&segment.data[src]);
		data_bytes += (copy_end - copy_start) as usize;
	}

	if data_bytes == 0 {
		return None;
	}

	Some((report, data_bytes))
}

/// Stream a validated firmware image block by block. `progress` receives
/// `(bytes_programmed, total_bytes)` after every block and may return an error
/// to abort (used for cooperative cancellation).
pub fn upload(
	port: &mut Port, model: &Model, fw: &Firmware,
	mut progress: impl FnMut(usize, usize) -> Result<()>,
) -> Result<()>
{
	validate(model, fw)?;

	let block_size = model.block_size;
	let base = flash_base(model);
	let first_block = (fw.min_address() - base) / block_size * block_size + base;

	let total = fw.total_size();
	let mut done = 0usize;
	let mut first = true;

	progress(0, total)?;

	let mut address = first_block;
	while address <= fw.max_address() {
		if let Some((report, data_bytes)) = block_report(model, address, fw) {
			write_block(port, &report, first)?;
			first = false;

			done += data_bytes;
			progress(done, total)?;
		}

		address += block_size;
	}

	debug!("Programmed {} bytes in {}-byte blocks", done, block_size);
	Ok(())
}

fn write_block(port: &mut Port, report: &[u8], first: bool) -> Result<()>
{
	let retries = if first { FIRST_BLOCK_RETRIES } else { 2 };

	let mut last_err = None;
	for attempt in 0..retries {
		if attempt > 0 {
			thread::sleep(RETRY_DELAY);
		}

		match port.hid_write(report) {
			Ok(written) if written > 0 => return Ok(()),
			Ok(_) => last_err = Some(ErrorKind::Io.report("HID write was not accepted")),
			Err(err) => last_err = Some(err),
		}
	}

	Err(last_err.unwrap_or_else(|| ErrorKind::Io.error()))
}

/// Reboot the board out of the bootloader into the program it holds.
pub fn boot(port: &mut Port, model: &Model) -> Result<()>
{
	let header_size = model.halfkay.header_size();
	let mut report = vec![0u8; 1 + header_size + model.block_size as usize];
	report[1] = 0xFF;
	report[2] = 0xFF;
	if model.halfkay == HalfKay::V3 {
		report[3] = 0xFF;
	}

	write_block(port, &report, false)
}

/// Reboot a run-mode board into the bootloader through its CDC serial interface.
pub fn reboot_serial(port: &mut Port) -> Result<()>
{
	let config = SerialConfig {
		baudrate: Some(SERIAL_REBOOT_RATE),
		..Default::default()
	};
	port.serial_set_config(&config)
}

/// Reboot a run-mode board into the bootloader through its seremu HID interface.
pub fn reboot_seremu(port: &mut Port) -> Result<()>
{
	let written = port.hid_send_feature_report(&SEREMU_REBOOT_REPORT)?;
	if written == 0 {
		return Err(ErrorKind::Io.report("Reboot feature report was not accepted"));
	}
	Ok(())
}
