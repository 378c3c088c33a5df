// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors
//! Static registry of supported board models.
//!
//! Teensy boards expose two USB personalities: the regular run-mode identity
//! (CDC serial and/or HID interfaces under various PIDs) and the HalfKay
//! bootloader identity (16C0:0478). While in the bootloader, the HID usage value
//! under usage page 0xFF9C identifies the exact model, which is how we learn the
//! flash geometry to program against.

use bitmask_enum::bitmask;

use crate::device::Device;
use crate::firmware::Firmware;

pub const TEENSY_VID: u16 = 0x16C0;
pub const HALFKAY_PID: u16 = 0x0478;
/// Usage page of the HalfKay bootloader HID interface.
pub const HALFKAY_USAGE_PAGE: u16 = 0xFF9C;
/// Usage page of run-mode raw HID ("seremu") interfaces.
pub const SEREMU_USAGE_PAGE: u16 = 0xFFC9;

/// What a board can do for us at a point in time, the union of what its
/// currently-visible interfaces offer.
#[bitmask(u16)]
pub enum Capability
{
	/// A bootloader interface is up, firmware can be programmed.
	Upload,
	/// A bootloader interface is up, the board can be reset into run mode.
	Reset,
	/// A run-mode interface that accepts the reboot-to-bootloader trigger.
	Reboot,
	/// The board is running user code.
	Run,
	/// A serial (or emulated serial) interface is available.
	Serial,
	/// The board exposes a USB serial number and can be identified across
	/// reconnects.
	Unique,
}

/// HalfKay wire format generation, selects the block report layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfKay
{
	/// 2-byte little-endian address header (Teensy 2.0).
	V1,
	/// 2-byte address header holding address >> 8 (Teensy++ 2.0).
	V2,
	/// 64-byte header with a 3-byte little-endian address (ARM Teensies).
	V3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McuFamily
{
	Avr,
	Kinetis,
	Imxrt,
}

/// One supported board model. All fields are static facts about the hardware.
#[derive(Debug)]
pub struct Model
{
	pub name: &'static str,
	pub mcu: &'static str,
	/// Flash bytes available to user code.
	pub code_size: u32,
	/// Programming block size, also the HalfKay report payload size.
	pub block_size: u32,
	pub halfkay: HalfKay,
	/// HID usage of the bootloader interface, identifies the model.
	pub bootloader_usage: u16,
	pub family: McuFamily,
}

pub static MODELS: [Model; 11] = [
	Model {
		name: "Teensy 2.0",
		mcu: "atmega32u4",
		code_size: 32256,
		block_size: 128,
		halfkay: HalfKay::V1,
		bootloader_usage: 0x1A,
		family: McuFamily::Avr,
	},
	Model {
		name: "Teensy++ 2.0",
		mcu: "at90usb1286",
		code_size: 130048,
		block_size: 256,
		halfkay: HalfKay::V2,
		bootloader_usage: 0x1B,
		family: McuFamily::Avr,
	},
	Model {
		name: "Teensy 3.0",
		mcu: "mk20dx128",
		code_size: 131072,
		block_size: 1024,
		halfkay: HalfKay::V3,
		bootloader_usage: 0x1C,
		family: McuFamily::Kinetis,
	},
	Model {
		name: "Teensy 3.1",
		mcu: "mk20dx256",
		code_size: 262144,
		block_size: 1024,
		halfkay: HalfKay::V3,
		bootloader_usage: 0x1D,
		family: McuFamily::Kinetis,
	},
	Model {
		name: "Teensy 3.5",
		mcu: "mk64fx512",
		code_size: 524288,
		block_size: 1024,
		halfkay: HalfKay::V3,
		bootloader_usage: 0x1E,
		family: McuFamily::Kinetis,
	},
	Model {
		name: "Teensy 3.6",
		mcu: "mk66fx1m0",
		code_size: 1048576,
		block_size: 1024,
		halfkay: HalfKay::V3,
		bootloader_usage: 0x1F,
		family: McuFamily::Kinetis,
	},
	Model {
		name: "Teensy LC",
		mcu: "mkl26z64",
		code_size: 63488,
		block_size: 512,
		halfkay: HalfKay::V3,
		bootloader_usage: 0x20,
		family: McuFamily::Kinetis,
	},
	Model {
		name: "Teensy 3.2",
		mcu: "mk20dx256",
		code_size: 262144,
		block_size: 1024,
		halfkay: HalfKay::V3,
		bootloader_usage: 0x21,
		family: McuFamily::Kinetis,
	},
	Model {
		name: "Teensy 4.0",
		mcu: "imxrt1062",
		code_size: 2031616,
		block_size: 1024,
		halfkay: HalfKay::V3,
		bootloader_usage: 0x24,
		family: McuFamily::Imxrt,
	},
	Model {
		name: "Teensy 4.1",
		mcu: "imxrt1062",
		code_size: 8126464,
		block_size: 1024,
		halfkay: HalfKay::V3,
		bootloader_usage: 0x25,
		family: McuFamily::Imxrt,
	},
	Model {
		name: "MicroMod Teensy",
		mcu: "imxrt1062",
		code_size: 16515072,
		block_size: 1024,
		halfkay: HalfKay::V3,
		bootloader_usage: 0x26,
		family: McuFamily::Imxrt,
	},
];

/// Run-mode PIDs sit in a contiguous block covering the serial, HID and
/// composite personalities.
pub fn is_teensy_run(vid: u16, pid: u16) -> bool
{
	vid == TEENSY_VID && (0x0476..=0x048B).contains(&pid) && pid != HALFKAY_PID
}

pub fn is_teensy_bootloader(vid: u16, pid: u16) -> bool
{
	vid == TEENSY_VID && pid == HALFKAY_PID
}

/// Identify the exact model from a bootloader HID interface.
pub fn identify_bootloader(dev: &Device) -> Option<&'static Model>
{
	if !is_teensy_bootloader(dev.vid, dev.pid) || dev.hid.usage_page != HALFKAY_USAGE_PAGE {
		return None;
	}

	MODELS.iter().find(|model| model.bootloader_usage == dev.hid.usage)
}

impl Model
{
	/// Check whether a firmware image looks like it was built for this model's
	/// MCU family. This is a structural sniff of the image start, not a full
	/// validation; size limits are enforced separately at upload time.
	pub fn test_firmware(&self, fw: &Firmware) -> bool
	{
		let Some(head) = fw.segments().first() else {
			return false;
		};
		let bytes = head.data.as_slice();

		match self.family {
			// AVR user code starts with a jump table: either an RJMP or the
			// two-word JMP encoding at the reset vector
			McuFamily::Avr => {
				fw.min_address() == 0
					&& bytes.len() >= 2
					&& (bytes[1] & 0xF0 == 0xC0 || (bytes[0] == 0x0C && bytes[1] & 0xFE == 0x94))
			},

			// ARM vector table: initial stack pointer inside SRAM, thumb reset
			// vector inside flash
			McuFamily::Kinetis => {
				if fw.min_address() != 0 || bytes.len() < 8 {
					return false;
				}
				let sp = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
				let reset = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
				(0x1FFF_0000..=0x2010_0000).contains(&sp)
					&& reset & 1 == 1
					&& reset < self.code_size
			},

			// i.MX RT images begin with the FlexSPI flash configuration block,
			// linked at the start of external flash
			McuFamily::Imxrt => {
				fw.min_address() & 0x6000_0000 == 0x6000_0000
					&& bytes.len() >= 4
					&& &bytes[0..4] == b"FCFB"
			},
		}
	}
}
