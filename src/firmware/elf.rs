// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors
//! ELF firmware loader, built on goblin.

use std::path::Path;

use goblin::elf::Elf;
use goblin::elf::program_header::PT_LOAD;
use log::debug;

use super::FirmwareSegment;
use crate::error::{ErrorKind, Result};

pub(super) fn load(bytes: &[u8], path: &Path) -> Result<Vec<FirmwareSegment>>
{
	let elf = Elf::parse(bytes)?;

	let mut segments = Vec::new();
	for header in &elf.program_headers {
		if header.p_type != PT_LOAD || header.p_filesz == 0 {
			continue;
		}

		// The physical address is where the data has to live in flash, the
		// virtual address only matters to the running program (e.g. code copied
		// to RAM by the startup). Some linkers leave p_paddr zeroed, fall back
		// to p_vaddr then.
		let address = if header.p_paddr != 0 { header.p_paddr } else { header.p_vaddr };

		let offset = header.p_offset as usize;
		let size = header.p_filesz as usize;
		let data = bytes.get(offset..offset + size).ok_or_else(|| {
			ErrorKind::Parse.report(format!(
				"ELF file '{}' has a program header pointing outside the file",
				path.display()
			))
		})?;

		debug!("ELF load segment: {} bytes at 0x{:08x}", size, address);
		segments.push(FirmwareSegment {
			address: address as u32,
			data: data.to_vec(),
		});
	}

	Ok(segments)
}
