// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors
//! Raw binary firmware loader: the whole file is one segment based at 0.

use super::FirmwareSegment;
use crate::error::Result;

pub(super) fn load(bytes: &[u8]) -> Result<Vec<FirmwareSegment>>
{
	Ok(vec![FirmwareSegment {
		address: 0,
		data: bytes.to_vec(),
	}])
}
