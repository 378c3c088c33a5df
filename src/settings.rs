// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors
//! Settings persistence interface.
//!
//! The core only consumes the [KeyValueStore] trait; what backs it (and whether
//! anything backs it at all) is up to the frontend. [JsonStore] is the
//! file-backed implementation the CLI uses to remember per-board settings.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ErrorKind, Result};

pub trait KeyValueStore
{
	fn get(&self, key: &str) -> Option<Value>;
	fn put(&mut self, key: &str, value: Value) -> Result<()>;
	fn erase(&mut self, key: &str) -> Result<()>;
}

/// Per-board settings the frontends persist, keyed by the board's stable tag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoardSettings
{
	/// Custom user-facing name.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tag: Option<String>,
	/// Last uploaded firmware path.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub firmware: Option<String>,
	/// Whether to reset the board to run mode after uploads.
	#[serde(default = "default_reset_after")]
	pub reset_after: bool,
}

fn default_reset_after() -> bool
{
	true
}

/// Write-through JSON file store.
pub struct JsonStore
{
	path: PathBuf,
	values: Map<String, Value>,
}

impl JsonStore
{
	/// Open a store, creating an empty one when the file does not exist yet.
	pub fn open(path: impl AsRef<Path>) -> Result<Self>
	{
		let path = path.as_ref().to_path_buf();

		let values = match std::fs::read(&path) {
			Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
				ErrorKind::Parse
					.report(format!("Malformed settings file '{}': {}", path.display(), e))
			})?,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
			Err(e) => {
				return Err(ErrorKind::from_io(&e)
					.report(format!("Cannot read settings file '{}': {}", path.display(), e)));
			},
		};

		Ok(Self {
			path,
			values,
		})
	}

	fn save(&self) -> Result<()>
	{
		if let Some(parent) = self.path.parent() {
			std::fs::create_dir_all(parent).map_err(|e| {
				ErrorKind::from_io(&e)
					.report(format!("Cannot create '{}': {}", parent.display(), e))
			})?;
		}

		let json = serde_json::to_string_pretty(&Value::Object(self.values.clone()))
			.map_err(|e| ErrorKind::System.report(format!("Settings serialization failed: {}", e)))?;
		std::fs::write(&self.path, json).map_err(|e| {
			ErrorKind::from_io(&e)
				.report(format!("Cannot write settings file '{}': {}", self.path.display(), e))
		})
	}
}

impl KeyValueStore for JsonStore
{
	fn get(&self, key: &str) -> Option<Value>
	{
		self.values.get(key).cloned()
	}

	fn put(&mut self, key: &str, value: Value) -> Result<()>
	{
		self.values.insert(key.to_string(), value);
		self.save()
	}

	fn erase(&mut self, key: &str) -> Result<()>
	{
		if self.values.remove(key).is_some() {
			self.save()?;
		}
		Ok(())
	}
}
