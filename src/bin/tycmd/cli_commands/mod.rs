// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors

pub mod list;
pub mod monitor;
pub mod upload;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Subcommand};
use clap_complete::Shell;
use color_eyre::eyre::{Result, eyre};
use tytool::board::{BoardSet, SharedBoard};
use tytool::settings::{BoardSettings, JsonStore, KeyValueStore};

use crate::GlobalArguments;

#[derive(Subcommand)]
pub enum ToplevelCommands
{
	/// List the connected boards
	List(list::ListArguments),
	/// Open a serial terminal to a board
	Monitor(monitor::MonitorArguments),
	/// Upload firmware to a board
	Upload(upload::UploadArguments),
	/// Reset a board to run mode
	Reset,
	/// Reboot a board into its bootloader
	Reboot,
	/// Show which board models a firmware file is built for
	Identify(upload::IdentifyArguments),
	/// Set or clear the persistent name of a board
	Tag(list::TagArguments),
	/// Generate shell completions
	Completion(CompletionArguments),
}

#[derive(Args)]
pub struct CompletionArguments
{
	pub shell: Shell,
}

/// Open the per-user settings store, if a config directory can be resolved.
pub fn open_settings() -> Option<JsonStore>
{
	let dirs = directories::ProjectDirs::from("", "", "tycmd")?;
	JsonStore::open(dirs.config_dir().join("boards.json")).ok()
}

/// Load persisted tags onto freshly discovered boards.
pub fn apply_saved_settings(store: &JsonStore, boards: &[SharedBoard])
{
	for board in boards {
		let key = board.tag();
		if let Some(value) = store.get(&key) {
			if let Ok(settings) = serde_json::from_value::<BoardSettings>(value) {
				board.set_tag(settings.tag);
			}
		}
	}
}

/// Start a board set and absorb the currently connected boards.
pub fn open_board_set() -> Result<Arc<BoardSet>>
{
	let board_set = BoardSet::new()?;
	board_set.start()?;

	if let Some(store) = open_settings() {
		apply_saved_settings(&store, &board_set.boards());
	}

	Ok(board_set)
}

/// Resolve the `--board` selector to exactly one board.
pub fn select_board(board_set: &Arc<BoardSet>, args: &GlobalArguments) -> Result<SharedBoard>
{
	let boards = board_set.boards();

	match &args.board {
		Some(selector) => board_set
			.find_board(selector)
			.ok_or_else(|| eyre!("Board '{}' not found", selector)),
		None => match boards.len() {
			0 => Err(eyre!("No board connected")),
			1 => Ok(boards.into_iter().next().unwrap()),
			count => Err(eyre!(
				"{} boards connected, disambiguate with --board (try 'tycmd list')",
				count
			)),
		},
	}
}

/// Read every firmware argument up front so problems surface before any board
/// is touched.
pub fn load_firmwares(paths: &[PathBuf]) -> Result<Vec<Arc<tytool::firmware::Firmware>>>
{
	if paths.is_empty() {
		return Err(eyre!("No firmware file given"));
	}

	paths
		.iter()
		.map(|path| Ok(Arc::new(tytool::firmware::Firmware::load(path)?)))
		.collect()
}
