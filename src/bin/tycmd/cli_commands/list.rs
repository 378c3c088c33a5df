// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors

use clap::Args;
use color_eyre::eyre::Result;
use owo_colors::OwoColorize;
use serde_json::json;
use tytool::board::{BoardEvent, BoardStatus, SharedBoard};
use tytool::models::Capability;
use tytool::platform::{PollSource, poll};
use tytool::settings::{BoardSettings, KeyValueStore};

use super::{open_board_set, open_settings, select_board};
use crate::GlobalArguments;

#[derive(Args)]
pub struct ListArguments
{
	#[arg(short = 'v', long = "verbose")]
	/// Show interfaces and capabilities for every board
	verbose: bool,

	#[arg(short = 'w', long = "watch")]
	/// Keep running and report board arrivals and departures
	watch: bool,
}

#[derive(Args)]
pub struct TagArguments
{
	/// New name, omit to restore the default tag
	name: Option<String>,
}

fn capability_list(board: &SharedBoard) -> String
{
	let capabilities = board.capabilities();
	let names = [
		(Capability::Upload, "upload"),
		(Capability::Reset, "reset"),
		(Capability::Reboot, "reboot"),
		(Capability::Run, "run"),
		(Capability::Serial, "serial"),
		(Capability::Unique, "unique"),
	];

	names
		.iter()
		.filter(|(cap, _)| capabilities.contains(*cap))
		.map(|(_, name)| *name)
		.collect::<Vec<_>>()
		.join(", ")
}

fn print_board(board: &SharedBoard, verbose: bool)
{
	let status = match board.status() {
		BoardStatus::Online => "online".green().to_string(),
		BoardStatus::Missing => "missing".yellow().to_string(),
		BoardStatus::Dropped => "dropped".red().to_string(),
	};

	println!("{} {} ({})", status, board.tag().bold(), board.model_name());

	if verbose {
		println!("  capabilities: {}", capability_list(board));
		for iface in board.interfaces() {
			println!(
				"  {}: {} ({:04x}:{:04x})",
				iface.dev.dev_type, iface.dev.path, iface.dev.vid, iface.dev.pid
			);
		}
	}
}

pub fn list_command(args: &ListArguments) -> Result<()>
{
	let board_set = open_board_set()?;

	for board in board_set.boards() {
		print_board(&board, args.verbose);
	}

	if !args.watch {
		return Ok(());
	}

	loop {
		let mut sources = [PollSource::new(board_set.poll_handle(), 0)];
		poll(&mut sources, -1)?;

		board_set.refresh(|board, event| {
			match event {
				BoardEvent::Added => print_board(board, args.verbose),
				BoardEvent::Changed => print_board(board, args.verbose),
				BoardEvent::Disappeared => {
					println!("{} {}", "missing".yellow(), board.tag().bold());
				},
				BoardEvent::Dropped => {
					println!("{} {}", "dropped".red(), board.tag().bold());
				},
			}
		})?;
	}
}

pub fn tag_command(global: &GlobalArguments, args: &TagArguments) -> Result<()>
{
	let board_set = open_board_set()?;
	let board = select_board(&board_set, global)?;

	// The store key is the board's *default* identity, so clear any custom
	// tag before computing it
	board.set_tag(None);
	let key = board.tag();

	let Some(mut store) = open_settings() else {
		return Err(color_eyre::eyre::eyre!("No writable configuration directory"));
	};

	match &args.name {
		Some(name) => {
			let settings = BoardSettings {
				tag: Some(name.clone()),
				..Default::default()
			};
			store.put(&key, json!(settings))?;
			board.set_tag(Some(name.clone()));
			println!("Board {} tagged '{}'", key, name);
		},
		None => {
			store.erase(&key)?;
			println!("Tag cleared for {}", key);
		},
	}

	Ok(())
}
