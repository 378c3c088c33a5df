// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors

use std::path::PathBuf;
use std::sync::Mutex;

use clap::Args;
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use log::Level;
use tytool::models::MODELS;
use tytool::task::{Task, TaskMessage, UploadFlags};

use super::{load_firmwares, open_board_set, select_board};
use crate::GlobalArguments;

#[derive(Args)]
pub struct UploadArguments
{
	/// Firmware files; the first one compatible with the board is used
	#[arg(required = true)]
	firmwares: Vec<PathBuf>,

	#[arg(long = "nocheck")]
	/// Skip the firmware compatibility check
	nocheck: bool,

	#[arg(long = "noreset")]
	/// Leave the board in the bootloader after programming
	noreset: bool,
}

#[derive(Args)]
pub struct IdentifyArguments
{
	#[arg(required = true)]
	firmwares: Vec<PathBuf>,
}

/// Run a task to completion on this thread, mirroring its messages onto the
/// terminal (progress bars for progress messages, log lines for the rest).
fn run_task(task: Task) -> Result<()>
{
	let bar: Mutex<Option<ProgressBar>> = Mutex::new(None);

	task.set_callback(move |message| {
		match message {
			TaskMessage::Progress { action, value, max } => {
				let mut bar = bar.lock().unwrap();
				let bar = bar.get_or_insert_with(|| {
					ProgressBar::new(*max as u64).with_style(
						ProgressStyle::default_bar()
							.template(" {percent:>3}% |{bar:50}| {bytes}/{total_bytes} [{binary_bytes_per_sec} {elapsed}]")
							.unwrap(),
					).with_prefix(*action)
				});
				bar.set_length(*max as u64);
				bar.set_position(*value as u64);
				if *value >= *max {
					bar.finish();
				}
			},
			TaskMessage::Log { level, msg } => {
				if *level <= Level::Info {
					eprintln!("{}", msg);
				}
			},
			TaskMessage::Status(_) => {},
		}
	});

	task.start(None)?;

	match task.succeeded() {
		Some(true) => Ok(()),
		_ => Err(eyre!("{}", tytool::error::last_error_message())),
	}
}

pub fn upload_command(global: &GlobalArguments, args: &UploadArguments) -> Result<()>
{
	let firmwares = load_firmwares(&args.firmwares)?;

	let board_set = open_board_set()?;
	let board = select_board(&board_set, global)?;

	let mut flags = UploadFlags::none();
	if args.nocheck {
		flags |= UploadFlags::NoCheck;
	}
	if args.noreset {
		flags |= UploadFlags::NoResetAfter;
	}

	run_task(Task::upload(board_set, board, firmwares, flags))
}

pub fn reset_command(global: &GlobalArguments) -> Result<()>
{
	let board_set = open_board_set()?;
	let board = select_board(&board_set, global)?;

	run_task(Task::reset(board_set, board))
}

pub fn reboot_command(global: &GlobalArguments) -> Result<()>
{
	let board_set = open_board_set()?;
	let board = select_board(&board_set, global)?;

	run_task(Task::reboot(board_set, board))
}

pub fn identify_command(args: &IdentifyArguments) -> Result<()>
{
	let firmwares = load_firmwares(&args.firmwares)?;

	for firmware in firmwares {
		let compatible: Vec<&str> = MODELS
			.iter()
			.filter(|model| model.test_firmware(&firmware))
			.map(|model| model.name)
			.collect();

		if compatible.is_empty() {
			println!("{}: no compatible board model", firmware.filename());
		} else {
			println!("{}: {}", firmware.filename(), compatible.join(", "));
		}
	}

	Ok(())
}
