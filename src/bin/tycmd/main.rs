// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors

mod cli_commands;

use std::io::stdout;

use clap::builder::styling::Styles;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use color_eyre::eyre::Result;
use const_format::formatcp;

use crate::cli_commands::ToplevelCommands;

const VERSION_STRING: &str = formatcp!("tycmd v{}", clap::crate_version!());

#[derive(Parser)]
#[command(
	version,
	about = VERSION_STRING,
	styles(style()),
	disable_colored_help(false),
	arg_required_else_help(true)
)]
struct CliArguments
{
	#[arg(global = true, short = 'B', long = "board")]
	/// Select a board by tag, serial number or location
	pub(crate) board: Option<String>,

	#[arg(global = true, short = 'q', long = "quiet", action = clap::ArgAction::Count)]
	/// Decrease verbosity (repeatable)
	pub(crate) quiet: u8,

	#[command(subcommand)]
	pub(crate) subcommand: ToplevelCommands,
}

fn style() -> Styles
{
	use clap::builder::styling::AnsiColor;
	Styles::styled()
		.header(AnsiColor::Yellow.on_default())
		.usage(AnsiColor::Green.on_default())
		.literal(AnsiColor::Green.on_default())
		.placeholder(AnsiColor::Cyan.on_default())
}

fn setup_logging(quiet: u8)
{
	// LIBHS_DEBUG is honoured for compatibility with the C tooling this
	// replaces: it forces debug output from the device layers
	let default_level = if std::env::var_os("LIBHS_DEBUG").is_some() {
		"debug"
	} else {
		match quiet {
			0 => "info",
			1 => "warn",
			_ => "error",
		}
	};

	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
		.format_timestamp(None)
		.format_target(false)
		.init();
}

fn main() -> Result<()>
{
	color_eyre::install()?;

	let args = CliArguments::parse();
	setup_logging(args.quiet);

	match &args.subcommand {
		ToplevelCommands::List(list_args) => cli_commands::list::list_command(list_args),
		ToplevelCommands::Monitor(monitor_args) => {
			cli_commands::monitor::monitor_command(&args, monitor_args)
		},
		ToplevelCommands::Upload(upload_args) => {
			cli_commands::upload::upload_command(&args, upload_args)
		},
		ToplevelCommands::Reset => cli_commands::upload::reset_command(&args),
		ToplevelCommands::Reboot => cli_commands::upload::reboot_command(&args),
		ToplevelCommands::Identify(identify_args) => {
			cli_commands::upload::identify_command(identify_args)
		},
		ToplevelCommands::Tag(tag_args) => cli_commands::list::tag_command(&args, tag_args),
		ToplevelCommands::Completion(completion_args) => {
			let mut command = CliArguments::command();
			generate(completion_args.shell, &mut command, "tycmd", &mut stdout());
			Ok(())
		},
	}
}

pub(crate) use CliArguments as GlobalArguments;
