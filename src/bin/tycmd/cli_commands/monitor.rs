// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors

use std::io::Write;

use clap::{Args, ValueEnum};
use color_eyre::eyre::{Result, eyre};
use log::{info, warn};
use tytool::board::BoardSet;
use tytool::device::{DeviceType, PortMode};
use tytool::error::ErrorKind;
use tytool::models::Capability;
use tytool::port::{Parity, Port, Rts, SerialConfig, XonXoff};

use super::{open_board_set, select_board};
use crate::GlobalArguments;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ParityArg
{
	Off,
	Even,
	Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FlowArg
{
	Off,
	Rtscts,
	Xonxoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DirectionArg
{
	Input,
	Output,
	Both,
}

#[derive(Args)]
pub struct MonitorArguments
{
	#[arg(short = 'b', long = "baudrate", default_value_t = 115200)]
	/// Use baudrate for serial port
	baudrate: u32,

	#[arg(short = 'd', long = "databits", default_value_t = 8, value_parser = clap::value_parser!(u8).range(5..=8))]
	/// Change the number of bits for every character
	databits: u8,

	#[arg(short = 'p', long = "stopbits", default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=2))]
	/// Change the number of stop bits for every character
	stopbits: u8,

	#[arg(short = 'y', long = "parity", value_enum, default_value_t = ParityArg::Off)]
	/// Change the parity mode of the serial port
	parity: ParityArg,

	#[arg(short = 'f', long = "flow", value_enum, default_value_t = FlowArg::Off)]
	/// Define the flow-control mode
	flow: FlowArg,

	#[arg(short = 'D', long = "direction", value_enum, default_value_t = DirectionArg::Both)]
	/// Open the serial connection in the given direction
	direction: DirectionArg,

	#[arg(short = 'r', long = "raw")]
	/// Disable line-buffering and line-editing
	raw: bool,

	#[arg(short = 's', long = "silent")]
	/// Disable echoing of local input on the terminal
	silent: bool,

	#[arg(short = 'R', long = "reconnect")]
	/// Try to reconnect on I/O errors
	reconnect: bool,

	#[arg(long = "timeout-eof", default_value_t = 200, allow_hyphen_values = true)]
	/// Time in ms before closing after EOF on standard input, -1 to disable
	timeout_eof: i32,
}

impl MonitorArguments
{
	fn serial_config(&self) -> SerialConfig
	{
		SerialConfig {
			baudrate: Some(self.baudrate),
			databits: Some(self.databits),
			stopbits: Some(self.stopbits),
			parity: Some(match self.parity {
				ParityArg::Off => Parity::Off,
				ParityArg::Even => Parity::Even,
				ParityArg::Odd => Parity::Odd,
			}),
			rts: Some(match self.flow {
				FlowArg::Rtscts => Rts::Flow,
				_ => Rts::Off,
			}),
			dtr: None,
			xonxoff: Some(match self.flow {
				FlowArg::Xonxoff => XonXoff::InOut,
				_ => XonXoff::Off,
			}),
		}
	}

	fn port_mode(&self) -> PortMode
	{
		match self.direction {
			DirectionArg::Input => PortMode::Read,
			DirectionArg::Output => PortMode::Write,
			DirectionArg::Both => PortMode::ReadWrite,
		}
	}
}

pub fn monitor_command(global: &GlobalArguments, args: &MonitorArguments) -> Result<()>
{
	let board_set = open_board_set()?;

	// Line buffering and local echo belong to the terminal layer sitting above
	// this command, the flags are accepted for command-line compatibility
	if args.raw || args.silent {
		log::debug!("--raw/--silent are advisory, terminal modes are not changed here");
	}

	loop {
		let board = select_board(&board_set, global)?;

		if !board.has_capability(Capability::Serial) {
			if !args.reconnect {
				return Err(eyre!("Board '{}' has no serial interface", board.tag()));
			}
			info!("Waiting for '{}'...", board.tag());
			board_set.wait_for(&board, Capability::Serial, -1)?;
		}

		let mut port = board.open_interface(Capability::Serial, args.port_mode())?;
		if port.device().dev_type == DeviceType::Serial {
			port.serial_set_config(&args.serial_config())?;
		}
		info!("Monitoring '{}'", board.tag());

		match pump(&board_set, &mut port, args) {
			Ok(()) => return Ok(()),
			Err(err) if args.reconnect && err.downcast_ref::<tytool::error::Error>()
				.is_some_and(|e| e.kind == ErrorKind::Io) =>
			{
				warn!("Connection lost, waiting for '{}'...", board.tag());
				drop(port);
				board_set.wait_for(&board, Capability::Serial, -1)?;
			},
			Err(err) => return Err(err),
		}
	}
}

fn forward_to_port(port: &mut Port, buf: &[u8]) -> Result<()>
{
	match port.device().dev_type {
		DeviceType::Serial => {
			let mut sent = 0;
			while sent < buf.len() {
				let n = port.serial_write(&buf[sent..], 5000)?;
				if n == 0 {
					return Err(eyre!("Timed out while writing to the board"));
				}
				sent += n;
			}
		},
		DeviceType::Hid => {
			// Seremu: one zero-ID report per packet
			let max = port.device().hid.max_input_len.max(32);
			for chunk in buf.chunks(max) {
				let mut report = vec![0u8; chunk.len() + 1];
				report[1..].copy_from_slice(chunk);
				port.hid_write(&report)?;
			}
		},
	}
	Ok(())
}

fn forward_to_stdout(port: &mut Port, timeout: i32) -> Result<usize>
{
	let mut buf = [0u8; 8192];
	let n = match port.device().dev_type {
		DeviceType::Serial => port.serial_read(&mut buf, timeout)?,
		DeviceType::Hid => {
			// Strip the report ID byte from seremu reports
			let n = port.hid_read(&mut buf, timeout)?;
			if n > 1 {
				buf.copy_within(1..n, 0);
				n - 1
			} else {
				0
			}
		},
	};

	if n > 0 {
		let stdout = std::io::stdout();
		let mut handle = stdout.lock();
		handle.write_all(&buf[..n])?;
		handle.flush()?;
	}

	Ok(n)
}

#[cfg(unix)]
fn pump(_board_set: &std::sync::Arc<BoardSet>, port: &mut Port, args: &MonitorArguments) -> Result<()>
{
	use std::io::Read;

	use tytool::platform::{PollSource, adjust_timeout, millis, poll};

	const STDIN_TAG: u64 = 1;
	const PORT_TAG: u64 = 2;

	let input = args.direction != DirectionArg::Output;
	let output = args.direction != DirectionArg::Input;

	let mut stdin_open = output;
	let mut eof_since: Option<u64> = None;

	loop {
		let mut sources = Vec::new();
		if input {
			sources.push(PollSource::new(port.poll_handle(), PORT_TAG));
		}
		if stdin_open {
			sources.push(PollSource::new(libc::STDIN_FILENO, STDIN_TAG));
		}
		if sources.is_empty() {
			return Ok(());
		}

		// After stdin EOF, linger long enough to catch the device's last output
		let timeout = match eof_since {
			Some(since) if args.timeout_eof >= 0 => {
				let remaining = adjust_timeout(args.timeout_eof, since);
				if remaining == 0 {
					return Ok(());
				}
				remaining
			},
			_ => -1,
		};

		poll(&mut sources, timeout)?;

		for source in &sources {
			if !source.ready {
				continue;
			}

			match source.tag {
				PORT_TAG => {
					forward_to_stdout(port, 0)?;
					if eof_since.is_some() && args.timeout_eof >= 0 {
						eof_since = Some(millis());
					}
				},
				STDIN_TAG => {
					let mut buf = [0u8; 8192];
					let n = std::io::stdin().lock().read(&mut buf)?;
					if n == 0 {
						stdin_open = false;
						if !input {
							return Ok(());
						}
						eof_since = Some(millis());
					} else {
						forward_to_port(port, &buf[..n])?;
					}
				},
				_ => {},
			}
		}
	}
}

#[cfg(windows)]
fn pump(_board_set: &std::sync::Arc<BoardSet>, port: &mut Port, args: &MonitorArguments) -> Result<()>
{
	use std::io::Read;
	use std::sync::mpsc;

	use tytool::platform::{adjust_timeout, millis};

	let input = args.direction != DirectionArg::Output;
	let output = args.direction != DirectionArg::Input;

	// Console handles cannot be polled alongside device handles, a helper
	// thread feeds standard input through a channel instead
	let (tx, rx) = mpsc::channel::<Vec<u8>>();
	if output {
		std::thread::spawn(move || {
			let mut buf = [0u8; 8192];
			loop {
				match std::io::stdin().lock().read(&mut buf) {
					Ok(0) | Err(_) => {
						let _ = tx.send(Vec::new());
						break;
					},
					Ok(n) => {
						if tx.send(buf[..n].to_vec()).is_err() {
							break;
						}
					},
				}
			}
		});
	}

	let mut eof_since: Option<u64> = None;

	loop {
		if input {
			forward_to_stdout(port, 100)?;
		} else {
			std::thread::sleep(std::time::Duration::from_millis(100));
		}

		while let Ok(chunk) = rx.try_recv() {
			if chunk.is_empty() {
				if !input {
					return Ok(());
				}
				eof_since = Some(millis());
			} else {
				forward_to_port(port, &chunk)?;
			}
		}

		if let Some(since) = eof_since {
			if args.timeout_eof >= 0 && adjust_timeout(args.timeout_eof, since) == 0 {
				return Ok(());
			}
		}
	}
}
