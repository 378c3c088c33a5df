// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors
//! Board aggregation.
//!
//! A physical board shows up as one or more USB interfaces, and those come and
//! go as the board switches between its run-mode and bootloader personalities.
//! A [BoardSet] subscribes to a device monitor and folds interface events into
//! stable [Board] entities: grouped by `(location, serial number)`, carrying a
//! computed capability set, and surviving short disappearances (such as a
//! reboot into the bootloader) in the `Missing` state before being dropped.
//!
//! Boards without a USB serial number cannot be told apart from a replacement
//! plugged into the same port, so they are never re-matched across a
//! reconnect; a fresh [Board] is created instead.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;

use crate::device::{DeviceStatus, DeviceType, PortMode, SharedDevice};
use crate::error::{ErrorKind, Result};
use crate::match_spec::MatchSpec;
use crate::models::{self, Capability, Model};
use crate::monitor::Monitor;
use crate::platform::{PollSource, adjust_timeout, millis, poll};
use crate::port::Port;

/// How long a board may stay `Missing` before it is dropped. Long enough to ride
/// out a reboot-to-bootloader re-enumeration.
pub const DROP_BOARD_DELAY: u64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardStatus
{
	Online,
	/// All interfaces are gone, the board is kept around for [DROP_BOARD_DELAY]
	/// in case it comes back.
	Missing,
	Dropped,
}

/// Events delivered by [BoardSet::refresh].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardEvent
{
	Added,
	Changed,
	Disappeared,
	Dropped,
}

/// One USB interface attached to a board, with the capabilities it contributes.
#[derive(Debug, Clone)]
pub struct BoardInterface
{
	pub dev: SharedDevice,
	pub capabilities: Capability,
}

#[derive(Debug)]
struct BoardState
{
	tag: Option<String>,
	model: Option<&'static Model>,
	status: BoardStatus,
	interfaces: Vec<BoardInterface>,
	capabilities: Capability,
	missing_since: Option<u64>,
	serial_number: Option<String>,
	location: String,
}

/// A logical board, shared between the board set and any running tasks.
/// All mutable state sits behind one lock.
#[derive(Debug)]
pub struct Board
{
	state: Mutex<BoardState>,
}

pub type SharedBoard = Arc<Board>;

impl Board
{
	pub(crate) fn new(location: String, serial_number: Option<String>) -> SharedBoard
	{
		Arc::new(Self {
			state: Mutex::new(BoardState {
				tag: None,
				model: None,
				status: BoardStatus::Online,
				interfaces: Vec::new(),
				capabilities: Capability::none(),
				missing_since: None,
				serial_number,
				location,
			}),
		})
	}

	fn lock(&self) -> MutexGuard<'_, BoardState>
	{
		self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	/// User-facing identifier, `serial@location` unless overridden.
	pub fn tag(&self) -> String
	{
		let state = self.lock();
		match &state.tag {
			Some(tag) => tag.clone(),
			None => match &state.serial_number {
				Some(serial) => format!("{}@{}", serial, state.location),
				None => state.location.clone(),
			},
		}
	}

	/// Override the user-facing identifier (typically persisted by the frontend).
	pub fn set_tag(&self, tag: Option<String>)
	{
		self.lock().tag = tag;
	}

	/// Whether a board selector string refers to this board: the custom tag, the
	/// default `serial@location` tag, the bare serial number or the bare location.
	pub fn matches_identity(&self, id: &str) -> bool
	{
		if self.tag() == id {
			return true;
		}

		let state = self.lock();
		state.location == id || state.serial_number.as_deref() == Some(id)
	}

	pub fn location(&self) -> String
	{
		self.lock().location.clone()
	}

	pub fn serial_number(&self) -> Option<String>
	{
		self.lock().serial_number.clone()
	}

	pub fn model(&self) -> Option<&'static Model>
	{
		self.lock().model
	}

	/// Model name, or the generic family name while the exact model is unknown
	/// (it only becomes known once the bootloader has been seen).
	pub fn model_name(&self) -> &'static str
	{
		self.lock().model.map_or("Teensy", |model| model.name)
	}

	pub fn status(&self) -> BoardStatus
	{
		self.lock().status
	}

	pub fn capabilities(&self) -> Capability
	{
		self.lock().capabilities
	}

	pub fn has_capability(&self, capability: Capability) -> bool
	{
		self.lock().capabilities.contains(capability)
	}

	pub fn interfaces(&self) -> Vec<BoardInterface>
	{
		self.lock().interfaces.clone()
	}

	/// Open the first interface offering `capability`.
	pub fn open_interface(&self, capability: Capability, mode: PortMode) -> Result<Port>
	{
		let dev = {
			let state = self.lock();
			state
				.interfaces
				.iter()
				.find(|iface| iface.capabilities.contains(capability))
				.map(|iface| iface.dev.clone())
		};

		match dev {
			Some(dev) => Port::open(&dev, mode),
			None => Err(ErrorKind::NotFound.report(format!(
				"Board '{}' has no interface with the required capability",
				self.tag()
			))),
		}
	}

	fn recompute(state: &mut BoardState)
	{
		let mut capabilities = Capability::none();
		for iface in &state.interfaces {
			capabilities |= iface.capabilities;
		}
		if state.serial_number.is_some() {
			capabilities |= Capability::Unique;
		}
		state.capabilities = capabilities;
	}
}

/// Capabilities contributed by one device interface, from its personality.
fn interface_capabilities(dev: &SharedDevice) -> Option<Capability>
{
	if models::is_teensy_bootloader(dev.vid, dev.pid) {
		// The bootloader only talks through its HID interface
		if dev.dev_type != DeviceType::Hid {
			return None;
		}
		return Some(Capability::Upload | Capability::Reset);
	}

	if models::is_teensy_run(dev.vid, dev.pid) {
		let capabilities = match dev.dev_type {
			DeviceType::Serial => Capability::Run | Capability::Reboot | Capability::Serial,
			// Raw HID serial emulation accepts the reboot trigger as a feature
			// report; other HID interfaces (keyboard, mouse...) are passive
			DeviceType::Hid if dev.hid.usage_page == models::SEREMU_USAGE_PAGE => {
				Capability::Run | Capability::Reboot | Capability::Serial
			},
			DeviceType::Hid => Capability::Run,
		};
		return Some(capabilities);
	}

	None
}

/// Aggregates monitor events into a set of boards. Shareable across threads;
/// lock order is monitor, then board list, then individual boards.
pub struct BoardSet
{
	monitor: Mutex<Monitor>,
	boards: Mutex<Vec<SharedBoard>>,
}

impl BoardSet
{
	/// Create a board set with its own monitor, matching every Teensy interface.
	pub fn new() -> Result<Arc<Self>>
	{
		let specs = vec![MatchSpec::new().vid_pid(models::TEENSY_VID, 0)];
		let monitor = Monitor::new(specs)?;

		Ok(Arc::new(Self {
			monitor: Mutex::new(monitor),
			boards: Mutex::new(Vec::new()),
		}))
	}

	/// Start monitoring and absorb the currently connected boards.
	pub fn start(&self) -> Result<()>
	{
		let mut events = Vec::new();

		let mut monitor = self.monitor.lock().unwrap();
		monitor.start()?;
		let _ = monitor.list(|dev| {
			self.add_device(dev, &mut events);
			ControlFlow::Continue(())
		});

		Ok(())
	}

	pub fn stop(&self)
	{
		self.monitor.lock().unwrap().stop();
		self.boards.lock().unwrap().clear();
	}

	/// Pollable handle, ready when [BoardSet::refresh] has work to do.
	pub fn poll_handle(&self) -> crate::platform::Handle
	{
		self.monitor.lock().unwrap().poll_handle()
	}

	/// Drain pending device events and deliver the resulting board events. The
	/// callback runs without any internal lock held.
	pub fn refresh(&self, mut callback: impl FnMut(&SharedBoard, BoardEvent)) -> Result<()>
	{
		let mut events = Vec::new();

		{
			let mut monitor = self.monitor.lock().unwrap();
			let _ = monitor.refresh(|dev| {
				match dev.status() {
					DeviceStatus::Online => self.add_device(dev, &mut events),
					DeviceStatus::Disconnected => self.remove_device(dev, &mut events),
				}
				ControlFlow::Continue(())
			})?;
		}

		self.sweep_missing(&mut events);

		for (board, event) in events {
			callback(&board, event);
		}

		Ok(())
	}

	/// Current boards, dropped ones excluded.
	pub fn boards(&self) -> Vec<SharedBoard>
	{
		self.boards.lock().unwrap().clone()
	}

	/// Find a board by tag, serial number or location.
	pub fn find_board(&self, id: &str) -> Option<SharedBoard>
	{
		self.boards
			.lock()
			.unwrap()
			.iter()
			.find(|board| board.matches_identity(id))
			.cloned()
	}

	/// Block until `board` offers `capability`, refreshing on monitor events.
	/// Returns false on timeout, an error if the board is dropped meanwhile.
	pub fn wait_for(&self, board: &SharedBoard, capability: Capability, timeout: i32) -> Result<bool>
	{
		let start = millis();

		loop {
			if board.status() == BoardStatus::Dropped {
				return Err(ErrorKind::NotFound
					.report(format!("Board '{}' has disappeared", board.tag())));
			}
			if board.has_capability(capability) {
				return Ok(true);
			}

			let handle = self.poll_handle();
			let adjusted = adjust_timeout(timeout, start);
			if timeout >= 0 && adjusted == 0 {
				return Ok(false);
			}

			let mut sources = [PollSource::new(handle, 0)];
			poll(&mut sources, adjusted)?;
			self.refresh(|_, _| {})?;
		}
	}

	fn add_device(&self, dev: &SharedDevice, events: &mut Vec<(SharedBoard, BoardEvent)>)
	{
		let Some(capabilities) = interface_capabilities(dev) else {
			debug!("Ignoring unsupported device {}", dev);
			return;
		};

		let mut boards = self.boards.lock().unwrap();

		let existing = boards.iter().position(|board| {
			let state = board.lock();
			if state.location != dev.location {
				return false;
			}
			match (&state.serial_number, &dev.serial_number) {
				(Some(ours), Some(theirs)) => ours == theirs,
				// Ambiguous board: only group interfaces while it is present,
				// never re-match one that has gone missing
				(None, None) => state.status == BoardStatus::Online,
				_ => false,
			}
		});

		let (board, event) = match existing {
			Some(idx) => (boards[idx].clone(), BoardEvent::Changed),
			None => {
				let board = Board::new(dev.location.clone(), dev.serial_number.clone());
				boards.push(board.clone());
				(board, BoardEvent::Added)
			},
		};

		{
			let mut state = board.lock();
			state
				.interfaces
				.retain(|iface| !(iface.dev.key == dev.key && iface.dev.iface_number == dev.iface_number));
			state.interfaces.push(BoardInterface {
				dev: dev.clone(),
				capabilities,
			});

			if let Some(model) = models::identify_bootloader(dev) {
				state.model = Some(model);
			}

			state.status = BoardStatus::Online;
			state.missing_since = None;
			Board::recompute(&mut state);
		}

		events.push((board, event));
	}

	fn remove_device(&self, dev: &SharedDevice, events: &mut Vec<(SharedBoard, BoardEvent)>)
	{
		let boards = self.boards.lock().unwrap();

		for board in boards.iter() {
			let mut state = board.lock();
			let before = state.interfaces.len();
			state
				.interfaces
				.retain(|iface| !(iface.dev.key == dev.key && iface.dev.iface_number == dev.iface_number));
			if state.interfaces.len() == before {
				continue;
			}

			Board::recompute(&mut state);
			let event = if state.interfaces.is_empty() {
				state.status = BoardStatus::Missing;
				state.missing_since = Some(millis());
				BoardEvent::Disappeared
			} else {
				BoardEvent::Changed
			};

			drop(state);
			events.push((board.clone(), event));
			return;
		}
	}

	/// Drop boards that have been missing for longer than the grace delay.
	fn sweep_missing(&self, events: &mut Vec<(SharedBoard, BoardEvent)>)
	{
		self.sweep_missing_at(millis(), events);
	}

	fn sweep_missing_at(&self, now: u64, events: &mut Vec<(SharedBoard, BoardEvent)>)
	{
		let mut boards = self.boards.lock().unwrap();

		boards.retain(|board| {
			let mut state = board.lock();
			let expired = state.status == BoardStatus::Missing
				&& state
					.missing_since
					.is_some_and(|since| now.saturating_sub(since) >= DROP_BOARD_DELAY);
			if !expired {
				return true;
			}

			state.status = BoardStatus::Dropped;
			drop(state);
			events.push((board.clone(), BoardEvent::Dropped));
			false
		});
	}
}

#[cfg(test)]
mod tests
{
	use std::sync::Arc;

	use super::*;
	use crate::device::{Device, DeviceType};
	use crate::models;

	fn serial_device(location: &str, serial: Option<&str>, key: &str) -> SharedDevice
	{
		let mut dev = Device::new(
			DeviceType::Serial,
			key.to_string(),
			location.to_string(),
			format!("/dev/tty-{}", key),
		);
		dev.vid = models::TEENSY_VID;
		dev.pid = 0x0483;
		dev.serial_number = serial.map(str::to_string);
		Arc::new(dev)
	}

	fn bootloader_device(location: &str, serial: Option<&str>, key: &str) -> SharedDevice
	{
		let mut dev = Device::new(
			DeviceType::Hid,
			key.to_string(),
			location.to_string(),
			format!("/dev/hidraw-{}", key),
		);
		dev.vid = models::TEENSY_VID;
		dev.pid = models::HALFKAY_PID;
		dev.hid.usage_page = models::HALFKAY_USAGE_PAGE;
		dev.hid.usage = 0x24; // Teensy 4.0
		dev.serial_number = serial.map(str::to_string);
		Arc::new(dev)
	}

	#[test]
	fn groups_interfaces_into_one_board()
	{
		let set = BoardSet::new().unwrap();
		let mut events = Vec::new();

		set.add_device(&serial_device("usb-1-2", Some("1234"), "k1"), &mut events);
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].1, BoardEvent::Added);

		let board = &set.boards()[0];
		assert_eq!(board.status(), BoardStatus::Online);
		assert_eq!(board.tag(), "1234@usb-1-2");
		assert!(board.has_capability(Capability::Serial));
		assert!(board.has_capability(Capability::Reboot));
		assert!(board.has_capability(Capability::Unique));
		assert!(!board.has_capability(Capability::Upload));
	}

	#[test]
	fn bootloader_interface_identifies_the_model()
	{
		let set = BoardSet::new().unwrap();
		let mut events = Vec::new();

		set.add_device(&serial_device("usb-1-2", Some("1234"), "k1"), &mut events);
		set.add_device(&bootloader_device("usb-1-2", Some("1234"), "k2"), &mut events);

		let boards = set.boards();
		assert_eq!(boards.len(), 1);
		assert_eq!(boards[0].model_name(), "Teensy 4.0");
		assert!(boards[0].has_capability(Capability::Upload));
		assert!(boards[0].has_capability(Capability::Reset));
	}

	#[test]
	fn unique_board_survives_a_reconnect()
	{
		let set = BoardSet::new().unwrap();
		let mut events = Vec::new();

		let dev = serial_device("usb-1-2", Some("1234"), "k1");
		set.add_device(&dev, &mut events);
		let board = set.boards()[0].clone();

		set.remove_device(&dev, &mut events);
		assert_eq!(board.status(), BoardStatus::Missing);
		assert_eq!(events.last().unwrap().1, BoardEvent::Disappeared);

		set.add_device(&serial_device("usb-1-2", Some("1234"), "k3"), &mut events);
		assert_eq!(set.boards().len(), 1);
		assert_eq!(board.status(), BoardStatus::Online);
		assert_eq!(events.last().unwrap().1, BoardEvent::Changed);
	}

	#[test]
	fn ambiguous_board_is_not_rematched_across_a_reconnect()
	{
		let set = BoardSet::new().unwrap();
		let mut events = Vec::new();

		let dev = serial_device("usb-1-2", None, "k1");
		set.add_device(&dev, &mut events);
		let first = set.boards()[0].clone();
		assert!(!first.has_capability(Capability::Unique));

		set.remove_device(&dev, &mut events);
		set.add_device(&serial_device("usb-1-2", None, "k2"), &mut events);

		// The replacement cannot be told apart from a new board, so it is one
		let boards = set.boards();
		assert_eq!(boards.len(), 2);
		assert_eq!(first.status(), BoardStatus::Missing);
	}

	#[test]
	fn missing_boards_are_dropped_after_the_grace_delay()
	{
		let set = BoardSet::new().unwrap();
		let mut events = Vec::new();

		let dev = serial_device("usb-1-2", Some("1234"), "k1");
		set.add_device(&dev, &mut events);
		set.remove_device(&dev, &mut events);

		let board = set.boards()[0].clone();
		let since = board.lock().missing_since.unwrap();

		events.clear();
		set.sweep_missing_at(since + DROP_BOARD_DELAY - 1, &mut events);
		assert!(events.is_empty());
		assert_eq!(set.boards().len(), 1);

		set.sweep_missing_at(since + DROP_BOARD_DELAY, &mut events);
		assert_eq!(events.last().unwrap().1, BoardEvent::Dropped);
		assert_eq!(board.status(), BoardStatus::Dropped);
		assert!(set.boards().is_empty());
	}
}
