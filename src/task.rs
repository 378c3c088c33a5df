// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors
//! Long-running board operations.
//!
//! Every operation on a board (upload, reset, reboot, sending serial data) is a
//! [Task]: it carries a status, a message callback for log/progress/status
//! streams, a cooperative cancellation flag and, once finished, an optional
//! typed result. Tasks run either synchronously on the calling thread or on a
//! [Pool] of worker threads; in both cases only one task per board runs at a
//! time, and tasks submitted to one board execute in submission order.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use bitmask_enum::bitmask;
use log::Level;

use crate::board::{BoardSet, SharedBoard};
use crate::device::{DeviceType, PortMode};
use crate::error::{ErrorKind, Result};
use crate::firmware::Firmware;
use crate::halfkay;
use crate::models::Capability;
use crate::platform::{adjust_timeout, millis};
use crate::port::Port;

/// How long to wait for the bootloader to enumerate after a reboot trigger.
const BOOTLOADER_WAIT: i32 = 15000;
/// Serial send operations give the device this long per write burst.
const SEND_TIMEOUT: i32 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskStatus
{
	Ready,
	Pending,
	Running,
	Finished,
}

#[bitmask(u8)]
pub enum UploadFlags
{
	/// Skip the firmware/model signature check.
	NoCheck,
	/// Leave the board in the bootloader after programming.
	NoResetAfter,
}

/// What a task was asked to do.
pub enum TaskKind
{
	Upload
	{
		firmwares: Vec<Arc<Firmware>>,
		flags: UploadFlags,
	},
	Reset,
	Reboot,
	SendSerial
	{
		data: Vec<u8>,
	},
	SendFile
	{
		path: PathBuf,
	},
}

impl TaskKind
{
	fn name(&self) -> &'static str
	{
		match self {
			TaskKind::Upload { .. } => "upload",
			TaskKind::Reset => "reset",
			TaskKind::Reboot => "reboot",
			TaskKind::SendSerial { .. } => "send",
			TaskKind::SendFile { .. } => "send-file",
		}
	}
}

/// Typed payload handed to observers when a task finishes successfully.
#[derive(Clone)]
pub enum TaskResult
{
	/// The firmware that was programmed, for upload tasks.
	Firmware(Arc<Firmware>),
}

/// Messages delivered through the task callback, in order: zero or more
/// log/progress messages interleaved, bracketed by status transitions.
pub enum TaskMessage
{
	Log
	{
		level: Level,
		msg: String,
	},
	Status(TaskStatus),
	Progress
	{
		action: &'static str,
		value: usize,
		max: usize,
	},
}

type TaskCallback = Box<dyn Fn(&TaskMessage) + Send + Sync>;

struct TaskInner
{
	board_set: Arc<BoardSet>,
	board: SharedBoard,
	kind: TaskKind,

	status: Mutex<TaskStatus>,
	finished: Condvar,
	cancel: AtomicBool,
	success: Mutex<Option<bool>>,
	result: Mutex<Option<TaskResult>>,
	log: Mutex<Vec<(Level, String)>>,
	callback: Mutex<Option<TaskCallback>>,
}

/// Cloneable handle to a board operation, see module docs.
#[derive(Clone)]
pub struct Task
{
	inner: Arc<TaskInner>,
}

impl Task
{
	pub fn new(board_set: Arc<BoardSet>, board: SharedBoard, kind: TaskKind) -> Self
	{
		Self {
			inner: Arc::new(TaskInner {
				board_set,
				board,
				kind,
				status: Mutex::new(TaskStatus::Ready),
				finished: Condvar::new(),
				cancel: AtomicBool::new(false),
				success: Mutex::new(None),
				result: Mutex::new(None),
				log: Mutex::new(Vec::new()),
				callback: Mutex::new(None),
			}),
		}
	}

	/// Install the message callback. Must be done before the task starts, the
	/// callback runs on whichever thread executes the task.
	pub fn set_callback(&self, callback: impl Fn(&TaskMessage) + Send + Sync + 'static)
	{
		*self.inner.callback.lock().unwrap() = Some(Box::new(callback));
	}

	pub fn board(&self) -> &SharedBoard
	{
		&self.inner.board
	}

	pub fn name(&self) -> &'static str
	{
		self.inner.kind.name()
	}

	pub fn status(&self) -> TaskStatus
	{
		*self.inner.status.lock().unwrap()
	}

	/// `None` until the task finishes.
	pub fn succeeded(&self) -> Option<bool>
	{
		*self.inner.success.lock().unwrap()
	}

	/// Request cooperative cancellation; the task notices at its next progress
	/// point and finishes with an I/O error.
	pub fn cancel(&self)
	{
		self.inner.cancel.store(true, Ordering::Release);
	}

	/// Messages logged so far.
	pub fn log_messages(&self) -> Vec<(Level, String)>
	{
		self.inner.log.lock().unwrap().clone()
	}

	/// Take ownership of the result, if the task produced one. Only available
	/// once the status is [TaskStatus::Finished].
	pub fn take_result(&self) -> Option<TaskResult>
	{
		self.inner.result.lock().unwrap().take()
	}

	/// Run the task: queue it on `pool` when given, execute synchronously on the
	/// calling thread otherwise.
	pub fn start(&self, pool: Option<&Pool>) -> Result<()>
	{
		{
			let status = self.inner.status.lock().unwrap();
			if *status != TaskStatus::Ready {
				return Err(ErrorKind::System.report("Task has already been started"));
			}
		}

		match pool {
			Some(pool) => pool.submit(self.clone()),
			None => {
				self.set_status(TaskStatus::Pending);
				self.execute();
				Ok(())
			},
		}
	}

	/// Block until the task finishes. Returns false on timeout.
	pub fn wait(&self, timeout: i32) -> bool
	{
		let start = millis();
		let mut status = self.inner.status.lock().unwrap();

		while *status != TaskStatus::Finished {
			if timeout >= 0 {
				let remaining = adjust_timeout(timeout, start);
				if remaining == 0 {
					return false;
				}
				let (guard, _) = self
					.inner
					.finished
					.wait_timeout(status, std::time::Duration::from_millis(remaining as u64))
					.unwrap();
				status = guard;
			} else {
				status = self.inner.finished.wait(status).unwrap();
			}
		}

		true
	}

	fn notify(&self, message: &TaskMessage)
	{
		let callback = self.inner.callback.lock().unwrap();
		if let Some(callback) = callback.as_ref() {
			callback(message);
		}
	}

	fn set_status(&self, status: TaskStatus)
	{
		{
			let mut current = self.inner.status.lock().unwrap();
			*current = status;
		}
		self.notify(&TaskMessage::Status(status));
		if status == TaskStatus::Finished {
			self.inner.finished.notify_all();
		}
	}

	fn report_log(&self, level: Level, msg: String)
	{
		log::log!(level, "{}", msg);
		self.inner.log.lock().unwrap().push((level, msg.clone()));
		self.notify(&TaskMessage::Log {
			level,
			msg,
		});
	}

	/// Progress points double as cancellation points.
	fn report_progress(&self, action: &'static str, value: usize, max: usize) -> Result<()>
	{
		self.check_cancelled()?;
		self.notify(&TaskMessage::Progress {
			action,
			value,
			max,
		});
		Ok(())
	}

	fn check_cancelled(&self) -> Result<()>
	{
		if self.inner.cancel.load(Ordering::Acquire) {
			return Err(ErrorKind::Io.report(format!("Task '{}' was cancelled", self.name())));
		}
		Ok(())
	}

	/// Run to completion on the current thread. Status must be Pending.
	fn execute(&self)
	{
		self.set_status(TaskStatus::Running);

		let outcome = match &self.inner.kind {
			TaskKind::Upload { firmwares, flags } => self.run_upload(firmwares, *flags),
			TaskKind::Reset => self.run_reset(),
			TaskKind::Reboot => self.run_reboot(),
			TaskKind::SendSerial { data } => self.run_send(data),
			TaskKind::SendFile { path } => self.run_send_file(path),
		};

		let success = match outcome {
			Ok(()) => true,
			Err(err) => {
				self.report_log(Level::Error, err.to_string());
				false
			},
		};

		*self.inner.success.lock().unwrap() = Some(success);
		self.set_status(TaskStatus::Finished);
	}

	/// Get the board into the bootloader and open its programming interface.
	fn open_bootloader(&self) -> Result<Port>
	{
		let board = &self.inner.board;

		if !board.has_capability(Capability::Upload) {
			if !board.has_capability(Capability::Reboot) {
				return Err(ErrorKind::NotFound.report(format!(
					"Board '{}' is not in a state where it can be programmed",
					board.tag()
				)));
			}

			self.report_log(Level::Info, format!("Switching '{}' to bootloader mode", board.tag()));
			trigger_reboot(board)?;

			if !self.inner.board_set.wait_for(board, Capability::Upload, BOOTLOADER_WAIT)? {
				return Err(ErrorKind::Io
					.report(format!("Board '{}' did not switch to bootloader mode", board.tag())));
			}
		}

		// The device node can take a moment to become accessible after
		// enumeration, probe quietly a few times
		let mut attempts = 4u32;
		loop {
			let guard = ErrorKind::NotFound.mask();
			let r = board.open_interface(Capability::Upload, PortMode::ReadWrite);
			drop(guard);

			match r {
				Ok(port) => return Ok(port),
				Err(err) if attempts == 0 => return Err(err),
				Err(_) => {
					attempts -= 1;
					std::thread::sleep(std::time::Duration::from_millis(100));
					let _ = self.inner.board_set.refresh(|_, _| {});
				},
			}
		}
	}

	fn run_upload(&self, firmwares: &[Arc<Firmware>], flags: UploadFlags) -> Result<()>
	{
		let board = &self.inner.board;
		let mut port = self.open_bootloader()?;

		let model = board
			.model()
			.ok_or_else(|| ErrorKind::NotFound.report("Bootloader model is unknown"))?;

		// Pick the first firmware built for this model, unless checks are off
		let firmware = if flags.contains(UploadFlags::NoCheck) {
			firmwares.first()
		} else {
			firmwares.iter().find(|fw| model.test_firmware(fw))
		};
		let firmware = firmware.ok_or_else(|| {
			ErrorKind::NotFound.report(format!(
				"No firmware is compatible with {} (tried {})",
				model.name,
				firmwares.len()
			))
		})?;

		self.report_log(
			Level::Info,
			format!("Uploading '{}' to {} ({} bytes)", firmware.name(), model.name, firmware.total_size()),
		);

		halfkay::upload(&mut port, model, firmware, |value, max| {
			self.report_progress("upload", value, max)
		})?;

		*self.inner.result.lock().unwrap() = Some(TaskResult::Firmware(firmware.clone()));

		if !flags.contains(UploadFlags::NoResetAfter) {
			self.report_log(Level::Info, "Sending reset command".to_string());
			halfkay::boot(&mut port, model)?;
		}

		Ok(())
	}

	fn run_reset(&self) -> Result<()>
	{
		let board = &self.inner.board;
		let mut port = self.open_bootloader()?;
		let model = board
			.model()
			.ok_or_else(|| ErrorKind::NotFound.report("Bootloader model is unknown"))?;

		self.report_log(Level::Info, format!("Resetting '{}'", board.tag()));
		halfkay::boot(&mut port, model)
	}

	fn run_reboot(&self) -> Result<()>
	{
		let board = &self.inner.board;

		if board.has_capability(Capability::Upload) {
			self.report_log(Level::Info, format!("Board '{}' is already in bootloader mode", board.tag()));
			return Ok(());
		}

		self.report_log(Level::Info, format!("Rebooting '{}' into bootloader mode", board.tag()));
		trigger_reboot(board)?;

		if !self.inner.board_set.wait_for(board, Capability::Upload, BOOTLOADER_WAIT)? {
			return Err(ErrorKind::Io
				.report(format!("Board '{}' did not switch to bootloader mode", board.tag())));
		}

		Ok(())
	}

	fn run_send(&self, data: &[u8]) -> Result<()>
	{
		let board = &self.inner.board;
		let mut port = board.open_interface(Capability::Serial, PortMode::ReadWrite)?;

		let mut sent = 0usize;
		self.report_progress("send", 0, data.len())?;
		while sent < data.len() {
			let chunk_end = (sent + 4096).min(data.len());
			let written = send_chunk(&mut port, &data[sent..chunk_end])?;
			if written == 0 {
				return Err(ErrorKind::Io
					.report(format!("Timed out while sending to '{}'", board.tag())));
			}
			sent += written;
			self.report_progress("send", sent, data.len())?;
		}

		Ok(())
	}

	fn run_send_file(&self, path: &PathBuf) -> Result<()>
	{
		let data = std::fs::read(path).map_err(|e| {
			ErrorKind::from_io(&e)
				.report(format!("Failed to read '{}': {}", path.display(), e))
		})?;
		self.run_send(&data)
	}
}

/// Send one burst through the appropriate channel for the interface type.
fn send_chunk(port: &mut Port, chunk: &[u8]) -> Result<usize>
{
	match port.device().dev_type {
		DeviceType::Serial => port.serial_write(chunk, SEND_TIMEOUT),
		DeviceType::Hid => {
			// Seremu takes one packet per report, sized by the interface
			let max = port.device().hid.max_input_len.max(32);
			let len = chunk.len().min(max);
			let mut report = vec![0u8; len + 1];
			report[1..].copy_from_slice(&chunk[..len]);
			let written = port.hid_write(&report)?;
			Ok(written.saturating_sub(1))
		},
	}
}

/// Issue the reboot-to-bootloader trigger on a run-mode interface.
fn trigger_reboot(board: &SharedBoard) -> Result<()>
{
	let iface = board
		.interfaces()
		.into_iter()
		.find(|iface| iface.capabilities.contains(Capability::Reboot))
		.ok_or_else(|| {
			ErrorKind::NotFound
				.report(format!("Board '{}' has no interface able to reboot it", board.tag()))
		})?;

	let mut port = Port::open(&iface.dev, PortMode::ReadWrite)?;
	match iface.dev.dev_type {
		DeviceType::Serial => halfkay::reboot_serial(&mut port),
		DeviceType::Hid => halfkay::reboot_seremu(&mut port),
	}
}

struct PoolShared
{
	queue: Mutex<PoolQueue>,
	wakeup: Condvar,
}

#[derive(Default)]
struct PoolQueue
{
	tasks: VecDeque<Task>,
	/// Boards with a task currently running, by board pointer identity.
	busy: Vec<usize>,
	shutdown: bool,
}

/// Bounded worker pool executing tasks FIFO, with per-board serialization:
/// a task stays queued while another task for the same board is running.
pub struct Pool
{
	shared: Arc<PoolShared>,
	workers: Vec<JoinHandle<()>>,
}

impl Pool
{
	/// OS-dependent default: modest on Windows (device installation storms make
	/// parallel device I/O fragile there), wider on POSIX.
	pub fn default_thread_count() -> usize
	{
		#[cfg(windows)]
		{
			if crate::platform::windows_is_10_or_later() { 2 } else { 1 }
		}
		#[cfg(not(windows))]
		{
			4
		}
	}

	pub fn new(max_threads: usize) -> Self
	{
		let shared = Arc::new(PoolShared {
			queue: Mutex::new(PoolQueue::default()),
			wakeup: Condvar::new(),
		});

		let workers = (0..max_threads.max(1))
			.map(|idx| {
				let shared = shared.clone();
				std::thread::Builder::new()
					.name(format!("task-pool-{}", idx))
					.spawn(move || worker_loop(shared))
					.expect("failed to spawn pool worker")
			})
			.collect();

		Self {
			shared,
			workers,
		}
	}

	fn submit(&self, task: Task) -> Result<()>
	{
		task.set_status(TaskStatus::Pending);

		let mut queue = self.shared.queue.lock().unwrap();
		if queue.shutdown {
			return Err(ErrorKind::System.report("Task pool is shut down"));
		}
		queue.tasks.push_back(task);
		drop(queue);

		self.shared.wakeup.notify_one();
		Ok(())
	}
}

impl Drop for Pool
{
	fn drop(&mut self)
	{
		{
			let mut queue = self.shared.queue.lock().unwrap();
			queue.shutdown = true;
		}
		self.shared.wakeup.notify_all();

		for worker in self.workers.drain(..) {
			let _ = worker.join();
		}
	}
}

fn worker_loop(shared: Arc<PoolShared>)
{
	loop {
		let task = {
			let mut queue = shared.queue.lock().unwrap();

			loop {
				if queue.shutdown {
					return;
				}

				// First task whose board is free; scanning from the front keeps
				// per-board submission order
				let next = queue.tasks.iter().position(|task| {
					let board_id = Arc::as_ptr(task.board()) as usize;
					!queue.busy.contains(&board_id)
				});

				match next {
					Some(idx) => {
						let task = queue.tasks.remove(idx).unwrap();
						queue.busy.push(Arc::as_ptr(task.board()) as usize);
						break task;
					},
					None => queue = shared.wakeup.wait(queue).unwrap(),
				}
			}
		};

		task.execute();

		{
			let mut queue = shared.queue.lock().unwrap();
			let board_id = Arc::as_ptr(task.board()) as usize;
			queue.busy.retain(|id| *id != board_id);
		}
		// A queued task for this board may be runnable now
		shared.wakeup.notify_all();
	}
}

/// High-level request helpers, the task-object counterpart of the C++ board
/// façade: build the task, attach it to the pool (or run synchronously when
/// `pool` is `None`).
impl Task
{
	pub fn upload(
		board_set: Arc<BoardSet>, board: SharedBoard, firmwares: Vec<Arc<Firmware>>,
		flags: UploadFlags,
	) -> Self
	{
		Self::new(board_set, board, TaskKind::Upload {
			firmwares,
			flags,
		})
	}

	pub fn reset(board_set: Arc<BoardSet>, board: SharedBoard) -> Self
	{
		Self::new(board_set, board, TaskKind::Reset)
	}

	pub fn reboot(board_set: Arc<BoardSet>, board: SharedBoard) -> Self
	{
		Self::new(board_set, board, TaskKind::Reboot)
	}

	pub fn send_serial(board_set: Arc<BoardSet>, board: SharedBoard, data: Vec<u8>) -> Self
	{
		Self::new(board_set, board, TaskKind::SendSerial {
			data,
		})
	}

	pub fn send_file(board_set: Arc<BoardSet>, board: SharedBoard, path: PathBuf) -> Self
	{
		Self::new(board_set, board, TaskKind::SendFile {
			path,
		})
	}
}

/// Request façade on the board aggregate: build a task bound to one of our
/// boards, ready to be started synchronously or on a pool.
impl BoardSet
{
	pub fn upload(
		self: Arc<Self>, board: &SharedBoard, firmwares: Vec<Arc<Firmware>>, flags: UploadFlags,
	) -> Task
	{
		Task::upload(self, board.clone(), firmwares, flags)
	}

	pub fn reset(self: Arc<Self>, board: &SharedBoard) -> Task
	{
		Task::reset(self, board.clone())
	}

	pub fn reboot(self: Arc<Self>, board: &SharedBoard) -> Task
	{
		Task::reboot(self, board.clone())
	}

	pub fn send(self: Arc<Self>, board: &SharedBoard, data: Vec<u8>) -> Task
	{
		Task::send_serial(self, board.clone(), data)
	}

	pub fn send_file(self: Arc<Self>, board: &SharedBoard, path: PathBuf) -> Task
	{
		Task::send_file(self, board.clone(), path)
	}
}

#[cfg(test)]
mod tests
{
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;
	use crate::board::Board;

	fn synthetic_board(tag: &str) -> SharedBoard
	{
		Board::new(format!("usb-9-{}", tag), Some(tag.to_string()))
	}

	#[test]
	fn tasks_without_a_device_finish_with_an_error()
	{
		let board_set = BoardSet::new().unwrap();
		let board = synthetic_board("1");

		let task = Task::send_serial(board_set, board, b"hello".to_vec());
		assert_eq!(task.status(), TaskStatus::Ready);

		task.start(None).unwrap();
		assert_eq!(task.status(), TaskStatus::Finished);
		assert_eq!(task.succeeded(), Some(false));
		assert!(!task.log_messages().is_empty());
	}

	#[test]
	fn starting_twice_is_rejected()
	{
		let board_set = BoardSet::new().unwrap();
		let task = Task::reset(board_set, synthetic_board("2"));

		task.start(None).unwrap();
		assert!(task.start(None).is_err());
	}

	#[test]
	fn status_messages_bracket_the_run()
	{
		let board_set = BoardSet::new().unwrap();
		let task = Task::reboot(board_set, synthetic_board("3"));

		let seen = Arc::new(Mutex::new(Vec::new()));
		let sink = seen.clone();
		task.set_callback(move |message| {
			if let TaskMessage::Status(status) = message {
				sink.lock().unwrap().push(*status);
			}
		});

		task.start(None).unwrap();

		let seen = seen.lock().unwrap();
		assert_eq!(
			seen.as_slice(),
			&[TaskStatus::Pending, TaskStatus::Running, TaskStatus::Finished]
		);
	}

	#[test]
	fn pool_runs_tasks_and_serializes_per_board()
	{
		let board_set = BoardSet::new().unwrap();
		let board = synthetic_board("4");
		let other = synthetic_board("5");
		let pool = Pool::new(2);

		let running = Arc::new(AtomicUsize::new(0));

		let tasks: Vec<Task> = (0..4)
			.map(|idx| {
				let target = if idx % 2 == 0 { board.clone() } else { other.clone() };
				Task::send_serial(board_set.clone(), target, vec![0u8; 16])
			})
			.collect();

		for task in &tasks {
			let counter = running.clone();
			task.set_callback(move |message| {
				if let TaskMessage::Status(TaskStatus::Running) = message {
					counter.fetch_add(1, Ordering::SeqCst);
				}
			});
			task.start(Some(&pool)).unwrap();
		}

		for task in &tasks {
			assert!(task.wait(5000), "task did not finish in time");
			assert_eq!(task.status(), TaskStatus::Finished);
		}
		assert_eq!(running.load(Ordering::SeqCst), tasks.len());
	}

	#[test]
	fn wait_times_out_on_unstarted_tasks()
	{
		let board_set = BoardSet::new().unwrap();
		let task = Task::reset(board_set, synthetic_board("6"));

		assert!(!task.wait(50));
	}
}
