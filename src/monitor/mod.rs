// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors
//! Device discovery and hotplug monitoring.
//!
//! A [Monitor] keeps a table of the currently attached devices matching its
//! specs and exposes a pollable handle that becomes ready when the OS has
//! pending device notifications; call [Monitor::refresh] to process them.
//! [enumerate] and [find] perform one-shot listings without any monitoring
//! machinery.
//!
//! Callbacks return [`ControlFlow`]: `Break(())` aborts the walk and is
//! propagated to the caller. Events for a single device are delivered in OS
//! order, a removal is never reported before the matching addition.

use std::collections::HashMap;
use std::ops::ControlFlow;

use crate::device::{DeviceStatus, SharedDevice};
use crate::error::Result;
use crate::match_spec::{MatchSet, MatchSpec};
use crate::platform::Handle;

#[cfg(any(target_os = "linux", target_os = "android"))]
#[path = "linux.rs"]
mod imp;
#[cfg(windows)]
#[path = "windows.rs"]
mod imp;
#[cfg(target_os = "macos")]
#[path = "darwin.rs"]
mod imp;

/// Cached table of known devices, keyed by the OS-stable device key.
///
/// Most keys map to a single interface, but the table tolerates several
/// interfaces sharing a key (they are then told apart by interface number).
#[derive(Debug, Default)]
pub(crate) struct DeviceTable
{
	devices: HashMap<String, Vec<SharedDevice>>,
}

impl DeviceTable
{
	fn has_device(&self, key: &str, iface_number: u8) -> bool
	{
		self.devices
			.get(key)
			.is_some_and(|devs| devs.iter().any(|dev| dev.iface_number == iface_number))
	}

	/// Insert a freshly matched device and report it. Duplicate
	/// `(key, iface_number)` pairs are silently ignored.
	fn add(
		&mut self, dev: SharedDevice, mut callback: Option<&mut dyn FnMut(&SharedDevice) -> ControlFlow<()>>,
	) -> ControlFlow<()>
	{
		if self.has_device(&dev.key, dev.iface_number) {
			return ControlFlow::Continue(());
		}

		dev.log_event("Add");
		self.devices.entry(dev.key.clone()).or_default().push(dev.clone());

		match callback.as_deref_mut() {
			Some(callback) => callback(&dev),
			None => ControlFlow::Continue(()),
		}
	}

	/// Flip every interface stored under `key` to disconnected, report it, then
	/// drop the entries.
	fn remove(
		&mut self, key: &str, mut callback: Option<&mut dyn FnMut(&SharedDevice) -> ControlFlow<()>>,
	) -> ControlFlow<()>
	{
		let Some(devs) = self.devices.remove(key) else {
			return ControlFlow::Continue(());
		};

		for dev in devs {
			dev.set_status(DeviceStatus::Disconnected);
			dev.log_event("Remove");

			if let Some(callback) = callback.as_deref_mut() {
				callback(&dev)?;
			}
		}

		ControlFlow::Continue(())
	}

	fn list(&self, callback: &mut dyn FnMut(&SharedDevice) -> ControlFlow<()>) -> ControlFlow<()>
	{
		for devs in self.devices.values() {
			for dev in devs {
				callback(dev)?;
			}
		}

		ControlFlow::Continue(())
	}

	#[cfg(target_os = "macos")]
	fn keys_with_prefix(&self, prefix: &str) -> Vec<String>
	{
		self.devices
			.keys()
			.filter(|key| key.starts_with(prefix))
			.cloned()
			.collect()
	}

	fn clear(&mut self)
	{
		for devs in self.devices.values() {
			for dev in devs {
				dev.set_status(DeviceStatus::Disconnected);
			}
		}
		self.devices.clear();
	}
}

/// Device monitor: enumerates matching devices and streams add/remove events.
pub struct Monitor
{
	match_set: MatchSet,
	devices: DeviceTable,
	backend: imp::MonitorBackend,
}

impl Monitor
{
	/// Create a monitor for the given match specs. An empty slice matches every
	/// supported device. The monitor does not deliver anything until [Monitor::start].
	pub fn new(specs: Vec<MatchSpec>) -> Result<Self>
	{
		Ok(Self {
			match_set: MatchSet::new(specs),
			devices: DeviceTable::default(),
			backend: imp::MonitorBackend::new()?,
		})
	}

	/// Connect to the OS device notification channel and take a snapshot of the
	/// currently attached matching devices. Idempotent.
	pub fn start(&mut self) -> Result<()>
	{
		self.backend.start(&self.match_set, &mut self.devices)
	}

	/// Disconnect from the OS notification channel and clear the device table.
	pub fn stop(&mut self)
	{
		self.backend.stop();
		self.devices.clear();
	}

	/// Pollable descriptor which becomes ready when device notifications are
	/// pending; call [Monitor::refresh] then. Valid (but never ready) before
	/// [Monitor::start].
	pub fn poll_handle(&self) -> Handle
	{
		self.backend.poll_handle()
	}

	/// Drain pending OS notifications, updating the device table and invoking the
	/// callback for each added (status online) or removed (status disconnected)
	/// device. Non-blocking.
	pub fn refresh(
		&mut self, mut callback: impl FnMut(&SharedDevice) -> ControlFlow<()>,
	) -> Result<ControlFlow<()>>
	{
		self.backend
			.refresh(&self.match_set, &mut self.devices, &mut callback)
	}

	/// Walk the cached device table without touching the OS. Order is unspecified.
	pub fn list(&self, mut callback: impl FnMut(&SharedDevice) -> ControlFlow<()>) -> ControlFlow<()>
	{
		self.devices.list(&mut callback)
	}
}

/// One-shot enumeration of every currently attached device matching `specs`,
/// without any monitoring machinery.
pub fn enumerate(
	specs: &[MatchSpec], mut callback: impl FnMut(&SharedDevice) -> ControlFlow<()>,
) -> Result<ControlFlow<()>>
{
	let match_set = MatchSet::new(specs.to_vec());
	imp::enumerate(&match_set, &mut |dev| {
		dev.log_event("Enumerate");
		callback(dev)
	})
}

/// Find the first device matching `specs`.
pub fn find(specs: &[MatchSpec]) -> Result<Option<SharedDevice>>
{
	let mut found = None;
	let _ = enumerate(specs, |dev| {
		found = Some(dev.clone());
		ControlFlow::Break(())
	})?;
	Ok(found)
}
