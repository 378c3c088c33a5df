// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors
//! Windows device discovery over SetupAPI, CfgMgr and WM_DEVICECHANGE.
//!
//! A background thread owns a hidden message-only window registered for device
//! interface notifications. Incoming DBCC names are normalized to device
//! instance IDs and pushed, debounced, into a queue guarded by a manual-reset
//! event; that event is the monitor's poll handle. `refresh` drains the queue
//! and resolves each instance through CfgMgr, reading USB properties through
//! the owning hub and HID properties through the HID class driver.

use std::collections::VecDeque;
use std::ffi::c_void;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use log::{debug, warn};
use windows::Win32::Devices::DeviceAndDriverInstallation::*;
use windows::Win32::Devices::HumanInterfaceDevice::*;
use windows::Win32::Devices::Usb::*;
use windows::Win32::Foundation::*;
use windows::Win32::Storage::FileSystem::*;
use windows::Win32::System::IO::DeviceIoControl;
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::System::Threading::*;
use windows::Win32::UI::WindowsAndMessaging::*;
use windows::core::{GUID, PCWSTR, w};

use super::DeviceTable;
use crate::device::{Device, DeviceType, SharedDevice};
use crate::error::{ErrorKind, Result};
use crate::match_spec::MatchSet;
use crate::platform::Handle;

/// Debounce delay for device notifications; Windows fires several per physical
/// event while the device stack settles.
const NOTIFICATION_DEBOUNCE_MS: u32 = 100;

const GUID_DEVINTERFACE_USB_DEVICE: GUID =
	GUID::from_u128(0xA5DCBF10_6530_11D2_901F_00C04FB951ED);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind
{
	Added,
	Removed,
}

#[derive(Debug)]
struct DeviceEvent
{
	kind: EventKind,
	/// Normalized device instance ID.
	key: String,
}

struct NotificationState
{
	queue: Mutex<VecDeque<DeviceEvent>>,
	/// Manual-reset event, set while the queue is non-empty.
	event: HANDLE,
}

// HANDLEs are process-global kernel object references, safe to move and share
unsafe impl Send for NotificationState {}
unsafe impl Sync for NotificationState {}

pub(super) struct MonitorBackend
{
	state: Arc<NotificationState>,
	thread: Option<std::thread::JoinHandle<()>>,
	hwnd: HWND,
	started: bool,
}

unsafe impl Send for MonitorBackend {}

impl MonitorBackend
{
	pub(super) fn new() -> Result<Self>
	{
		let event = unsafe { CreateEventW(None, true, false, None) }
			.map_err(|e| ErrorKind::System.report(format!("CreateEvent() failed: {}", e)))?;

		Ok(Self {
			state: Arc::new(NotificationState {
				queue: Mutex::new(VecDeque::new()),
				event,
			}),
			thread: None,
			hwnd: HWND::default(),
			started: false,
		})
	}

	pub(super) fn start(&mut self, match_set: &MatchSet, devices: &mut DeviceTable) -> Result<()>
	{
		if self.started {
			return Ok(());
		}

		let state = self.state.clone();
		let (hwnd_tx, hwnd_rx) = std::sync::mpsc::channel();
		let thread = std::thread::Builder::new()
			.name("device-notify".to_string())
			.spawn(move || notification_thread(state, hwnd_tx))
			.map_err(|e| ErrorKind::System.report(format!("Cannot start notification thread: {}", e)))?;

		let hwnd = hwnd_rx
			.recv()
			.map_err(|_| ErrorKind::System.report("Device notification window creation failed"))?
			.ok_or_else(|| ErrorKind::System.report("Device notification window creation failed"))?;

		self.thread = Some(thread);
		self.hwnd = HWND(hwnd as *mut c_void);
		self.started = true;

		enumerate(match_set, &mut |dev| {
			let _ = devices.add(dev.clone(), None);
			ControlFlow::Continue(())
		})?;

		Ok(())
	}

	pub(super) fn stop(&mut self)
	{
		if !self.started {
			return;
		}

		unsafe {
			let _ = PostMessageW(Some(self.hwnd), WM_CLOSE, WPARAM(0), LPARAM(0));
		}
		if let Some(thread) = self.thread.take() {
			let _ = thread.join();
		}

		self.state.queue.lock().unwrap().clear();
		unsafe {
			let _ = ResetEvent(self.state.event);
		}
		self.started = false;
	}

	pub(super) fn poll_handle(&self) -> Handle
	{
		self.state.event
	}

	pub(super) fn refresh(
		&mut self, match_set: &MatchSet, devices: &mut DeviceTable,
		callback: &mut dyn FnMut(&SharedDevice) -> ControlFlow<()>,
	) -> Result<ControlFlow<()>>
	{
		loop {
			let event = {
				let mut queue = self.state.queue.lock().unwrap();
				match queue.pop_front() {
					Some(event) => event,
					None => {
						unsafe {
							let _ = ResetEvent(self.state.event);
						}
						return Ok(ControlFlow::Continue(()));
					},
				}
			};

			let flow = match event.kind {
				EventKind::Added => match read_device_information(&event.key)? {
					Some(mut dev) => match match_set.matches(&dev) {
						Some(tag) => {
							dev.match_tag = tag;
							devices.add(Arc::new(dev), Some(&mut *callback))
						},
						None => ControlFlow::Continue(()),
					},
					None => ControlFlow::Continue(()),
				},
				EventKind::Removed => devices.remove(&event.key, Some(&mut *callback)),
			};

			if flow.is_break() {
				return Ok(ControlFlow::Break(()));
			}
		}
	}
}

impl Drop for MonitorBackend
{
	fn drop(&mut self)
	{
		self.stop();
		unsafe {
			let _ = CloseHandle(self.state.event);
		}
	}
}

/// Strip the interface-path decorations off a DBCC name and produce an
/// uppercase device instance ID: `\\?\USB#VID_16C0&PID_0483#12345#{guid}`
/// becomes `USB\VID_16C0&PID_0483\12345`.
fn normalize_dbcc_name(name: &str) -> String
{
	let mut name = name;
	for prefix in ["\\\\?\\", "\\\\.\\", "##?#", "##.#"] {
		if let Some(rest) = name.strip_prefix(prefix) {
			name = rest;
			break;
		}
	}
	if let Some(brace) = name.rfind("#{") {
		name = &name[..brace];
	}

	name.chars()
		.map(|c| if c == '#' { '\\' } else { c.to_ascii_uppercase() })
		.collect()
}

struct WindowContext
{
	state: Arc<NotificationState>,
	/// Notifications held back until the debounce timer fires and the device
	/// installer is quiet.
	pending: VecDeque<DeviceEvent>,
}

fn push_event(state: &NotificationState, event: DeviceEvent)
{
	debug!("Queue {:?} event for '{}'", event.kind, event.key);
	let mut queue = state.queue.lock().unwrap();
	queue.push_back(event);
	unsafe {
		let _ = SetEvent(state.event);
	}
}

unsafe extern "system" fn window_proc(hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT
{
	unsafe {
		match msg {
			WM_DEVICECHANGE => {
				let ctx = GetWindowLongPtrW(hwnd, GWLP_USERDATA) as *mut WindowContext;
				if ctx.is_null() {
					return LRESULT(0);
				}
				let ctx = &mut *ctx;

				let header = lparam.0 as *const DEV_BROADCAST_HDR;
				if header.is_null()
					|| (*header).dbch_devicetype != DBT_DEVTYP_DEVICEINTERFACE
				{
					return LRESULT(0);
				}

				let iface = header as *const DEV_BROADCAST_DEVICEINTERFACE_W;
				let name_ptr = (*iface).dbcc_name.as_ptr();
				let name = PCWSTR(name_ptr).to_string().unwrap_or_default();
				let key = normalize_dbcc_name(&name);

				match wparam.0 as u32 {
					DBT_DEVICEARRIVAL => {
						// Hold additions back: the device may still be
						// installing, and Windows fires several notifications
						// per physical plug
						ctx.pending.push_back(DeviceEvent {
							kind: EventKind::Added,
							key,
						});
						SetTimer(Some(hwnd), 1, NOTIFICATION_DEBOUNCE_MS, None);
					},
					DBT_DEVICEREMOVECOMPLETE => {
						push_event(&ctx.state, DeviceEvent {
							kind: EventKind::Removed,
							key,
						});
					},
					_ => {},
				}

				LRESULT(0)
			},

			WM_TIMER => {
				let ctx = GetWindowLongPtrW(hwnd, GWLP_USERDATA) as *mut WindowContext;
				if ctx.is_null() {
					return LRESULT(0);
				}
				let ctx = &mut *ctx;

				// Wait for the device installer before delivering additions, the
				// node is not usable until the driver stack is bound
				if CMP_WaitNoPendingInstallEvents(0) == WAIT_TIMEOUT.0 {
					SetTimer(Some(hwnd), 1, NOTIFICATION_DEBOUNCE_MS, None);
					return LRESULT(0);
				}

				let _ = KillTimer(Some(hwnd), 1);
				while let Some(event) = ctx.pending.pop_front() {
					push_event(&ctx.state, event);
				}
				LRESULT(0)
			},

			WM_CLOSE => {
				let _ = DestroyWindow(hwnd);
				LRESULT(0)
			},
			WM_DESTROY => {
				PostQuitMessage(0);
				LRESULT(0)
			},

			_ => DefWindowProcW(hwnd, msg, wparam, lparam),
		}
	}
}

fn notification_thread(state: Arc<NotificationState>, hwnd_tx: std::sync::mpsc::Sender<Option<isize>>)
{
	unsafe {
		let class_name = w!("tytool-device-monitor");
		let instance = GetModuleHandleW(None).unwrap_or_default();

		let class = WNDCLASSW {
			lpfnWndProc: Some(window_proc),
			hInstance: instance.into(),
			lpszClassName: class_name,
			..Default::default()
		};
		RegisterClassW(&class);

		let hwnd = match CreateWindowExW(
			WINDOW_EX_STYLE(0),
			class_name,
			class_name,
			WINDOW_STYLE(0),
			0,
			0,
			0,
			0,
			Some(HWND_MESSAGE),
			None,
			Some(instance.into()),
			None,
		) {
			Ok(hwnd) => hwnd,
			Err(_) => {
				let _ = hwnd_tx.send(None);
				return;
			},
		};

		let mut ctx = WindowContext {
			state,
			pending: VecDeque::new(),
		};
		SetWindowLongPtrW(hwnd, GWLP_USERDATA, &mut ctx as *mut _ as isize);

		let filter = DEV_BROADCAST_DEVICEINTERFACE_W {
			dbcc_size: std::mem::size_of::<DEV_BROADCAST_DEVICEINTERFACE_W>() as u32,
			dbcc_devicetype: DBT_DEVTYP_DEVICEINTERFACE,
			..Default::default()
		};
		let notify = RegisterDeviceNotificationW(
			HANDLE(hwnd.0),
			&filter as *const _ as *const c_void,
			DEVICE_NOTIFY_WINDOW_HANDLE | DEVICE_NOTIFY_ALL_INTERFACE_CLASSES,
		);
		if notify.is_err() {
			let _ = hwnd_tx.send(None);
			let _ = DestroyWindow(hwnd);
			return;
		}

		let _ = hwnd_tx.send(Some(hwnd.0 as isize));

		let mut msg = MSG::default();
		while GetMessageW(&mut msg, None, 0, 0).as_bool() {
			let _ = TranslateMessage(&msg);
			DispatchMessageW(&msg);
		}

		if let Ok(notify) = notify {
			let _ = UnregisterDeviceNotification(notify);
		}
		SetWindowLongPtrW(hwnd, GWLP_USERDATA, 0);
	}
}

pub(super) fn enumerate(
	match_set: &MatchSet, callback: &mut dyn FnMut(&SharedDevice) -> ControlFlow<()>,
) -> Result<ControlFlow<()>>
{
	// Serial interfaces live in the Ports class, HID interfaces in HIDClass
	let classes: [(GUID, DeviceType); 2] =
		[(GUID_DEVCLASS_PORTS, DeviceType::Serial), (GUID_DEVCLASS_HIDCLASS, DeviceType::Hid)];

	for (class, dev_type) in classes {
		if !match_set.has_type(dev_type) {
			continue;
		}

		let set = unsafe { SetupDiGetClassDevsW(Some(&class), None, None, DIGCF_PRESENT) }
			.map_err(|e| ErrorKind::System.report(format!("SetupDiGetClassDevs() failed: {}", e)))?;

		let mut index = 0u32;
		loop {
			let mut info = SP_DEVINFO_DATA {
				cbSize: std::mem::size_of::<SP_DEVINFO_DATA>() as u32,
				..Default::default()
			};
			if unsafe { SetupDiEnumDeviceInfo(set, index, &mut info) }.is_err() {
				break;
			}
			index += 1;

			let Some(key) = instance_id_from_devinst(info.DevInst) else {
				continue;
			};

			// A single failing device must not abort the whole listing
			match read_device_information(&key) {
				Ok(Some(mut dev)) => {
					if let Some(tag) = match_set.matches(&dev) {
						dev.match_tag = tag;
						if callback(&Arc::new(dev)).is_break() {
							unsafe {
								let _ = SetupDiDestroyDeviceInfoList(set);
							}
							return Ok(ControlFlow::Break(()));
						}
					}
				},
				Ok(None) => {},
				Err(err) => warn!("Skipping device '{}': {}", key, err),
			}
		}

		unsafe {
			let _ = SetupDiDestroyDeviceInfoList(set);
		}
	}

	Ok(ControlFlow::Continue(()))
}

fn instance_id_from_devinst(devinst: u32) -> Option<String>
{
	let mut buf = [0u16; MAX_DEVICE_ID_LEN as usize];
	let r = unsafe { CM_Get_Device_IDW(devinst, &mut buf, 0) };
	if r != CR_SUCCESS {
		return None;
	}

	let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
	Some(String::from_utf16_lossy(&buf[..len]).to_ascii_uppercase())
}

/// Resolve a device instance ID into a full device record, or `None` when the
/// node has gone away or is not a USB HID/serial interface.
fn read_device_information(key: &str) -> Result<Option<Device>>
{
	let wide: Vec<u16> = key.encode_utf16().chain(std::iter::once(0)).collect();

	let mut devinst = 0u32;
	let r = unsafe {
		CM_Locate_DevNodeW(&mut devinst, PCWSTR(wide.as_ptr()), CM_LOCATE_DEVNODE_NORMAL)
	};
	if r != CR_SUCCESS {
		return Ok(None);
	}

	imp_details::read_from_devinst(devinst, key)
}

/// The heavy lifting: interface path, USB topology location and descriptors.
mod imp_details
{
	use super::*;

	pub(super) fn read_from_devinst(devinst: u32, key: &str) -> Result<Option<Device>>
	{
		// The class of the grandparent-level interface tells us the type: HID
		// devices hang off HIDUSB, serial ones off usbser/Ports
		let Some((dev_type, path)) = interface_path(key) else {
			return Ok(None);
		};

		let Some((usb_devinst, iface_number)) = usb_ancestor(devinst) else {
			return Ok(None);
		};

		let Some(location) = resolve_location(usb_devinst) else {
			return Ok(None);
		};

		let mut dev = Device::new(dev_type, key.to_string(), location, path);
		dev.iface_number = iface_number;

		if !read_usb_properties(usb_devinst, &mut dev)? {
			return Ok(None);
		}
		if dev.dev_type == DeviceType::Hid {
			read_hid_properties(&mut dev);
		}

		Ok(Some(dev))
	}

	/// Map an instance ID to an openable `\\?\...` interface path and type.
	fn interface_path(key: &str) -> Option<(DeviceType, String)>
	{
		// HID interface IDs start with HID\, serial USB interfaces with USB\
		// and expose a COM port; both accept the canonical interface path form
		let (dev_type, guid) = if key.starts_with("HID\\") {
			(DeviceType::Hid, GUID_DEVINTERFACE_HID)
		} else {
			(DeviceType::Serial, GUID_DEVINTERFACE_COMPORT)
		};

		let mut path: String = key.chars().map(|c| if c == '\\' { '#' } else { c }).collect();
		path.insert_str(0, "\\\\?\\");
		path.push_str(&format!("#{{{:?}}}", guid));

		Some((dev_type, path.to_ascii_lowercase()))
	}

	/// Walk up to the node with a VID_/PID_ USB instance ID, returning it and
	/// the interface number parsed from its MI_ suffix (0 for plain devices).
	fn usb_ancestor(mut devinst: u32) -> Option<(u32, u8)>
	{
		let mut iface_number = 0u8;

		loop {
			let id = instance_id_from_devinst(devinst)?;
			if id.starts_with("USB\\") && id.contains("VID_") {
				if let Some(mi) = id.find("MI_") {
					iface_number = id[mi + 3..mi + 5].parse().unwrap_or(0);
				} else {
					return Some((devinst, iface_number));
				}
			}

			let mut parent = 0u32;
			if unsafe { CM_Get_Parent(&mut parent, devinst, 0) } != CR_SUCCESS {
				return None;
			}

			// Interface nodes (with MI_) sit right above the device node
			let parent_id = instance_id_from_devinst(parent)?;
			if parent_id.starts_with("USB\\") && parent_id.contains("VID_") && !parent_id.contains("MI_") {
				return Some((parent, iface_number));
			}

			devinst = parent;
		}
	}

	/// Registry property helper.
	fn registry_property(devinst: u32, prop: u32) -> Option<String>
	{
		let mut buf = [0u16; 1024];
		let mut len = (buf.len() * 2) as u32;
		let r = unsafe {
			CM_Get_DevNode_Registry_PropertyW(
				devinst,
				prop,
				None,
				Some(buf.as_mut_ptr() as *mut c_void),
				&mut len,
				0,
			)
		};
		if r != CR_SUCCESS {
			return None;
		}

		let chars = (len as usize / 2).saturating_sub(1);
		Some(String::from_utf16_lossy(&buf[..chars]))
	}

	/// Root hub instance IDs, indexed once: the index becomes the controller
	/// number in location strings. May re-number if controllers change.
	fn root_hub_index(id: &str) -> Option<usize>
	{
		static ROOTS: OnceLock<Vec<String>> = OnceLock::new();
		static WARNED: AtomicUsize = AtomicUsize::new(0);

		let roots = ROOTS.get_or_init(|| {
			let mut roots = Vec::new();
			if let Ok(set) = unsafe {
				SetupDiGetClassDevsW(
					Some(&GUID_DEVINTERFACE_USB_DEVICE),
					None,
					None,
					DIGCF_PRESENT | DIGCF_DEVICEINTERFACE,
				)
			} {
				let mut index = 0u32;
				loop {
					let mut info = SP_DEVINFO_DATA {
						cbSize: std::mem::size_of::<SP_DEVINFO_DATA>() as u32,
						..Default::default()
					};
					if unsafe { SetupDiEnumDeviceInfo(set, index, &mut info) }.is_err() {
						break;
					}
					index += 1;

					if let Some(id) = instance_id_from_devinst(info.DevInst) {
						if id.contains("ROOT_HUB") {
							roots.push(id);
						}
					}
				}
				unsafe {
					let _ = SetupDiDestroyDeviceInfoList(set);
				}
			}
			roots
		});

		let index = roots.iter().position(|root| root == id);
		if index.is_none() && WARNED.fetch_add(1, Ordering::Relaxed) == 0 {
			warn!("Cannot resolve root hub for '{}'", id);
		}
		index
	}

	/// Build `usb-<controller>-<port>...` by walking to the root hub. Each hop
	/// prefers the LOCATION_INFORMATION "Port_#NNNN" string; when absent (XP-era
	/// stacks, or when LIBHS_WIN32_FORCE_XP_LOCATION_CODE is set) the parent hub
	/// is asked which of its ports carries our driver key.
	fn resolve_location(devinst: u32) -> Option<String>
	{
		let force_ioctl = std::env::var_os("LIBHS_WIN32_FORCE_XP_LOCATION_CODE").is_some();

		let mut ports: Vec<u32> = Vec::new();
		let mut node = devinst;

		loop {
			let id = instance_id_from_devinst(node)?;
			if id.contains("ROOT_HUB") {
				let controller = root_hub_index(&id)?;
				let mut location = format!("usb-{}", controller + 1);
				for port in ports.iter().rev() {
					location.push_str(&format!("-{}", port));
				}
				return Some(location);
			}

			let port = if force_ioctl {
				None
			} else {
				registry_property(node, CM_DRP_LOCATION_INFORMATION)
					.and_then(|info| parse_port_location(&info))
			};
			let port = match port {
				Some(port) => port,
				None => port_from_hub_ioctl(node)?,
			};
			ports.push(port);

			let mut parent = 0u32;
			if unsafe { CM_Get_Parent(&mut parent, node, 0) } != CR_SUCCESS {
				return None;
			}
			node = parent;
		}
	}

	fn parse_port_location(info: &str) -> Option<u32>
	{
		// "Port_#0002.Hub_#0003"
		info.strip_prefix("Port_#")?
			.chars()
			.take_while(|c| c.is_ascii_digit())
			.collect::<String>()
			.parse()
			.ok()
	}

	/// Ask the parent hub which downstream port has our driver key bound.
	fn port_from_hub_ioctl(devinst: u32) -> Option<u32>
	{
		let driver_key = registry_property(devinst, CM_DRP_DRIVER)?;

		let mut parent = 0u32;
		if unsafe { CM_Get_Parent(&mut parent, devinst, 0) } != CR_SUCCESS {
			return None;
		}
		let hub = open_device_handle(parent)?;

		// Hubs report the downstream port count in their node information
		let mut node_info = USB_NODE_INFORMATION::default();
		let mut returned = 0u32;
		let ok = unsafe {
			DeviceIoControl(
				hub.0,
				IOCTL_USB_GET_NODE_INFORMATION,
				Some(&node_info as *const _ as *const c_void),
				std::mem::size_of::<USB_NODE_INFORMATION>() as u32,
				Some(&mut node_info as *mut _ as *mut c_void),
				std::mem::size_of::<USB_NODE_INFORMATION>() as u32,
				Some(&mut returned),
				None,
			)
		};
		if ok.is_err() {
			return None;
		}
		let port_count =
			unsafe { node_info.u.HubInformation.HubDescriptor.bNumberOfPorts } as u32;

		for port in 1..=port_count {
			if let Some(key) = connection_driver_key(hub.0, port) {
				if key.eq_ignore_ascii_case(&driver_key) {
					return Some(port);
				}
			}
		}

		None
	}

	fn connection_driver_key(hub: HANDLE, port: u32) -> Option<String>
	{
		#[repr(C)]
		struct DriverKeyName
		{
			connection_index: u32,
			actual_length: u32,
			name: [u16; 256],
		}

		let mut req = DriverKeyName {
			connection_index: port,
			actual_length: 0,
			name: [0; 256],
		};
		let mut returned = 0u32;
		let ok = unsafe {
			DeviceIoControl(
				hub,
				IOCTL_USB_GET_NODE_CONNECTION_DRIVERKEY_NAME,
				Some(&req as *const _ as *const c_void),
				std::mem::size_of::<DriverKeyName>() as u32,
				Some(&mut req as *mut _ as *mut c_void),
				std::mem::size_of::<DriverKeyName>() as u32,
				Some(&mut returned),
				None,
			)
		};
		if ok.is_err() {
			return None;
		}

		let len = req.name.iter().position(|&c| c == 0).unwrap_or(req.name.len());
		Some(String::from_utf16_lossy(&req.name[..len]))
	}

	struct OwnedHandle(pub HANDLE);

	impl Drop for OwnedHandle
	{
		fn drop(&mut self)
		{
			unsafe {
				let _ = CloseHandle(self.0);
			}
		}
	}

	fn open_device_handle(devinst: u32) -> Option<OwnedHandle>
	{
		let id = instance_id_from_devinst(devinst)?;
		let path = format!("\\\\?\\{}#{{{:?}}}", id.replace('\\', "#"), GUID_DEVINTERFACE_USB_HUB);
		let wide: Vec<u16> = path.encode_utf16().chain(std::iter::once(0)).collect();

		let handle = unsafe {
			CreateFileW(
				PCWSTR(wide.as_ptr()),
				0,
				FILE_SHARE_READ | FILE_SHARE_WRITE,
				None,
				OPEN_EXISTING,
				FILE_FLAGS_AND_ATTRIBUTES(0),
				None,
			)
		}
		.ok()?;

		Some(OwnedHandle(handle))
	}

	/// VID/PID/bcdDevice and the string descriptors, read through the parent hub
	/// with IOCTL_USB_GET_NODE_CONNECTION_INFORMATION_EX.
	fn read_usb_properties(usb_devinst: u32, dev: &mut Device) -> Result<bool>
	{
		// The port number on the parent hub also indexes the connection info
		let Some(port) = registry_property(usb_devinst, CM_DRP_ADDRESS)
			.and_then(|addr| addr.parse::<u32>().ok())
			.or_else(|| {
				registry_property(usb_devinst, CM_DRP_LOCATION_INFORMATION)
					.and_then(|info| parse_port_location(&info))
			})
		else {
			return Ok(false);
		};

		let mut parent = 0u32;
		if unsafe { CM_Get_Parent(&mut parent, usb_devinst, 0) } != CR_SUCCESS {
			return Ok(false);
		}
		let Some(hub) = open_device_handle(parent) else {
			return Ok(false);
		};

		let mut info = USB_NODE_CONNECTION_INFORMATION_EX {
			ConnectionIndex: port,
			..Default::default()
		};
		let mut returned = 0u32;
		let ok = unsafe {
			DeviceIoControl(
				hub.0,
				IOCTL_USB_GET_NODE_CONNECTION_INFORMATION_EX,
				Some(&info as *const _ as *const c_void),
				std::mem::size_of::<USB_NODE_CONNECTION_INFORMATION_EX>() as u32,
				Some(&mut info as *mut _ as *mut c_void),
				std::mem::size_of::<USB_NODE_CONNECTION_INFORMATION_EX>() as u32,
				Some(&mut returned),
				None,
			)
		};
		if ok.is_err() {
			return Ok(false);
		}

		dev.vid = info.DeviceDescriptor.idVendor;
		dev.pid = info.DeviceDescriptor.idProduct;
		dev.bcd_device = info.DeviceDescriptor.bcdDevice;

		dev.manufacturer = read_string_descriptor(hub.0, port, info.DeviceDescriptor.iManufacturer);
		dev.product = read_string_descriptor(hub.0, port, info.DeviceDescriptor.iProduct);
		dev.serial_number = read_string_descriptor(hub.0, port, info.DeviceDescriptor.iSerialNumber);

		Ok(true)
	}

	fn read_string_descriptor(hub: HANDLE, port: u32, index: u8) -> Option<String>
	{
		if index == 0 {
			return None;
		}

		const BUF_LEN: usize = 256;
		#[repr(C)]
		struct StringDescriptorRequest
		{
			setup: USB_DESCRIPTOR_REQUEST,
			data: [u8; BUF_LEN],
		}

		let mut req: StringDescriptorRequest = unsafe { std::mem::zeroed() };
		req.setup.ConnectionIndex = port;
		req.setup.SetupPacket.wValue = ((USB_STRING_DESCRIPTOR_TYPE as u16) << 8) | index as u16;
		req.setup.SetupPacket.wIndex = 0x0409; // English (US)
		req.setup.SetupPacket.wLength = BUF_LEN as u16;

		let mut returned = 0u32;
		let ok = unsafe {
			DeviceIoControl(
				hub,
				IOCTL_USB_GET_DESCRIPTOR_FROM_NODE_CONNECTION,
				Some(&req as *const _ as *const c_void),
				std::mem::size_of::<StringDescriptorRequest>() as u32,
				Some(&mut req as *mut _ as *mut c_void),
				std::mem::size_of::<StringDescriptorRequest>() as u32,
				Some(&mut returned),
				None,
			)
		};
		if ok.is_err() {
			return None;
		}

		// data[0] = bLength, data[1] = bDescriptorType, then UTF-16LE code units
		let blen = req.data[0] as usize;
		if blen < 2 || req.data[1] != USB_STRING_DESCRIPTOR_TYPE as u8 {
			return None;
		}
		let units: Vec<u16> = req.data[2..blen]
			.chunks_exact(2)
			.map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
			.collect();
		let s = String::from_utf16_lossy(&units);
		(!s.is_empty()).then_some(s)
	}

	/// HID usage and report sizes through the class driver.
	fn read_hid_properties(dev: &mut Device)
	{
		let wide: Vec<u16> = dev.path.encode_utf16().chain(std::iter::once(0)).collect();
		let handle = unsafe {
			CreateFileW(
				PCWSTR(wide.as_ptr()),
				0,
				FILE_SHARE_READ | FILE_SHARE_WRITE,
				None,
				OPEN_EXISTING,
				FILE_FLAGS_AND_ATTRIBUTES(0),
				None,
			)
		};
		let Ok(handle) = handle else {
			debug!("Cannot open HID device '{}' for capabilities", dev.path);
			return;
		};
		let handle = OwnedHandle(handle);

		unsafe {
			let mut preparsed = PHIDP_PREPARSED_DATA::default();
			if !HidD_GetPreparsedData(handle.0, &mut preparsed).as_bool() {
				return;
			}

			let mut caps = HIDP_CAPS::default();
			if HidP_GetCaps(preparsed, &mut caps).is_ok() {
				dev.hid.usage_page = caps.UsagePage;
				dev.hid.usage = caps.Usage;
				dev.hid.max_input_len = caps.InputReportByteLength.saturating_sub(1) as usize;
				// The HID class driver always frames reports with an ID byte,
				// so numbered behaviour is uniform on Windows
				dev.hid.numbered_reports = true;
			}

			let _ = HidD_FreePreparsedData(preparsed);
		}
	}
}
