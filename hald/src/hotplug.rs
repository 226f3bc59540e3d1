// SPDX-License-Identifier: GPL-2.0

//! Ordered hotplug event queue with dependency-aware release

use std::collections::VecDeque;

use crate::sysfs;

/// Kernel event action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugAction {
	Add,
	Remove,
	Change,
	Move,
}

impl HotplugAction {
	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"add" => Some(HotplugAction::Add),
			"remove" => Some(HotplugAction::Remove),
			"change" => Some(HotplugAction::Change),
			"move" => Some(HotplugAction::Move),
			_ => None,
		}
	}
}

/// Pre-parsed optional fields carried by the udev relay
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UeventHints {
	pub vendor: Option<String>,
	pub model: Option<String>,
	pub revision: Option<String>,
	pub serial: Option<String>,
	pub fs_usage: Option<String>,
	pub fs_type: Option<String>,
	pub fs_version: Option<String>,
	pub fs_uuid: Option<String>,
	pub fs_label: Option<String>,
}

/// Refined sysfs event class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysfsClass {
	/// Not yet classified
	Unknown,
	/// Ordinary device node
	Device,
	/// Block device node
	Block,
}

/// A kernel sysfs event
#[derive(Debug, Clone, PartialEq)]
pub struct SysfsEvent {
	pub subsystem: String,
	pub sysfs_path: String,
	pub device_file: Option<String>,
	pub sysfs_path_old: Option<String>,
	pub seqnum: u64,
	pub net_ifindex: Option<u32>,
	pub class: SysfsClass,
	pub is_dm_device: bool,
	pub hints: UeventHints,
}

impl SysfsEvent {
	pub fn new(subsystem: &str, sysfs_path: &str) -> Self {
		let is_dm = sysfs::last_element(sysfs_path).starts_with("dm-");
		Self {
			subsystem: subsystem.to_string(),
			sysfs_path: sysfs_path.to_string(),
			device_file: None,
			sysfs_path_old: None,
			seqnum: 0,
			net_ifindex: None,
			class: SysfsClass::Unknown,
			is_dm_device: is_dm,
			hints: UeventHints::default(),
		}
	}
}

/// Firmware backend family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareKind {
	Acpi,
	Apm,
	Pmu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonKind {
	Power,
	Sleep,
	Lid,
}

impl ButtonKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			ButtonKind::Power => "power",
			ButtonKind::Sleep => "sleep",
			ButtonKind::Lid => "lid",
		}
	}
}

/// Object kinds surfaced by the firmware backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareObject {
	Battery,
	AcAdapter,
	Button(ButtonKind),
	Fan,
	Processor,
	ThermalZone,
	LaptopPanel,
}

/// A firmware (ACPI/APM/PMU) event over a pseudo-filesystem path
#[derive(Debug, Clone, PartialEq)]
pub struct FirmwareEvent {
	pub backend: FirmwareKind,
	pub object: FirmwareObject,
	pub path: String,
}

/// Event payload variants
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
	Sysfs(SysfsEvent),
	Firmware(FirmwareEvent),
}

/// A queued hotplug event
#[derive(Debug, Clone, PartialEq)]
pub struct HotplugEvent {
	/// Queue-assigned identity, stable across repost
	pub id: u64,
	pub action: HotplugAction,
	/// Set once the event has been pulled back out of in-progress and
	/// re-enqueued; prevents re-queue loops.
	pub reposted: bool,
	pub payload: EventPayload,
}

impl HotplugEvent {
	pub fn new_sysfs(action: HotplugAction, event: SysfsEvent) -> Self {
		Self {
			id: 0,
			action,
			reposted: false,
			payload: EventPayload::Sysfs(event),
		}
	}

	pub fn new_firmware(action: HotplugAction, event: FirmwareEvent) -> Self {
		Self {
			id: 0,
			action,
			reposted: false,
			payload: EventPayload::Firmware(event),
		}
	}

	pub fn sysfs(&self) -> Option<&SysfsEvent> {
		match &self.payload {
			EventPayload::Sysfs(e) => Some(e),
			_ => None,
		}
	}

	pub fn sysfs_mut(&mut self) -> Option<&mut SysfsEvent> {
		match &mut self.payload {
			EventPayload::Sysfs(e) => Some(e),
			_ => None,
		}
	}

	pub fn firmware(&self) -> Option<&FirmwareEvent> {
		match &self.payload {
			EventPayload::Firmware(e) => Some(e),
			_ => None,
		}
	}
}

/// Lexical ancestry test on `/`-separated paths: true when the paths are
/// equal or one names an ancestor of the other.
pub fn paths_overlap(a: &str, b: &str) -> bool {
	if a == b {
		return true;
	}
	if b.len() > a.len() && b.starts_with(a) && b.as_bytes()[a.len()] == b'/' {
		return true;
	}
	if a.len() > b.len() && a.starts_with(b) && a.as_bytes()[b.len()] == b'/' {
		return true;
	}
	false
}

/// True when `earlier` holds back `e`.
fn dominates(earlier: &HotplugEvent, e: &HotplugEvent) -> bool {
	let (le, re) = match (earlier.sysfs(), e.sysfs()) {
		(Some(le), Some(re)) => (le, re),
		// firmware events neither dominate nor are dominated
		_ => return false,
	};

	if paths_overlap(&le.sysfs_path, &re.sysfs_path) {
		return true;
	}
	// a move holds back, and is held back by, events touching its old path
	if let Some(old) = &re.sysfs_path_old {
		if paths_overlap(&le.sysfs_path, old) {
			return true;
		}
	}
	if let Some(old) = &le.sysfs_path_old {
		if paths_overlap(old, &re.sysfs_path) {
			return true;
		}
	}
	// dm devices settle only after their backing block devices
	if re.is_dm_device && le.class == SysfsClass::Block && !le.is_dm_device {
		return true;
	}
	false
}

/// FIFO of pending events plus the set currently being handled.
///
/// Events are released head-first; an event stays queued while any
/// positionally earlier event, or any in-progress event, dominates it.
#[derive(Debug)]
pub struct EventQueue {
	queue: VecDeque<HotplugEvent>,
	in_progress: Vec<HotplugEvent>,
	restart: bool,
	next_id: u64,
}

impl EventQueue {
	pub fn new() -> Self {
		Self {
			queue: VecDeque::new(),
			in_progress: Vec::new(),
			restart: false,
			next_id: 1,
		}
	}

	fn assign_id(&mut self, event: &mut HotplugEvent) {
		if event.id == 0 {
			event.id = self.next_id;
			self.next_id += 1;
		}
	}

	/// Append an event at the tail. Returns its queue identity.
	pub fn enqueue(&mut self, mut event: HotplugEvent) -> u64 {
		self.assign_id(&mut event);
		let id = event.id;
		self.queue.push_back(event);
		id
	}

	/// Prepend an event and signal a scan restart.
	pub fn enqueue_at_front(&mut self, mut event: HotplugEvent) -> u64 {
		self.assign_id(&mut event);
		let id = event.id;
		self.queue.push_front(event);
		self.restart = true;
		id
	}

	pub fn queue_len(&self) -> usize {
		self.queue.len()
	}

	pub fn in_progress_len(&self) -> usize {
		self.in_progress.len()
	}

	pub fn is_idle(&self) -> bool {
		self.queue.is_empty() && self.in_progress.is_empty()
	}

	pub fn peek(&self, pos: usize) -> Option<&HotplugEvent> {
		self.queue.get(pos)
	}

	/// True when nothing ahead of, or concurrent with, position `pos`
	/// dominates the event there.
	pub fn is_releasable_at(&self, pos: usize) -> bool {
		let e = match self.queue.get(pos) {
			Some(e) => e,
			None => return false,
		};
		for earlier in self.queue.iter().take(pos) {
			if dominates(earlier, e) {
				return false;
			}
		}
		for running in &self.in_progress {
			if dominates(running, e) {
				return false;
			}
			// an in-flight add vs. a queued remove (or the converse) on the
			// same path must never reorder
			if let (Some(r), Some(q)) = (running.sysfs(), e.sysfs()) {
				if r.sysfs_path == q.sysfs_path && running.action != e.action {
					return false;
				}
			}
		}
		true
	}

	/// Move the event at `pos` from the queue to in-progress and return a
	/// working copy for dispatch.
	pub fn start_at(&mut self, pos: usize) -> Option<HotplugEvent> {
		let event = self.queue.remove(pos)?;
		self.in_progress.push(event.clone());
		Some(event)
	}

	/// Remove a finished event from in-progress; signals a scan restart
	/// since held-back events may be runnable now.
	pub fn end_event(&mut self, id: u64) -> Option<HotplugEvent> {
		let pos = self.in_progress.iter().position(|e| e.id == id)?;
		let event = self.in_progress.remove(pos);
		self.restart = true;
		Some(event)
	}

	/// Pull an in-progress event back to the front of the queue, marked
	/// reposted, without ending it. The caller then front-enqueues any
	/// synthetic events that must run first.
	pub fn repost_at_front(&mut self, id: u64) -> bool {
		let pos = match self.in_progress.iter().position(|e| e.id == id) {
			Some(p) => p,
			None => return false,
		};
		let mut event = self.in_progress.remove(pos);
		event.reposted = true;
		self.queue.push_front(event);
		self.restart = true;
		true
	}

	pub fn find_in_progress(&self, id: u64) -> Option<&HotplugEvent> {
		self.in_progress.iter().find(|e| e.id == id)
	}

	/// Consume the restart flag.
	pub fn take_restart(&mut self) -> bool {
		let r = self.restart;
		self.restart = false;
		r
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sysfs_event(action: HotplugAction, subsystem: &str, path: &str) -> HotplugEvent {
		HotplugEvent::new_sysfs(action, SysfsEvent::new(subsystem, path))
	}

	fn block_event(action: HotplugAction, path: &str) -> HotplugEvent {
		let mut ev = SysfsEvent::new("block", path);
		ev.class = SysfsClass::Block;
		HotplugEvent::new_sysfs(action, ev)
	}

	#[test]
	fn ancestry_is_component_wise() {
		assert!(paths_overlap("/sys/devices/a", "/sys/devices/a"));
		assert!(paths_overlap("/sys/devices/a", "/sys/devices/a/b"));
		assert!(paths_overlap("/sys/devices/a/b", "/sys/devices/a"));
		assert!(!paths_overlap("/sys/devices/a", "/sys/devices/ab"));
		assert!(!paths_overlap("/sys/devices/ab", "/sys/devices/a"));
	}

	#[test]
	fn child_waits_for_parent_in_queue() {
		let mut q = EventQueue::new();
		q.enqueue(sysfs_event(HotplugAction::Add, "usb", "/sys/devices/usb2/2-1"));
		q.enqueue(sysfs_event(HotplugAction::Add, "usb", "/sys/devices/usb2/2-1/2-1:1.0"));
		assert!(q.is_releasable_at(0));
		assert!(!q.is_releasable_at(1));
	}

	#[test]
	fn descendant_waits_for_in_progress_ancestor() {
		let mut q = EventQueue::new();
		q.enqueue(sysfs_event(HotplugAction::Add, "usb", "/sys/devices/usb2/2-1"));
		q.enqueue(sysfs_event(HotplugAction::Add, "input", "/sys/devices/usb2/2-1/input/input5"));
		q.start_at(0).unwrap();
		assert!(!q.is_releasable_at(0));
		// unrelated path is free to go
		q.enqueue(sysfs_event(HotplugAction::Add, "pci", "/sys/devices/pci0000:00/0000:00:1f.2"));
		assert!(q.is_releasable_at(1));
	}

	#[test]
	fn same_path_different_action_waits_for_running_event() {
		let mut q = EventQueue::new();
		q.enqueue(sysfs_event(HotplugAction::Add, "usb", "/sys/devices/usb2/2-1"));
		let running = q.start_at(0).unwrap();
		q.enqueue(sysfs_event(HotplugAction::Remove, "usb", "/sys/devices/usb2/2-1"));
		assert!(!q.is_releasable_at(0));
		q.end_event(running.id);
		assert!(q.is_releasable_at(0));
	}

	#[test]
	fn dm_device_waits_for_plain_block_devices() {
		let mut q = EventQueue::new();
		q.enqueue(block_event(HotplugAction::Add, "/sys/block/sda"));
		let mut dm = SysfsEvent::new("block", "/sys/block/dm-0");
		dm.class = SysfsClass::Block;
		assert!(dm.is_dm_device);
		q.enqueue(HotplugEvent::new_sysfs(HotplugAction::Add, dm));
		assert!(!q.is_releasable_at(1));
		let first = q.start_at(0).unwrap();
		assert!(!q.is_releasable_at(0));
		q.end_event(first.id);
		assert!(q.is_releasable_at(0));
	}

	#[test]
	fn firmware_events_do_not_participate_in_domination() {
		let mut q = EventQueue::new();
		q.enqueue(sysfs_event(HotplugAction::Add, "usb", "/sys/devices/usb2/2-1"));
		q.enqueue(HotplugEvent::new_firmware(
			HotplugAction::Add,
			FirmwareEvent {
				backend: FirmwareKind::Acpi,
				object: FirmwareObject::Battery,
				path: "/proc/acpi/battery/BAT0".into(),
			},
		));
		q.start_at(0).unwrap();
		assert!(q.is_releasable_at(0));
	}

	#[test]
	fn move_holds_events_on_old_path() {
		let mut q = EventQueue::new();
		let mut mv = SysfsEvent::new("net", "/sys/devices/virtual/net/wlan0");
		mv.sysfs_path_old = Some("/sys/devices/virtual/net/eth1".to_string());
		q.enqueue(HotplugEvent::new_sysfs(HotplugAction::Move, mv));
		q.enqueue(sysfs_event(HotplugAction::Change, "net", "/sys/devices/virtual/net/eth1"));
		assert!(q.is_releasable_at(0));
		assert!(!q.is_releasable_at(1));
	}

	#[test]
	fn repost_runs_after_front_enqueued_event() {
		let mut q = EventQueue::new();
		q.enqueue(block_event(HotplugAction::Remove, "/sys/block/sdc"));
		let outer = q.start_at(0).unwrap();

		// handler decides the fakevolume must go first
		assert!(q.repost_at_front(outer.id));
		q.enqueue_at_front(block_event(HotplugAction::Remove, "/sys/block/sdc/fakevolume"));

		assert_eq!(q.in_progress_len(), 0);
		assert!(q.take_restart());
		// the synthetic child event is at the head and releasable
		assert!(q.is_releasable_at(0));
		// the reposted outer event is dominated by its child
		assert!(!q.is_releasable_at(1));
		assert!(q.peek(1).unwrap().reposted);

		let child = q.start_at(0).unwrap();
		assert!(!q.is_releasable_at(0));
		q.end_event(child.id);
		assert!(q.is_releasable_at(0));
	}

	#[test]
	fn idle_after_all_events_end() {
		let mut q = EventQueue::new();
		let id = q.enqueue(sysfs_event(HotplugAction::Add, "usb", "/sys/devices/usb2/2-1"));
		assert!(!q.is_idle());
		q.start_at(0).unwrap();
		assert!(!q.is_idle());
		q.end_event(id);
		assert!(q.is_idle());
	}
}
