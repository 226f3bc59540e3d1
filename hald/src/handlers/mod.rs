// SPDX-License-Identifier: GPL-2.0

//! Per-subsystem handlers turning hotplug events into device objects

pub mod block;
pub mod bus;
pub mod class;

use crate::device::{Device, UDI_COMPUTER};
use crate::hotplug::{SysfsClass, SysfsEvent};
use crate::store::DeviceStore;
use crate::sysfs;

/// Stored in linux.hotplug_type for ordinary devices
pub const HOTPLUG_TYPE_DEVICE: i64 = 1;
/// Stored in linux.hotplug_type for block devices
pub const HOTPLUG_TYPE_BLOCK: i64 = 2;
/// Stored in linux.hotplug_type for firmware-backed devices
pub const HOTPLUG_TYPE_FIRMWARE: i64 = 3;

/// Subsystems whose devices hang directly off the synthetic root when no
/// sysfs ancestor is known.
pub const ROOT_CLASS_SUBSYSTEMS: &[&str] = &[
	"pci",
	"platform",
	"pnp",
	"xen",
	"ccw",
	"ccwgroup",
	"iucv",
	"pseudo",
	"backlight",
];

/// The closed set of subsystem handlers.
///
/// Each variant implements the same five operations; the set is fixed at
/// build time, no open registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
	Pci,
	Usb,
	Ide,
	Pnp,
	Platform,
	Serio,
	Scsi,
	ScsiHost,
	ScsiGeneric,
	Mmc,
	MmcHost,
	Ieee1394,
	Xen,
	Pseudo,
	Backlight,
	Input,
	Bluetooth,
	Net,
	Sound,
	Serial,
	Video4linux,
	Tape,
}

impl Handler {
	/// Handler for a subsystem string, if one exists.
	pub fn for_subsystem(subsystem: &str) -> Option<Handler> {
		match subsystem {
			"pci" => Some(Handler::Pci),
			"usb" | "usb_device" => Some(Handler::Usb),
			"ide" => Some(Handler::Ide),
			"pnp" => Some(Handler::Pnp),
			"platform" => Some(Handler::Platform),
			"serio" => Some(Handler::Serio),
			"scsi" => Some(Handler::Scsi),
			"scsi_host" => Some(Handler::ScsiHost),
			"scsi_generic" => Some(Handler::ScsiGeneric),
			"mmc" => Some(Handler::Mmc),
			"mmc_host" => Some(Handler::MmcHost),
			"ieee1394" => Some(Handler::Ieee1394),
			"xen" => Some(Handler::Xen),
			"pseudo" => Some(Handler::Pseudo),
			"backlight" => Some(Handler::Backlight),
			"input" => Some(Handler::Input),
			"bluetooth" => Some(Handler::Bluetooth),
			"net" => Some(Handler::Net),
			"sound" => Some(Handler::Sound),
			"tty" | "serial" => Some(Handler::Serial),
			"video4linux" => Some(Handler::Video4linux),
			"tape" => Some(Handler::Tape),
			_ => None,
		}
	}

	pub fn subsystem(&self) -> &'static str {
		match self {
			Handler::Pci => "pci",
			Handler::Usb => "usb",
			Handler::Ide => "ide",
			Handler::Pnp => "pnp",
			Handler::Platform => "platform",
			Handler::Serio => "serio",
			Handler::Scsi => "scsi",
			Handler::ScsiHost => "scsi_host",
			Handler::ScsiGeneric => "scsi_generic",
			Handler::Mmc => "mmc",
			Handler::MmcHost => "mmc_host",
			Handler::Ieee1394 => "ieee1394",
			Handler::Xen => "xen",
			Handler::Pseudo => "pseudo",
			Handler::Backlight => "backlight",
			Handler::Input => "input",
			Handler::Bluetooth => "bluetooth",
			Handler::Net => "net",
			Handler::Sound => "sound",
			Handler::Serial => "serial",
			Handler::Video4linux => "video4linux",
			Handler::Tape => "tape",
		}
	}

	/// Construct a bare device for an add event. None means the event is
	/// not interesting and should be dropped.
	pub fn add(
		&self,
		sysfs_path: &str,
		device_file: Option<&str>,
		parent: Option<&Device>,
		parent_path: Option<&str>,
	) -> Option<Device> {
		match self {
			Handler::Pci => bus::pci_add(sysfs_path, parent),
			Handler::Usb => bus::usb_add(sysfs_path, parent),
			Handler::Ide => bus::ide_add(sysfs_path, parent),
			Handler::Pnp => bus::pnp_add(sysfs_path, parent),
			Handler::Platform => bus::platform_add(sysfs_path, parent),
			Handler::Serio => bus::serio_add(sysfs_path, parent),
			Handler::Scsi => bus::scsi_add(sysfs_path, parent),
			Handler::ScsiHost => bus::scsi_host_add(sysfs_path, parent),
			Handler::ScsiGeneric => bus::scsi_generic_add(sysfs_path, device_file, parent),
			Handler::Mmc => bus::mmc_add(sysfs_path, parent),
			Handler::MmcHost => bus::mmc_host_add(sysfs_path, parent),
			Handler::Ieee1394 => bus::ieee1394_add(sysfs_path, parent),
			Handler::Xen => bus::xen_add(sysfs_path, parent),
			Handler::Pseudo => bus::pseudo_add(sysfs_path, parent),
			Handler::Backlight => bus::backlight_add(sysfs_path, parent),
			Handler::Input => class::input_add(sysfs_path, device_file, parent),
			Handler::Bluetooth => class::bluetooth_add(sysfs_path, parent),
			Handler::Net => class::net_add(sysfs_path, parent, parent_path),
			Handler::Sound => class::sound_add(sysfs_path, device_file, parent),
			Handler::Serial => class::serial_add(sysfs_path, device_file, parent),
			Handler::Video4linux => class::video4linux_add(sysfs_path, device_file, parent),
			Handler::Tape => class::tape_add(sysfs_path, device_file, parent),
		}
	}

	/// Name of the probe helper to run, if this device needs probing.
	pub fn get_prober(&self, d: &Device) -> Option<&'static str> {
		match self {
			Handler::Input => class::input_get_prober(d),
			Handler::Serial => class::serial_get_prober(d),
			_ => None,
		}
	}

	/// Post-probe fixups. Returning false destroys the draft.
	pub fn post_probing(&self, _d: &mut Device) -> bool {
		true
	}

	/// Deterministic identity candidate from the device's properties.
	pub fn compute_udi(&self, d: &Device) -> String {
		match self {
			Handler::Pci => bus::pci_compute_udi(d),
			Handler::Usb => bus::usb_compute_udi(d),
			Handler::Ide => bus::ide_compute_udi(d),
			Handler::Pnp => bus::pnp_compute_udi(d),
			Handler::Platform => bus::platform_compute_udi(d),
			Handler::Serio => bus::serio_compute_udi(d),
			Handler::Scsi => bus::scsi_compute_udi(d),
			Handler::ScsiHost => bus::scsi_host_compute_udi(d),
			Handler::ScsiGeneric => bus::scsi_generic_compute_udi(d),
			Handler::Mmc => bus::mmc_compute_udi(d),
			Handler::MmcHost => bus::mmc_host_compute_udi(d),
			Handler::Ieee1394 => bus::ieee1394_compute_udi(d),
			Handler::Xen => bus::xen_compute_udi(d),
			Handler::Pseudo => bus::pseudo_compute_udi(d),
			Handler::Backlight => bus::backlight_compute_udi(d),
			Handler::Input => class::input_compute_udi(d),
			Handler::Bluetooth => class::bluetooth_compute_udi(d),
			Handler::Net => class::net_compute_udi(d),
			Handler::Sound => class::sound_compute_udi(d),
			Handler::Serial => class::serial_compute_udi(d),
			Handler::Video4linux => class::video4linux_compute_udi(d),
			Handler::Tape => class::tape_compute_udi(d),
		}
	}

	/// Per-subsystem teardown before the device leaves the store.
	pub fn remove(&self, _d: &Device) {}

	/// Re-read volatile attributes of an already-known device in place.
	pub fn refresh(&self, store: &mut DeviceStore, udi: &str) {
		let sysfs_path = match store.find(udi) {
			Some(d) => d.string_or_empty("linux.sysfs_path").to_string(),
			None => return,
		};
		match self {
			Handler::Net => class::net_refresh(store, udi, &sysfs_path),
			Handler::Backlight => bus::backlight_refresh(store, udi, &sysfs_path),
			_ => {
				// re-resolve the bound driver, manual bind/unbind sends no event
				if let Some(driver) = sysfs::driver_name(&sysfs_path) {
					let _ = store.set_string(udi, "info.linux.driver", &driver);
				}
			}
		}
	}
}

/// Identity for the naming fallback "Unknown (0x%04x)".
pub fn unknown_hex_name(id: i64) -> String {
	format!("Unknown (0x{:04x})", id)
}

/// Identity for the naming fallback "Unknown (%d)".
pub fn unknown_dec_name(id: i64) -> String {
	format!("Unknown ({})", id)
}

/// Ascend the sysfs path until a device known to the GDL is found.
///
/// Returns the parent device UDI and the sysfs path it was found at. For
/// root-class subsystems the synthetic root stands in when the walk tops
/// out; everyone else fails with no parent.
pub fn find_known_parent<'a>(
	gdl: &'a DeviceStore,
	sysfs_path: &str,
) -> Option<(&'a Device, String)> {
	let mut path = sysfs_path.to_string();
	while let Some(parent_path) = sysfs::path_ascend(&path) {
		let parent_path = parent_path.to_string();
		if let Some(d) = gdl.match_first("linux.sysfs_path", &parent_path) {
			return Some((d, parent_path));
		}
		path = parent_path;
	}
	None
}

/// Classify a sysfs event as a device or a block event, using the
/// `subsystem` link, the block tree prefix, and the stored type of an
/// already-known device at the same path.
pub fn refine_class(gdl: &DeviceStore, sysfs_block_root: &str, event: &mut SysfsEvent) {
	if event.class != SysfsClass::Unknown {
		return;
	}

	if event.subsystem == "block" {
		event.class = SysfsClass::Block;
		return;
	}

	if let Some(d) = gdl.match_first("linux.sysfs_path", &event.sysfs_path) {
		match d.get_int("linux.hotplug_type") {
			Ok(t) if t == HOTPLUG_TYPE_BLOCK => {
				event.class = SysfsClass::Block;
				return;
			}
			Ok(t) if t == HOTPLUG_TYPE_DEVICE => {
				event.class = SysfsClass::Device;
				return;
			}
			_ => {}
		}
	}

	if let Some(target) = sysfs::link_target(&event.sysfs_path, "subsystem") {
		if target.to_string_lossy().contains("/block") {
			event.class = SysfsClass::Block;
		} else {
			event.class = SysfsClass::Device;
		}
		return;
	}

	if event.sysfs_path.starts_with(sysfs_block_root) {
		event.class = SysfsClass::Block;
	} else {
		event.class = SysfsClass::Device;
	}
}

/// Parent UDI, or the synthetic root for root-class subsystems.
pub fn parent_udi_or_computer(parent: Option<&Device>) -> String {
	match parent {
		Some(p) => p.udi().to_string(),
		None => UDI_COMPUTER.to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn handler_lookup_covers_scenarios() {
		assert_eq!(Handler::for_subsystem("usb_device"), Some(Handler::Usb));
		assert_eq!(Handler::for_subsystem("input"), Some(Handler::Input));
		assert_eq!(Handler::for_subsystem("mmc"), Some(Handler::Mmc));
		assert_eq!(Handler::for_subsystem("made_up"), None);
	}

	#[test]
	fn root_class_set_matches_policy() {
		for s in ["pci", "platform", "pnp", "xen", "ccw", "ccwgroup", "iucv", "pseudo", "backlight"] {
			assert!(ROOT_CLASS_SUBSYSTEMS.contains(&s));
		}
		assert!(!ROOT_CLASS_SUBSYSTEMS.contains(&"usb"));
	}

	#[test]
	fn find_known_parent_walks_up() {
		let keys = vec!["linux.sysfs_path".to_string()];
		let mut gdl = DeviceStore::new("gdl", &keys);
		let mut root = Device::new();
		root.set_udi("/org/freedesktop/Hal/devices/pci_1");
		root.set_string("linux.sysfs_path", "/sys/devices/pci0000:00/0000:00:1d.0");
		gdl.add(root).unwrap();

		let hit = find_known_parent(&gdl, "/sys/devices/pci0000:00/0000:00:1d.0/usb2/2-1");
		// nearest ancestor wins: usb2 is unknown, the pci bridge is known
		let (d, path) = hit.unwrap();
		assert_eq!(d.udi(), "/org/freedesktop/Hal/devices/pci_1");
		assert_eq!(path, "/sys/devices/pci0000:00/0000:00:1d.0");

		assert!(find_known_parent(&gdl, "/sys/devices/platform/vesafb.0").is_none());
	}

	#[test]
	fn refine_class_prefers_stored_type() {
		let keys = vec!["linux.sysfs_path".to_string()];
		let mut gdl = DeviceStore::new("gdl", &keys);
		let mut d = Device::new();
		d.set_udi("/org/freedesktop/Hal/devices/storage_1");
		d.set_string("linux.sysfs_path", "/sys/block/sda");
		d.set_int("linux.hotplug_type", HOTPLUG_TYPE_BLOCK);
		gdl.add(d).unwrap();

		let mut ev = SysfsEvent::new("unknown", "/sys/block/sda");
		refine_class(&gdl, "/sys/block", &mut ev);
		assert_eq!(ev.class, SysfsClass::Block);

		let mut ev2 = SysfsEvent::new("pci", "/sys/devices/pci0000:00/0000:00:1f.2");
		refine_class(&gdl, "/sys/block", &mut ev2);
		assert_eq!(ev2.class, SysfsClass::Device);
	}
}
