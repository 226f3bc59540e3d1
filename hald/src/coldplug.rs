// SPDX-License-Identifier: GPL-2.0

//! Coldplug walker: reconstructs the device graph from sysfs at startup

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::DaemonConfig;
use crate::hotplug::{HotplugAction, HotplugEvent, SysfsClass, SysfsEvent};
use crate::sysfs;

fn sorted_entries(dir: &Path) -> Vec<PathBuf> {
	let mut entries = Vec::new();
	if let Ok(read) = fs::read_dir(dir) {
		for entry in read.flatten() {
			entries.push(entry.path());
		}
	}
	entries.sort();
	entries
}

/// Map sysfs device path -> subsystem, from the /sys/bus/*/devices/*
/// symlink farm.
fn build_bus_map(sysfs_root: &Path) -> HashMap<String, String> {
	let mut map = HashMap::new();
	for bus_dir in sorted_entries(&sysfs_root.join("bus")) {
		let bus_name = match bus_dir.file_name() {
			Some(n) => n.to_string_lossy().into_owned(),
			None => continue,
		};
		for link in sorted_entries(&bus_dir.join("devices")) {
			if let Ok(target) = fs::canonicalize(&link) {
				map.insert(target.to_string_lossy().into_owned(), bus_name.clone());
			}
		}
	}
	map
}

/// Class devices: either symlinks terminating inside the device tree
/// (new layout) or directories with a `device` back-link (old layout).
/// Directories with no back-link at all are orphans.
struct ClassMaps {
	/// device-tree path -> subsystem (new layout, the node is the device)
	direct: HashMap<String, String>,
	/// device-tree path -> class devices hanging off it (old layout)
	attached: HashMap<String, Vec<(String, String)>>,
	/// class devices with no physical device at all
	orphans: Vec<(String, String)>,
}

fn build_class_maps(sysfs_root: &Path) -> ClassMaps {
	let mut maps = ClassMaps {
		direct: HashMap::new(),
		attached: HashMap::new(),
		orphans: Vec::new(),
	};

	for class_dir in sorted_entries(&sysfs_root.join("class")) {
		let class_name = match class_dir.file_name() {
			Some(n) => n.to_string_lossy().into_owned(),
			None => continue,
		};
		for entry in sorted_entries(&class_dir) {
			let entry_str = entry.to_string_lossy().into_owned();
			let is_symlink = fs::symlink_metadata(&entry)
				.map(|m| m.file_type().is_symlink())
				.unwrap_or(false);
			if is_symlink {
				if let Ok(target) = fs::canonicalize(&entry) {
					maps.direct
						.insert(target.to_string_lossy().into_owned(), class_name.clone());
				}
				continue;
			}
			if !entry.is_dir() {
				continue;
			}
			match fs::canonicalize(entry.join("device")) {
				Ok(target) => {
					maps.attached
						.entry(target.to_string_lossy().into_owned())
						.or_default()
						.push((entry_str, class_name.clone()));
				}
				Err(_) => {
					maps.orphans.push((entry_str, class_name.clone()));
				}
			}
		}
	}

	maps
}

fn synthetic_device_file(config: &DaemonConfig, sysfs_path: &str, subsystem: &str) -> Option<String> {
	// only nodes with a dev number get a device file
	sysfs::read_attr(sysfs_path, "dev")?;
	let name = sysfs::last_element(sysfs_path);
	let file = if subsystem == "input" {
		config.dev_root.join("input").join(name)
	} else {
		config.dev_root.join(name)
	};
	Some(file.to_string_lossy().into_owned())
}

fn make_add_event(
	config: &DaemonConfig,
	sysfs_path: &str,
	subsystem: &str,
	class: SysfsClass,
) -> HotplugEvent {
	let mut ev = SysfsEvent::new(subsystem, sysfs_path);
	ev.class = class;
	ev.device_file = synthetic_device_file(config, sysfs_path, subsystem);
	HotplugEvent::new_sysfs(HotplugAction::Add, ev)
}

/// Depth-first pre-order walk of /sys/devices, emitting an event for each
/// node known to the bus or class maps so parents always precede children.
fn visit_device(
	config: &DaemonConfig,
	path: &Path,
	bus_map: &HashMap<String, String>,
	class_maps: &ClassMaps,
	out: &mut Vec<HotplugEvent>,
) {
	let path_str = path.to_string_lossy().into_owned();

	if let Some(subsystem) = bus_map.get(&path_str) {
		out.push(make_add_event(config, &path_str, subsystem, SysfsClass::Device));
	} else if let Some(class_name) = class_maps.direct.get(&path_str) {
		out.push(make_add_event(config, &path_str, class_name, SysfsClass::Device));
	}

	if let Some(attached) = class_maps.attached.get(&path_str) {
		for (classdev_path, class_name) in attached {
			out.push(make_add_event(config, classdev_path, class_name, SysfsClass::Device));
		}
	}

	for child in sorted_entries(path) {
		let is_dir = fs::symlink_metadata(&child)
			.map(|m| m.file_type().is_dir())
			.unwrap_or(false);
		if is_dir {
			visit_device(config, &child, bus_map, class_maps, out);
		}
	}
}

fn block_events_for_disk(config: &DaemonConfig, disk: &Path, out: &mut Vec<HotplugEvent>) {
	let disk_str = disk.to_string_lossy().into_owned();
	out.push(make_add_event(config, &disk_str, "block", SysfsClass::Block));

	for child in sorted_entries(disk) {
		if child.is_dir() && child.join("dev").is_file() {
			let child_str = child.to_string_lossy().into_owned();
			out.push(make_add_event(config, &child_str, "block", SysfsClass::Block));
		}
	}
}

/// Synthesize the startup event burst in dependency-friendly order:
/// devices first (pre-order), then orphan class devices, then block
/// devices with device-mapper nodes deferred to the very end.
pub fn synthesize_events(config: &DaemonConfig) -> Vec<HotplugEvent> {
	let sysfs_root = config.sysfs_root.clone();
	let bus_map = build_bus_map(&sysfs_root);
	let class_maps = build_class_maps(&sysfs_root);

	let mut events = Vec::new();
	visit_device(config, &sysfs_root.join("devices"), &bus_map, &class_maps, &mut events);

	for (path, class_name) in &class_maps.orphans {
		events.push(make_add_event(config, path, class_name, SysfsClass::Device));
	}

	let mut dm_disks = Vec::new();
	for disk in sorted_entries(&sysfs_root.join("block")) {
		if !disk.is_dir() {
			continue;
		}
		let disk_str = disk.to_string_lossy();
		let name = sysfs::last_element(&disk_str);
		if name.starts_with("dm-") {
			dm_disks.push(disk);
			continue;
		}
		block_events_for_disk(config, &disk, &mut events);
	}
	for disk in dm_disks {
		block_events_for_disk(config, &disk, &mut events);
	}

	crate::info!("coldplug synthesized {} events", events.len());
	events
}
