// SPDX-License-Identifier: GPL-2.0

//! Block device handler: storage devices, volumes, and fakevolumes

use crate::device::{Device, UDI_PREFIX};
use crate::hotplug::UeventHints;
use crate::store::DeviceStore;
use crate::sysfs;

/// Synthetic child node name used when a filesystem sits directly on the
/// main block device (no partition table).
pub const FAKEVOLUME_NAME: &str = "fakevolume";

pub fn is_fakevolume(sysfs_path: &str) -> bool {
	sysfs::last_element(sysfs_path) == FAKEVOLUME_NAME
}

pub fn is_device_mapper(sysfs_path: &str) -> bool {
	sysfs::last_element(sysfs_path).starts_with("dm-")
}

/// A block node is a partition if and only if it has no `range` attribute.
/// Device-mapper nodes have one and are not counted as partitions;
/// fakevolumes are synthetic and never partitions.
pub fn is_partition(sysfs_path: &str) -> bool {
	if is_fakevolume(sysfs_path) {
		return false;
	}
	sysfs::get_int_from_file(sysfs_path, "range", 10).is_none()
}

fn set_major_minor(d: &mut Device, sysfs_path: &str) {
	if let Some(dev) = sysfs::read_attr(sysfs_path, "dev") {
		let mut parts = dev.splitn(2, ':');
		let major = parts.next().and_then(|t| t.parse::<i64>().ok());
		let minor = parts.next().and_then(|t| t.parse::<i64>().ok());
		if let (Some(major), Some(minor)) = (major, minor) {
			d.set_int("block.major", major);
			d.set_int("block.minor", minor);
		}
	}
}

fn apply_fs_hints(d: &mut Device, hints: &UeventHints) {
	if let Some(usage) = &hints.fs_usage {
		d.set_string("volume.fsusage", usage);
	}
	if let Some(fstype) = &hints.fs_type {
		d.set_string("volume.fstype", fstype);
	}
	if let Some(version) = &hints.fs_version {
		d.set_string("volume.fsversion", version);
	}
	if let Some(uuid) = &hints.fs_uuid {
		d.set_string("volume.uuid", uuid);
	}
	if let Some(label) = &hints.fs_label {
		d.set_string("volume.label", label);
	}
}

fn volume_add(
	sysfs_path: &str,
	device_file: Option<&str>,
	partition: bool,
	fakevolume: bool,
	parent: &Device,
	hints: &UeventHints,
) -> Option<Device> {
	let mut d = Device::new();
	d.set_string("linux.sysfs_path", sysfs_path);
	d.set_string("info.parent", parent.udi());
	d.set_string("info.subsystem", "block");
	d.set_string("info.category", "volume");
	d.add_capability("volume");
	d.add_capability("block");
	d.set_bool("block.is_volume", true);
	d.set_string("block.storage_device", parent.udi());

	if fakevolume {
		// the synthetic node shares the main device's node and numbers
		if let Ok(f) = parent.get_string("block.device") {
			let f = f.to_string();
			d.set_string("block.device", &f);
		}
		if let Ok(major) = parent.get_int("block.major") {
			d.set_int("block.major", major);
		}
		if let Ok(minor) = parent.get_int("block.minor") {
			d.set_int("block.minor", minor);
		}
		if let Ok(size) = parent.get_uint64("storage.size") {
			d.set_uint64("volume.size", size);
		}
	} else {
		if let Some(f) = device_file {
			d.set_string("block.device", f);
		}
		set_major_minor(&mut d, sysfs_path);
		if let Some(sectors) = sysfs::get_uint64_from_file(sysfs_path, "size", 10) {
			d.set_uint64("volume.size", sectors * 512);
		}
		if let Some(start) = sysfs::get_uint64_from_file(sysfs_path, "start", 10) {
			d.set_uint64("volume.partition.start", start * 512);
		}
	}

	d.set_bool("volume.is_partition", partition);
	d.set_bool("volume.is_disc", parent.string_or_empty("storage.drive_type") == "cdrom");
	d.set_bool("volume.is_mounted", false);
	d.set_bool("volume.is_mounted_read_only", false);

	if partition {
		let number: i64 = sysfs::last_element(sysfs_path)
			.trim_start_matches(|c: char| !c.is_ascii_digit())
			.parse()
			.unwrap_or(0);
		d.set_int("volume.partition.number", number);
	}

	apply_fs_hints(&mut d, hints);

	match d.get_string("volume.fstype") {
		Ok(fstype) => {
			let product = format!("Volume ({})", fstype);
			d.set_string("info.product", &product);
		}
		Err(_) => {
			d.set_string("info.product", "Volume");
		}
	}

	Some(d)
}

fn storage_add(
	sysfs_path: &str,
	device_file: Option<&str>,
	parent: &Device,
	hints: &UeventHints,
) -> Option<Device> {
	let mut d = Device::new();
	d.set_string("linux.sysfs_path", sysfs_path);
	d.set_string("info.parent", parent.udi());
	d.set_string("info.subsystem", "block");
	d.set_string("info.category", "storage");
	d.add_capability("storage");
	d.add_capability("block");
	d.set_bool("block.is_volume", false);

	if let Some(f) = device_file {
		d.set_string("block.device", f);
	}
	set_major_minor(&mut d, sysfs_path);

	if let Some(sectors) = sysfs::get_uint64_from_file(sysfs_path, "size", 10) {
		d.set_uint64("storage.size", sectors * 512);
	}
	if let Some(removable) = sysfs::get_int_from_file(sysfs_path, "removable", 10) {
		d.set_bool("storage.removable", removable != 0);
	}

	let bus = parent.string_or_empty("info.subsystem").to_string();
	d.set_string("storage.bus", &bus);
	d.set_string("storage.originating_device", parent.udi());

	// a SCSI type-5 ancestor or an ide cd drive makes this an optical drive
	let drive_type = if parent.get_int("scsi.type").ok() == Some(5) {
		"cdrom"
	} else {
		"disk"
	};
	d.set_string("storage.drive_type", drive_type);
	if drive_type == "cdrom" {
		d.set_bool("storage.no_partitions_hint", true);
	}

	if let Some(model) = hints.model.clone().or_else(|| {
		parent.get_string("scsi.model").ok().map(|m| m.to_string())
	}) {
		d.set_string("storage.model", &model);
		d.set_string("info.product", &model);
	} else {
		d.set_string("info.product", "Mass Storage Device");
	}
	if let Some(vendor) = hints.vendor.clone().or_else(|| {
		parent.get_string("scsi.vendor").ok().map(|v| v.to_string())
	}) {
		d.set_string("storage.vendor", &vendor);
		d.set_string("info.vendor", &vendor);
	}
	if let Some(serial) = &hints.serial {
		d.set_string("storage.serial", serial);
	}
	if let Some(revision) = &hints.revision {
		d.set_string("storage.firmware_version", revision);
	}

	Some(d)
}

/// Construct a block device draft. Volumes need a parent with storage
/// capability; whole-disk devices need any parent at all.
pub fn blockdev_add(
	sysfs_path: &str,
	device_file: Option<&str>,
	partition: bool,
	parent: &Device,
	hints: &UeventHints,
) -> Option<Device> {
	let fakevolume = is_fakevolume(sysfs_path);
	let device_mapper = is_device_mapper(sysfs_path);

	// a storage device hinting "no partitions" swallows everything but its
	// own fakevolume
	if !fakevolume && partition && parent.bool_or_false("storage.no_partitions_hint") {
		return None;
	}

	if partition || device_mapper || fakevolume {
		volume_add(sysfs_path, device_file, partition, fakevolume, parent, hints)
	} else {
		storage_add(sysfs_path, device_file, parent, hints)
	}
}

/// Volumes with their filesystem already described need no probe; bare
/// storage devices are always probed for media and partition tables.
pub fn blockdev_get_prober(d: &Device) -> Option<&'static str> {
	if d.bool_or_false("block.is_volume") {
		if d.has_property("volume.fstype") || d.has_property("volume.fsusage") {
			None
		} else if is_fakevolume(d.string_or_empty("linux.sysfs_path")) {
			None
		} else {
			Some("hald-probe-volume")
		}
	} else {
		Some("hald-probe-storage")
	}
}

pub fn blockdev_compute_udi(d: &Device) -> String {
	if d.bool_or_false("block.is_volume") {
		if let Ok(uuid) = d.get_string("volume.uuid") {
			return format!("{}/volume_uuid_{}", UDI_PREFIX, uuid);
		}
		if let Ok(label) = d.get_string("volume.label") {
			return format!("{}/volume_label_{}", UDI_PREFIX, label);
		}
		if d.bool_or_false("volume.is_disc") {
			let disc_type = d.string_or_empty("volume.disc.type");
			if !disc_type.is_empty() {
				return format!("{}/volume_disc_{}", UDI_PREFIX, disc_type);
			}
			return format!("{}/volume_disc", UDI_PREFIX);
		}
		format!(
			"{}/volume_part{}_size_{}",
			UDI_PREFIX,
			d.get_int("volume.partition.number").unwrap_or(0),
			d.get_uint64("volume.size").unwrap_or(0)
		)
	} else {
		if let Ok(serial) = d.get_string("storage.serial") {
			return format!("{}/storage_serial_{}", UDI_PREFIX, serial);
		}
		if let Ok(model) = d.get_string("storage.model") {
			return format!("{}/storage_model_{}", UDI_PREFIX, model);
		}
		format!("{}_storage", d.string_or_empty("info.parent"))
	}
}

/// Re-read the attributes that change under us (media size, read-only
/// state).
pub fn blockdev_refresh(store: &mut DeviceStore, udi: &str, sysfs_path: &str) {
	let is_volume = store
		.find(udi)
		.map(|d| d.bool_or_false("block.is_volume"))
		.unwrap_or(false);
	if let Some(sectors) = sysfs::get_uint64_from_file(sysfs_path, "size", 10) {
		let key = if is_volume { "volume.size" } else { "storage.size" };
		let _ = store.set_property(udi, key, crate::device::Property::Uint64(sectors * 512));
	}
	if let Some(ro) = sysfs::get_int_from_file(sysfs_path, "ro", 10) {
		if is_volume {
			let _ = store.set_bool(udi, "volume.read_only", ro != 0);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;
	use std::path::PathBuf;

	fn fixture(tag: &str) -> PathBuf {
		let dir = std::env::temp_dir().join(format!("hald-block-test-{}-{}", tag, std::process::id()));
		let _ = fs::remove_dir_all(&dir);
		fs::create_dir_all(&dir).unwrap();
		dir
	}

	fn scsi_parent() -> Device {
		let mut p = Device::new();
		p.set_udi("/org/freedesktop/Hal/devices/scsi_1_scsi_device_lun0");
		p.set_string("info.subsystem", "scsi");
		p.set_string("scsi.model", "DataTraveler");
		p
	}

	#[test]
	fn whole_disk_becomes_storage() {
		let dir = fixture("disk").join("sdc");
		fs::create_dir_all(&dir).unwrap();
		fs::write(dir.join("range"), "16\n").unwrap();
		fs::write(dir.join("dev"), "8:32\n").unwrap();
		fs::write(dir.join("size"), "15679488\n").unwrap();
		fs::write(dir.join("removable"), "1\n").unwrap();

		let path = dir.to_str().unwrap();
		assert!(!is_partition(path));
		let d = blockdev_add(path, Some("/dev/sdc"), false, &scsi_parent(), &UeventHints::default()).unwrap();
		assert!(d.has_capability("storage"));
		assert!(!d.bool_or_false("block.is_volume"));
		assert_eq!(d.get_int("block.major").unwrap(), 8);
		assert_eq!(d.get_int("block.minor").unwrap(), 32);
		assert!(d.bool_or_false("storage.removable"));
		assert_eq!(d.string_or_empty("storage.model"), "DataTraveler");
		assert_eq!(blockdev_get_prober(&d), Some("hald-probe-storage"));
		assert_eq!(
			blockdev_compute_udi(&d),
			"/org/freedesktop/Hal/devices/storage_model_DataTraveler"
		);
	}

	#[test]
	fn partition_becomes_volume_with_hints() {
		let dir = fixture("part").join("sdc1");
		fs::create_dir_all(&dir).unwrap();
		fs::write(dir.join("dev"), "8:33\n").unwrap();
		fs::write(dir.join("size"), "204800\n").unwrap();

		let mut parent = scsi_parent();
		parent.set_string("storage.drive_type", "disk");

		let mut hints = UeventHints::default();
		hints.fs_usage = Some("filesystem".into());
		hints.fs_type = Some("vfat".into());
		hints.fs_uuid = Some("4E21-0AFB".into());

		let path = dir.to_str().unwrap();
		assert!(is_partition(path));
		let d = blockdev_add(path, Some("/dev/sdc1"), true, &parent, &hints).unwrap();
		assert!(d.bool_or_false("block.is_volume"));
		assert!(d.bool_or_false("volume.is_partition"));
		assert_eq!(d.get_int("volume.partition.number").unwrap(), 1);
		assert_eq!(d.string_or_empty("volume.fstype"), "vfat");
		assert_eq!(d.string_or_empty("info.product"), "Volume (vfat)");
		// hints make probing unnecessary
		assert_eq!(blockdev_get_prober(&d), None);
		// the raw candidate keeps the dash; sanitization happens at identity
		// assignment time
		assert_eq!(
			blockdev_compute_udi(&d),
			"/org/freedesktop/Hal/devices/volume_uuid_4E21-0AFB"
		);
	}

	#[test]
	fn fakevolume_inherits_from_storage_parent() {
		let mut parent = Device::new();
		parent.set_udi("/org/freedesktop/Hal/devices/storage_serial_ABC");
		parent.set_string("info.subsystem", "block");
		parent.set_string("block.device", "/dev/sdc");
		parent.set_int("block.major", 8);
		parent.set_int("block.minor", 32);
		parent.add_capability("storage");

		let mut hints = UeventHints::default();
		hints.fs_type = Some("vfat".into());

		let d = blockdev_add("/sys/block/sdc/fakevolume", None, false, &parent, &hints).unwrap();
		assert!(d.bool_or_false("block.is_volume"));
		assert!(!d.bool_or_false("volume.is_partition"));
		assert_eq!(d.string_or_empty("block.device"), "/dev/sdc");
		assert_eq!(d.string_or_empty("volume.fstype"), "vfat");
		assert_eq!(blockdev_get_prober(&d), None);
	}

	#[test]
	fn volume_udi_fallback_chain() {
		let mut d = Device::new();
		d.set_bool("block.is_volume", true);
		d.set_int("volume.partition.number", 2);
		d.set_uint64("volume.size", 1048576);
		assert_eq!(
			blockdev_compute_udi(&d),
			"/org/freedesktop/Hal/devices/volume_part2_size_1048576"
		);
		d.set_string("volume.label", "BOOT");
		assert_eq!(
			blockdev_compute_udi(&d),
			"/org/freedesktop/Hal/devices/volume_label_BOOT"
		);
		d.set_string("volume.uuid", "4E21-0AFB");
		assert_eq!(
			blockdev_compute_udi(&d),
			"/org/freedesktop/Hal/devices/volume_uuid_4E21-0AFB"
		);
	}

	#[test]
	fn no_partitions_hint_blocks_real_partitions() {
		let dir = fixture("cdpart").join("sr0p1");
		fs::create_dir_all(&dir).unwrap();
		let mut parent = Device::new();
		parent.set_udi("/cd");
		parent.set_bool("storage.no_partitions_hint", true);
		assert!(blockdev_add(dir.to_str().unwrap(), None, true, &parent, &UeventHints::default()).is_none());
	}
}
