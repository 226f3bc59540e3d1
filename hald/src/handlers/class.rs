// SPDX-License-Identifier: GPL-2.0

//! Handlers for class devices (input, net, sound, serial, ...)

use crate::device::{Device, UDI_PREFIX};
use crate::store::DeviceStore;
use crate::sysfs;

use super::parent_udi_or_computer;

/// Parse a sysfs capability bitmask file: whitespace-separated hex words,
/// most significant first, as the input subsystem exports them.
fn read_bitmask(sysfs_path: &str, attr: &str) -> Option<Vec<u64>> {
	let raw = sysfs::read_attr(sysfs_path, attr)?;
	let mut words: Vec<u64> = raw
		.split_whitespace()
		.filter_map(|w| u64::from_str_radix(w, 16).ok())
		.collect();
	if words.is_empty() {
		return None;
	}
	// reverse so index 0 holds bits 0..63
	words.reverse();
	Some(words)
}

fn test_bit(words: &[u64], bit: usize) -> bool {
	words
		.get(bit / 64)
		.map(|w| (w >> (bit % 64)) & 1 == 1)
		.unwrap_or(false)
}

// input event codes used for classification
const KEY_ESC: usize = 1;
const KEY_1: usize = 2;
const KEY_Z: usize = 44;
const REL_X: usize = 0;
const REL_Y: usize = 1;
const ABS_X: usize = 0;
const ABS_Y: usize = 1;
const SW_LID: usize = 0;

fn input_test_key(d: &mut Device, caps_path: &str) {
	let keys = match read_bitmask(caps_path, "capabilities/key") {
		Some(k) => k,
		None => return,
	};
	if keys.iter().any(|w| *w != 0) {
		d.add_capability("input.keys");
	}
	// a keyboard carries the whole first row
	let mut is_keyboard = test_bit(&keys, KEY_ESC);
	for bit in KEY_1..=KEY_Z {
		if !test_bit(&keys, bit) {
			is_keyboard = false;
			break;
		}
	}
	if is_keyboard {
		d.add_capability("input.keyboard");
	}
}

fn input_test_rel(d: &mut Device, caps_path: &str) {
	if let Some(rel) = read_bitmask(caps_path, "capabilities/rel") {
		if test_bit(&rel, REL_X) && test_bit(&rel, REL_Y) {
			d.add_capability("input.mouse");
		}
	}
}

fn input_test_abs(d: &mut Device, caps_path: &str) {
	if d.has_capability("input.mouse") {
		return;
	}
	if let Some(abs) = read_bitmask(caps_path, "capabilities/abs") {
		if test_bit(&abs, ABS_X) && test_bit(&abs, ABS_Y) {
			d.add_capability("input.joystick");
		}
	}
}

fn input_test_switch(d: &mut Device, caps_path: &str) {
	let sw = match read_bitmask(caps_path, "capabilities/sw") {
		Some(s) => s,
		None => return,
	};
	if sw.iter().all(|w| *w == 0) {
		return;
	}
	d.add_capability("input.switch");
	if test_bit(&sw, SW_LID) {
		d.set_string("button.type", "lid");
		d.set_bool("button.has_state", true);
		d.add_capability("button");
	}
}

/// Only evdev nodes are interesting; everything else on the input class is
/// a duplicate view of the same hardware.
pub fn input_add(sysfs_path: &str, device_file: Option<&str>, parent: Option<&Device>) -> Option<Device> {
	let device_file = device_file?;
	let last = sysfs::last_element(sysfs_path);
	if !last.starts_with("event") || last["event".len()..].parse::<u32>().is_err() {
		return None;
	}

	let mut d = Device::new();
	d.set_string("linux.sysfs_path", sysfs_path);
	if let Some(p) = parent {
		d.set_string("input.originating_device", p.udi());
		d.set_string("input.physical_device", p.udi());
	}
	d.set_string("info.parent", &parent_udi_or_computer(parent));
	d.set_string("info.subsystem", "input");
	d.set_string("info.category", "input");
	d.add_capability("input");
	d.set_string("input.device", device_file);

	sysfs::set_string_from_file(&mut d, "info.product", sysfs_path, "../name");
	sysfs::set_string_from_file(&mut d, "input.product", sysfs_path, "../name");

	// the capability bitmasks live on the parent input node
	let caps_path = format!("{}/..", sysfs_path);
	input_test_key(&mut d, &caps_path);
	input_test_rel(&mut d, &caps_path);
	input_test_abs(&mut d, &caps_path);
	input_test_switch(&mut d, &caps_path);

	Some(d)
}

pub fn input_get_prober(d: &Device) -> Option<&'static str> {
	// reading switch state needs privileges the daemon does not keep
	if d.bool_or_false("button.has_state") {
		Some("hald-probe-input")
	} else {
		None
	}
}

pub fn input_compute_udi(d: &Device) -> String {
	format!("{}_logicaldev_input", d.string_or_empty("info.parent"))
}

/*---------------------------------------------------------------------------*/

pub fn bluetooth_add(sysfs_path: &str, parent: Option<&Device>) -> Option<Device> {
	parent?;
	let mut d = Device::new();
	d.set_string("linux.sysfs_path", sysfs_path);
	d.set_string("info.parent", &parent_udi_or_computer(parent));
	d.set_string("info.subsystem", "bluetooth");
	d.set_string("info.category", "bluetooth_hci");
	d.add_capability("bluetooth_hci");
	d.set_string("bluetooth_hci.interface_name", sysfs::last_element(sysfs_path));
	d.set_string("info.product", "Bluetooth Host Controller Interface");
	Some(d)
}

pub fn bluetooth_compute_udi(d: &Device) -> String {
	format!("{}_bluetooth_hci", d.string_or_empty("info.parent"))
}

/*---------------------------------------------------------------------------*/

fn parse_mac(address: &str) -> Option<u64> {
	let mut value: u64 = 0;
	let mut octets = 0;
	for part in address.split(':') {
		let octet = u64::from_str_radix(part, 16).ok()?;
		value = (value << 8) | octet;
		octets += 1;
	}
	if octets == 6 {
		Some(value)
	} else {
		None
	}
}

pub fn net_add(sysfs_path: &str, parent: Option<&Device>, parent_path: Option<&str>) -> Option<Device> {
	let interface = sysfs::last_element(sysfs_path);

	let mut d = Device::new();
	d.set_string("linux.sysfs_path", sysfs_path);
	d.set_string("info.parent", &parent_udi_or_computer(parent));
	d.set_string("info.subsystem", "net");
	d.set_string("info.category", "net");
	d.add_capability("net");
	d.set_string("net.interface", interface);
	d.set_string("info.product", "Networking Interface");
	if let Some(pp) = parent_path {
		d.set_string("net.originating_device", pp);
	}

	sysfs::set_string_from_file(&mut d, "net.address", sysfs_path, "address");
	sysfs::set_int_from_file(&mut d, "net.linux.ifindex", sysfs_path, "ifindex", 10);
	sysfs::set_int_from_file(&mut d, "net.arp_proto_hw_id", sysfs_path, "type", 10);

	if let Some(mac) = d.get_string("net.address").ok().and_then(parse_mac) {
		d.set_uint64("net.mac_address", mac);
	}

	Some(d)
}

pub fn net_compute_udi(d: &Device) -> String {
	match d.get_uint64("net.mac_address") {
		Ok(mac) if mac != 0 => format!("{}/net_{:012x}", UDI_PREFIX, mac),
		_ => {
			// fall back to the originating device when the address is void
			let origin = d.string_or_empty("net.originating_device");
			if origin.is_empty() {
				format!("{}_net", d.string_or_empty("info.parent"))
			} else {
				format!("{}/net_{}", UDI_PREFIX, sysfs::last_element(origin))
			}
		}
	}
}

pub fn net_refresh(store: &mut DeviceStore, udi: &str, sysfs_path: &str) {
	if let Some(address) = sysfs::read_attr(sysfs_path, "address") {
		let _ = store.set_string(udi, "net.address", &address);
		if let Some(mac) = parse_mac(&address) {
			let _ = store.set_property(udi, "net.mac_address", crate::device::Property::Uint64(mac));
		}
	}
	if let Some(ifindex) = sysfs::get_int_from_file(sysfs_path, "ifindex", 10) {
		let _ = store.set_int(udi, "net.linux.ifindex", ifindex);
	}
	// interface may have been renamed under us
	let interface = sysfs::last_element(sysfs_path).to_string();
	let _ = store.set_string(udi, "net.interface", &interface);
}

/*---------------------------------------------------------------------------*/

pub fn sound_add(sysfs_path: &str, device_file: Option<&str>, parent: Option<&Device>) -> Option<Device> {
	parent?;
	let name = sysfs::last_element(sysfs_path).to_string();

	let mut d = Device::new();
	d.set_string("linux.sysfs_path", sysfs_path);
	d.set_string("info.parent", &parent_udi_or_computer(parent));
	d.set_string("info.subsystem", "sound");
	d.set_string("info.category", "sound");
	d.add_capability("sound");
	d.set_string("sound.name", &name);
	if let Some(f) = device_file {
		d.set_string("sound.device", f);
	}

	// cardXdeviceY style names carry the ALSA card number
	if let Some(card) = name
		.trim_start_matches(|c: char| c.is_ascii_alphabetic())
		.split(|c: char| !c.is_ascii_digit())
		.next()
		.and_then(|t| t.parse::<i64>().ok())
	{
		d.set_int("sound.card", card);
	}
	d.set_string("info.product", "Sound Device");

	Some(d)
}

pub fn sound_compute_udi(d: &Device) -> String {
	format!(
		"{}_sound_{}",
		d.string_or_empty("info.parent"),
		d.string_or_empty("sound.name")
	)
}

/*---------------------------------------------------------------------------*/

pub fn serial_add(sysfs_path: &str, device_file: Option<&str>, parent: Option<&Device>) -> Option<Device> {
	let device_file = device_file?;
	let parent = parent?;

	let mut d = Device::new();
	d.set_string("linux.sysfs_path", sysfs_path);
	d.set_string("info.parent", parent.udi());
	d.set_string("info.subsystem", "serial");
	d.set_string("info.category", "serial");
	d.add_capability("serial");
	d.set_string("serial.device", device_file);
	d.set_string("serial.originating_device", parent.udi());

	let last = sysfs::last_element(sysfs_path);
	let port: i64 = last
		.trim_start_matches(|c: char| !c.is_ascii_digit())
		.parse()
		.unwrap_or(0);
	d.set_int("serial.port", port);

	let serial_type = if last.starts_with("ttyUSB") {
		"usb"
	} else if last.starts_with("ttyS") {
		"platform"
	} else {
		"unknown"
	};
	d.set_string("serial.type", serial_type);
	let product = format!("Serial Port ({})", last);
	d.set_string("info.product", &product);

	Some(d)
}

pub fn serial_get_prober(_d: &Device) -> Option<&'static str> {
	Some("hald-probe-serial")
}

pub fn serial_compute_udi(d: &Device) -> String {
	format!(
		"{}_serial_{}_{}",
		d.string_or_empty("info.parent"),
		d.string_or_empty("serial.type"),
		d.get_int("serial.port").unwrap_or(0)
	)
}

/*---------------------------------------------------------------------------*/

pub fn video4linux_add(sysfs_path: &str, device_file: Option<&str>, parent: Option<&Device>) -> Option<Device> {
	let parent = parent?;

	let mut d = Device::new();
	d.set_string("linux.sysfs_path", sysfs_path);
	d.set_string("info.parent", parent.udi());
	d.set_string("info.subsystem", "video4linux");
	d.set_string("info.category", "video4linux");
	d.add_capability("video4linux");
	if let Some(f) = device_file {
		d.set_string("video4linux.device", f);
	}
	sysfs::set_string_from_file(&mut d, "info.product", sysfs_path, "name");
	if !d.has_property("info.product") {
		d.set_string("info.product", "Multimedia Device");
	}
	Some(d)
}

pub fn video4linux_compute_udi(d: &Device) -> String {
	format!("{}_video4linux", d.string_or_empty("info.parent"))
}

/*---------------------------------------------------------------------------*/

pub fn tape_add(sysfs_path: &str, device_file: Option<&str>, parent: Option<&Device>) -> Option<Device> {
	let parent = parent?;

	let mut d = Device::new();
	d.set_string("linux.sysfs_path", sysfs_path);
	d.set_string("info.parent", parent.udi());
	d.set_string("info.subsystem", "tape");
	d.set_string("info.category", "tape");
	d.add_capability("tape");
	if let Some(f) = device_file {
		d.set_string("tape.device", f);
	}
	d.set_string("info.product", "Tape Device");
	Some(d)
}

pub fn tape_compute_udi(d: &Device) -> String {
	format!("{}_tape", d.string_or_empty("info.parent"))
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;
	use std::path::PathBuf;

	fn fixture(tag: &str) -> PathBuf {
		let dir = std::env::temp_dir().join(format!("hald-class-test-{}-{}", tag, std::process::id()));
		let _ = fs::remove_dir_all(&dir);
		fs::create_dir_all(&dir).unwrap();
		dir
	}

	#[test]
	fn input_mouse_classification() {
		let input_dir = fixture("mouse").join("input5");
		let ev_dir = input_dir.join("event5");
		fs::create_dir_all(input_dir.join("capabilities")).unwrap();
		fs::create_dir_all(&ev_dir).unwrap();
		fs::write(input_dir.join("name"), "USB Optical Mouse\n").unwrap();
		// REL_X | REL_Y
		fs::write(input_dir.join("capabilities").join("rel"), "3\n").unwrap();

		let mut parent = Device::new();
		parent.set_udi("/org/freedesktop/Hal/devices/usb_device_46d_c012_ABC_if0");

		let d = input_add(ev_dir.to_str().unwrap(), Some("/dev/input/event5"), Some(&parent)).unwrap();
		assert!(d.has_capability("input"));
		assert!(d.has_capability("input.mouse"));
		assert_eq!(d.string_or_empty("info.product"), "USB Optical Mouse");
		assert_eq!(
			input_compute_udi(&d),
			"/org/freedesktop/Hal/devices/usb_device_46d_c012_ABC_if0_logicaldev_input"
		);
	}

	#[test]
	fn input_rejects_non_evdev_nodes() {
		let dir = fixture("nonev").join("mouse0");
		fs::create_dir_all(&dir).unwrap();
		assert!(input_add(dir.to_str().unwrap(), Some("/dev/input/mouse0"), None).is_none());
		let dir2 = fixture("nodev").join("event3");
		fs::create_dir_all(&dir2).unwrap();
		assert!(input_add(dir2.to_str().unwrap(), None, None).is_none());
	}

	#[test]
	fn lid_switch_sets_button_state() {
		let input_dir = fixture("lid").join("input3");
		let ev_dir = input_dir.join("event3");
		fs::create_dir_all(input_dir.join("capabilities")).unwrap();
		fs::create_dir_all(&ev_dir).unwrap();
		fs::write(input_dir.join("capabilities").join("sw"), "1\n").unwrap();

		let d = input_add(ev_dir.to_str().unwrap(), Some("/dev/input/event3"), None).unwrap();
		assert!(d.has_capability("input.switch"));
		assert_eq!(d.string_or_empty("button.type"), "lid");
		assert!(d.bool_or_false("button.has_state"));
		assert_eq!(input_get_prober(&d), Some("hald-probe-input"));
	}

	#[test]
	fn net_udi_prefers_mac() {
		let dir = fixture("net").join("eth0");
		fs::create_dir_all(&dir).unwrap();
		fs::write(dir.join("address"), "00:11:22:33:44:55\n").unwrap();
		fs::write(dir.join("ifindex"), "2\n").unwrap();

		let d = net_add(dir.to_str().unwrap(), None, Some("/sys/devices/pci0000:00/0000:00:19.0")).unwrap();
		assert_eq!(d.get_uint64("net.mac_address").unwrap(), 0x001122334455);
		assert_eq!(
			net_compute_udi(&d),
			"/org/freedesktop/Hal/devices/net_001122334455"
		);
	}

	#[test]
	fn net_zero_mac_falls_back_to_origin() {
		let dir = fixture("net0").join("sit0");
		fs::create_dir_all(&dir).unwrap();
		fs::write(dir.join("address"), "00:00:00:00:00:00\n").unwrap();

		let d = net_add(dir.to_str().unwrap(), None, Some("/sys/devices/virtual/net/sit0")).unwrap();
		assert_eq!(
			net_compute_udi(&d),
			"/org/freedesktop/Hal/devices/net_sit0"
		);
	}
}
