// SPDX-License-Identifier: GPL-2.0

//! APM backend: battery and AC state from the single /proc/apm line

use std::fs;
use std::path::PathBuf;

use crate::config::DaemonConfig;
use crate::device::{Device, UDI_COMPUTER, UDI_PREFIX};
use crate::handlers::HOTPLUG_TYPE_FIRMWARE;
use crate::hotplug::{FirmwareEvent, FirmwareKind, FirmwareObject, HotplugAction, HotplugEvent};
use crate::store::DeviceStore;

use super::Condition;

const BATTERY_FLAG_ABSENT: i64 = 0x80;

fn apm_path(config: &DaemonConfig) -> PathBuf {
	config.proc_root.join("apm")
}

pub fn detect(config: &DaemonConfig) -> bool {
	apm_path(config).is_file()
}

/// Decoded /proc/apm line
#[derive(Debug, Clone, PartialEq)]
pub struct ApmInfo {
	pub driver_version: String,
	pub ac_online: bool,
	pub battery_flag: i64,
	pub percentage: i64,
	pub time: i64,
	pub units: String,
}

impl ApmInfo {
	pub fn battery_present(&self) -> bool {
		self.battery_flag & BATTERY_FLAG_ABSENT == 0
	}

	pub fn remaining_seconds(&self) -> Option<i64> {
		if self.time < 0 {
			return None;
		}
		match self.units.as_str() {
			"min" => Some(self.time * 60),
			"sec" => Some(self.time),
			_ => None,
		}
	}
}

/// Parse the fixed-field /proc/apm format:
/// driver bios flags ac-status battery-status battery-flag pct time units
pub fn parse(content: &str) -> Option<ApmInfo> {
	let fields: Vec<&str> = content.split_whitespace().collect();
	if fields.len() < 9 {
		return None;
	}
	let hex = |s: &str| i64::from_str_radix(s.trim_start_matches("0x"), 16).ok();
	Some(ApmInfo {
		driver_version: fields[0].to_string(),
		ac_online: hex(fields[3])? == 0x1,
		battery_flag: hex(fields[5])?,
		percentage: fields[6].trim_end_matches('%').parse().ok()?,
		time: fields[7].parse().ok()?,
		units: fields[8].to_string(),
	})
}

fn read(config: &DaemonConfig) -> Option<ApmInfo> {
	let content = fs::read_to_string(apm_path(config)).ok()?;
	parse(&content)
}

/// APM always exposes exactly one battery and one AC adapter object.
pub fn coldplug_events(config: &DaemonConfig) -> Vec<HotplugEvent> {
	let path = apm_path(config).to_string_lossy().into_owned();
	vec![
		HotplugEvent::new_firmware(
			HotplugAction::Add,
			FirmwareEvent {
				backend: FirmwareKind::Apm,
				object: FirmwareObject::Battery,
				path: path.clone(),
			},
		),
		HotplugEvent::new_firmware(
			HotplugAction::Add,
			FirmwareEvent {
				backend: FirmwareKind::Apm,
				object: FirmwareObject::AcAdapter,
				path,
			},
		),
	]
}

pub fn add_device(event: &FirmwareEvent) -> Option<Device> {
	let mut d = Device::new();
	d.set_string("info.parent", UDI_COMPUTER);
	d.set_string("linux.apm_path", &event.path);
	d.set_int("linux.hotplug_type", HOTPLUG_TYPE_FIRMWARE);
	d.set_string("linux.subsystem", "apm");
	match event.object {
		FirmwareObject::Battery => {
			d.set_string("info.category", "battery");
			d.add_capability("battery");
			d.set_string("battery.type", "primary");
			d.set_string("info.product", "Battery Bay");
		}
		FirmwareObject::AcAdapter => {
			d.set_string("info.category", "ac_adapter");
			d.add_capability("ac_adapter");
			d.set_string("info.product", "AC Adapter");
		}
		_ => return None,
	}
	Some(d)
}

pub fn compute_udi(d: &Device) -> String {
	match d.string_or_empty("info.category") {
		"battery" => format!("{}/apm_battery", UDI_PREFIX),
		_ => format!("{}/apm_ac_adapter", UDI_PREFIX),
	}
}

/// Poll tick: re-read /proc/apm and refresh both objects in place.
pub fn poll(config: &DaemonConfig, gdl: &mut DeviceStore) -> Vec<Condition> {
	let info = match read(config) {
		Some(i) => i,
		None => {
			crate::warn!("cannot read {}", apm_path(config).display());
			return Vec::new();
		}
	};

	let battery_udi = format!("{}/apm_battery", UDI_PREFIX);
	if gdl.contains(&battery_udi) {
		let present = info.battery_present();
		let _ = gdl.set_bool(&battery_udi, "battery.present", present);
		if present {
			let _ = gdl.set_int(&battery_udi, "battery.charge_level.percentage", info.percentage.clamp(0, 100));
			match info.remaining_seconds() {
				Some(secs) => {
					let _ = gdl.set_int(&battery_udi, "battery.remaining_time", secs);
				}
				None => {
					let _ = gdl.remove_property(&battery_udi, "battery.remaining_time");
				}
			}
			let _ = gdl.set_bool(&battery_udi, "battery.rechargeable.is_discharging", !info.ac_online);
		} else {
			let _ = gdl.remove_property(&battery_udi, "battery.charge_level.percentage");
			let _ = gdl.remove_property(&battery_udi, "battery.remaining_time");
		}
	}

	let ac_udi = format!("{}/apm_ac_adapter", UDI_PREFIX);
	if gdl.contains(&ac_udi) {
		let _ = gdl.set_bool(&ac_udi, "ac_adapter.present", info.ac_online);
	}

	Vec::new()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_the_fixed_line() {
		let info = parse("1.16 1.2 0x03 0x01 0x03 0x09 95% 120 min\n").unwrap();
		assert!(info.ac_online);
		assert!(info.battery_present());
		assert_eq!(info.percentage, 95);
		assert_eq!(info.remaining_seconds(), Some(7200));
	}

	#[test]
	fn absent_battery_flag() {
		let info = parse("1.16 1.2 0x03 0x00 0x00 0x80 -1% -1 ?\n").unwrap();
		assert!(!info.ac_online);
		assert!(!info.battery_present());
		assert_eq!(info.remaining_seconds(), None);
	}

	#[test]
	fn truncated_line_is_rejected() {
		assert!(parse("1.16 1.2 0x03\n").is_none());
	}
}
