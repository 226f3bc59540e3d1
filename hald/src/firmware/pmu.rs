// SPDX-License-Identifier: GPL-2.0

//! PMU backend: PowerMac power state from the /proc/pmu namespace

use std::fs;
use std::path::PathBuf;

use crate::config::DaemonConfig;
use crate::device::{Device, UDI_COMPUTER, UDI_PREFIX};
use crate::handlers::HOTPLUG_TYPE_FIRMWARE;
use crate::hotplug::{FirmwareEvent, FirmwareKind, FirmwareObject, HotplugAction, HotplugEvent};
use crate::store::DeviceStore;
use crate::sysfs::{keyfile_int, keyfile_value};

use super::{battery, Condition};

const PMU_FLAG_PRESENT: i64 = 0x1;
const PMU_FLAG_CHARGING: i64 = 0x2;

fn pmu_root(config: &DaemonConfig) -> PathBuf {
	config.proc_root.join("pmu")
}

pub fn detect(config: &DaemonConfig) -> bool {
	pmu_root(config).join("info").is_file()
}

/// One add event per PMU battery plus the AC adapter.
pub fn coldplug_events(config: &DaemonConfig) -> Vec<HotplugEvent> {
	let root = pmu_root(config);
	let mut events = Vec::new();

	let count = keyfile_int(&root.join("info"), "Battery count").unwrap_or(0);
	for i in 0..count {
		let path = root.join(format!("battery_{}", i));
		if path.is_file() {
			events.push(HotplugEvent::new_firmware(
				HotplugAction::Add,
				FirmwareEvent {
					backend: FirmwareKind::Pmu,
					object: FirmwareObject::Battery,
					path: path.to_string_lossy().into_owned(),
				},
			));
		}
	}
	events.push(HotplugEvent::new_firmware(
		HotplugAction::Add,
		FirmwareEvent {
			backend: FirmwareKind::Pmu,
			object: FirmwareObject::AcAdapter,
			path: root.join("info").to_string_lossy().into_owned(),
		},
	));

	events
}

pub fn add_device(event: &FirmwareEvent) -> Option<Device> {
	let mut d = Device::new();
	d.set_string("info.parent", UDI_COMPUTER);
	d.set_string("linux.pmu_path", &event.path);
	d.set_int("linux.hotplug_type", HOTPLUG_TYPE_FIRMWARE);
	d.set_string("linux.subsystem", "pmu");
	match event.object {
		FirmwareObject::Battery => {
			d.set_string("info.category", "battery");
			d.add_capability("battery");
			d.set_string("battery.type", "primary");
			d.set_string("battery.reporting.unit", "mWh");
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
		"battery" => {
			let name = crate::sysfs::last_element(d.string_or_empty("linux.pmu_path"));
			format!("{}/pmu_{}", UDI_PREFIX, name)
		}
		_ => format!("{}/pmu_ac_adapter", UDI_PREFIX),
	}
}

fn refresh_battery(gdl: &mut DeviceStore, udi: &str) {
	let path = PathBuf::from(
		gdl.find(udi)
			.map(|d| d.string_or_empty("linux.pmu_path").to_string())
			.unwrap_or_default(),
	);

	let flags = keyfile_value(&path, "flags")
		.and_then(|v| i64::from_str_radix(&v, 16).ok())
		.unwrap_or(0);
	let present = flags & PMU_FLAG_PRESENT != 0;
	let _ = gdl.set_bool(udi, "battery.present", present);
	if present {
		let _ = gdl.set_bool(udi, "battery.rechargeable.is_charging", flags & PMU_FLAG_CHARGING != 0);
		let _ = gdl.set_bool(udi, "battery.rechargeable.is_discharging", flags & PMU_FLAG_CHARGING == 0);
		if let Some(v) = keyfile_int(&path, "charge") {
			let _ = gdl.set_int(udi, "battery.reporting.current", v);
		}
		if let Some(v) = keyfile_int(&path, "max_charge") {
			let _ = gdl.set_int(udi, "battery.reporting.last_full", v);
		}
		if let Some(v) = keyfile_int(&path, "current") {
			let _ = gdl.set_int(udi, "battery.reporting.rate", v.abs());
		}
		if let Some(v) = keyfile_int(&path, "voltage") {
			let _ = gdl.set_int(udi, "battery.voltage.current", v);
		}
	}
	battery::refresh_derived(gdl, udi);
}

/// Poll tick over every PMU-backed device in the GDL.
pub fn poll(config: &DaemonConfig, gdl: &mut DeviceStore) -> Vec<Condition> {
	let udis: Vec<(String, String)> = gdl
		.devices()
		.filter(|d| d.has_property("linux.pmu_path"))
		.map(|d| (d.udi().to_string(), d.string_or_empty("info.category").to_string()))
		.collect();

	for (udi, category) in udis {
		match category.as_str() {
			"battery" => refresh_battery(gdl, &udi),
			"ac_adapter" => {
				let info = pmu_root(config).join("info");
				if let Some(ac) = keyfile_int(&info, "AC Power") {
					let _ = gdl.set_bool(&udi, "ac_adapter.present", ac != 0);
				}
			}
			_ => {}
		}
	}

	Vec::new()
}
