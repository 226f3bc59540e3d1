// SPDX-License-Identifier: GPL-2.0

//! ACPI backend: batteries, adapters, buttons, fans, processors, thermal
//! zones read from the /proc/acpi namespace

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::DaemonConfig;
use crate::device::{Device, UDI_COMPUTER, UDI_PREFIX};
use crate::handlers::HOTPLUG_TYPE_FIRMWARE;
use crate::hotplug::{
	ButtonKind, FirmwareEvent, FirmwareKind, FirmwareObject, HotplugAction, HotplugEvent,
};
use crate::store::DeviceStore;
use crate::sysfs::{keyfile_int, keyfile_value};

use super::{battery, Condition};

fn acpi_root(config: &DaemonConfig) -> PathBuf {
	config.proc_root.join("acpi")
}

pub fn detect(config: &DaemonConfig) -> bool {
	acpi_root(config).is_dir()
}

fn list_objects(root: &Path, class: &str) -> Vec<PathBuf> {
	let mut paths = Vec::new();
	if let Ok(entries) = fs::read_dir(root.join(class)) {
		for entry in entries.flatten() {
			if entry.path().is_dir() {
				paths.push(entry.path());
			}
		}
	}
	paths.sort();
	paths
}

fn make_event(object: FirmwareObject, path: PathBuf) -> HotplugEvent {
	HotplugEvent::new_firmware(
		HotplugAction::Add,
		FirmwareEvent {
			backend: FirmwareKind::Acpi,
			object,
			path: path.to_string_lossy().into_owned(),
		},
	)
}

/// One add event per discovered ACPI object.
pub fn coldplug_events(config: &DaemonConfig) -> Vec<HotplugEvent> {
	let root = acpi_root(config);
	let mut events = Vec::new();

	for path in list_objects(&root, "battery") {
		events.push(make_event(FirmwareObject::Battery, path));
	}
	for path in list_objects(&root, "ac_adapter") {
		events.push(make_event(FirmwareObject::AcAdapter, path));
	}
	for (dir, kind) in [
		("button/lid", ButtonKind::Lid),
		("button/power", ButtonKind::Power),
		("button/sleep", ButtonKind::Sleep),
	] {
		for path in list_objects(&root, dir) {
			events.push(make_event(FirmwareObject::Button(kind), path));
		}
	}
	for path in list_objects(&root, "fan") {
		events.push(make_event(FirmwareObject::Fan, path));
	}
	for path in list_objects(&root, "processor") {
		events.push(make_event(FirmwareObject::Processor, path));
	}
	for path in list_objects(&root, "thermal_zone") {
		events.push(make_event(FirmwareObject::ThermalZone, path));
	}

	events
}

fn object_name(path: &str) -> String {
	crate::sysfs::last_element(path).to_string()
}

/// Split a "4400 mAh" style reading into value and unit.
fn reading_with_unit(path: &Path, key: &str) -> Option<(i64, String)> {
	let raw = keyfile_value(path, key)?;
	let mut parts = raw.split_whitespace();
	let value: i64 = parts.next()?.parse().ok()?;
	let unit = parts.next().unwrap_or("").to_string();
	Some((value, unit))
}

fn battery_add(acpi_path: &str) -> Device {
	let mut d = Device::new();
	d.set_string("info.parent", UDI_COMPUTER);
	d.set_string("info.category", "battery");
	d.add_capability("battery");
	d.set_string("battery.type", "primary");
	d.set_string("linux.acpi_path", acpi_path);
	d.set_string("info.product", "Battery Bay");

	let info = Path::new(acpi_path).join("info");
	if let Some(v) = keyfile_value(&info, "OEM info") {
		d.set_string("battery.vendor", &v);
		d.set_string("info.vendor", &v);
	}
	if let Some(v) = keyfile_value(&info, "model number") {
		d.set_string("battery.model", &v);
	}
	if let Some(v) = keyfile_value(&info, "serial number") {
		d.set_string("battery.serial", &v);
	}
	if let Some(v) = keyfile_value(&info, "battery type") {
		d.set_string("battery.technology", &v);
	}
	if let Some((design, unit)) = reading_with_unit(&info, "design capacity") {
		d.set_int("battery.reporting.design", design);
		d.set_string("battery.reporting.unit", &unit);
	}
	if let Some((last_full, _)) = reading_with_unit(&info, "last full capacity") {
		d.set_int("battery.reporting.last_full", last_full);
	}
	if let Some((voltage, _)) = reading_with_unit(&info, "design voltage") {
		d.set_int("battery.voltage.design", voltage);
	}

	d
}

fn button_add(acpi_path: &str, kind: ButtonKind) -> Device {
	let mut d = Device::new();
	d.set_string("info.parent", UDI_COMPUTER);
	d.set_string("info.category", "button");
	d.add_capability("button");
	d.set_string("button.type", kind.as_str());
	d.set_string("linux.acpi_path", acpi_path);
	let product = match kind {
		ButtonKind::Lid => "Lid Switch",
		ButtonKind::Power => "Power Button",
		ButtonKind::Sleep => "Sleep Button",
	};
	d.set_string("info.product", product);
	// only the lid switch has readable state
	d.set_bool("button.has_state", kind == ButtonKind::Lid);
	if kind == ButtonKind::Lid {
		let state = Path::new(acpi_path).join("state");
		if let Some(v) = keyfile_value(&state, "state") {
			d.set_bool("button.state.value", v == "closed");
		}
	}
	d
}

/// Build a device draft for one ACPI add event.
pub fn add_device(event: &FirmwareEvent) -> Option<Device> {
	let mut d = match event.object {
		FirmwareObject::Battery => battery_add(&event.path),
		FirmwareObject::AcAdapter => {
			let mut d = Device::new();
			d.set_string("info.parent", UDI_COMPUTER);
			d.set_string("info.category", "ac_adapter");
			d.add_capability("ac_adapter");
			d.set_string("linux.acpi_path", &event.path);
			d.set_string("info.product", "AC Adapter");
			d
		}
		FirmwareObject::Button(kind) => button_add(&event.path, kind),
		FirmwareObject::Fan => {
			let mut d = Device::new();
			d.set_string("info.parent", UDI_COMPUTER);
			d.set_string("info.category", "fan");
			d.add_capability("fan");
			d.set_string("linux.acpi_path", &event.path);
			d.set_string("info.product", "Fan");
			d
		}
		FirmwareObject::Processor => {
			let mut d = Device::new();
			d.set_string("info.parent", UDI_COMPUTER);
			d.set_string("info.category", "processor");
			d.add_capability("processor");
			d.set_string("linux.acpi_path", &event.path);
			d.set_string("info.product", "Processor");
			let info = Path::new(&event.path).join("info");
			if let Some(id) = keyfile_int(&info, "processor id") {
				d.set_int("processor.number", id);
			}
			if let Some(v) = keyfile_value(&info, "throttling control") {
				d.set_bool("processor.can_throttle", v == "yes");
			}
			d
		}
		FirmwareObject::ThermalZone => {
			let mut d = Device::new();
			d.set_string("info.parent", UDI_COMPUTER);
			d.set_string("info.category", "thermal_zone");
			d.add_capability("thermal_zone");
			d.set_string("linux.acpi_path", &event.path);
			d.set_string("info.product", "Thermal Zone");
			d
		}
		FirmwareObject::LaptopPanel => return None,
	};

	d.set_int("linux.hotplug_type", HOTPLUG_TYPE_FIRMWARE);
	d.set_string("linux.subsystem", "acpi");
	Some(d)
}

pub fn compute_udi(d: &Device) -> String {
	format!(
		"{}/acpi_{}",
		UDI_PREFIX,
		object_name(d.string_or_empty("linux.acpi_path"))
	)
}

/// Re-read one device's state files, mutate in place, and collect
/// conditions to raise.
pub fn refresh_device(store: &mut DeviceStore, udi: &str, out: &mut Vec<Condition>) {
	let (category, acpi_path, button_type, old_button_state) = {
		let d = match store.find(udi) {
			Some(d) => d,
			None => return,
		};
		(
			d.string_or_empty("info.category").to_string(),
			d.string_or_empty("linux.acpi_path").to_string(),
			d.string_or_empty("button.type").to_string(),
			d.get_bool("button.state.value").ok(),
		)
	};
	let state = Path::new(&acpi_path).join("state");

	match category.as_str() {
		"battery" => {
			let present = keyfile_value(&state, "present").map(|v| v == "yes").unwrap_or(false);
			let _ = store.set_bool(udi, "battery.present", present);
			if present {
				if let Some(v) = keyfile_value(&state, "charging state") {
					let _ = store.set_bool(udi, "battery.rechargeable.is_charging", v == "charging");
					let _ = store.set_bool(udi, "battery.rechargeable.is_discharging", v == "discharging");
				}
				if let Some((rate, _)) = reading_with_unit(&state, "present rate") {
					let _ = store.set_int(udi, "battery.reporting.rate", rate);
				}
				if let Some((current, _)) = reading_with_unit(&state, "remaining capacity") {
					let _ = store.set_int(udi, "battery.reporting.current", current);
				}
				if let Some((voltage, _)) = reading_with_unit(&state, "present voltage") {
					let _ = store.set_int(udi, "battery.voltage.current", voltage);
				}
			}
			battery::refresh_derived(store, udi);
		}
		"ac_adapter" => {
			if let Some(v) = keyfile_value(&state, "state") {
				let _ = store.set_bool(udi, "ac_adapter.present", v == "on-line");
			}
		}
		"button" => {
			if let Some(v) = keyfile_value(&state, "state") {
				let closed = v == "closed";
				let _ = store.set_bool(udi, "button.state.value", closed);
				if old_button_state != Some(closed) {
					out.push(Condition {
						udi: udi.to_string(),
						name: "ButtonPressed".to_string(),
						detail: button_type,
					});
				}
			}
		}
		"fan" => {
			if let Some(v) = keyfile_value(&state, "status") {
				let _ = store.set_bool(udi, "fan.enabled", v == "on");
			}
		}
		"thermal_zone" => {
			let temp_file = Path::new(&acpi_path).join("temperature");
			if let Some(v) = keyfile_int(&temp_file, "temperature") {
				let _ = store.set_int(udi, "thermal_zone.temperature", v);
			}
		}
		_ => {}
	}
}

/// Watch the kernel's ACPI event file and translate each notification
/// into a rescan of the matching device, handled on the loop thread.
/// Runs until the file or the channel closes; absence of the file just
/// means the kernel offers no asynchronous notifications.
pub fn watch_events(config: DaemonConfig, tx: crate::sync::Sender<crate::eventloop::LoopMsg>) {
	use std::io::BufRead;

	let path = acpi_root(&config).join("event");
	let file = match fs::File::open(&path) {
		Ok(f) => f,
		Err(_) => return,
	};
	crate::info!("listening for ACPI events on {}", path.display());

	let reader = std::io::BufReader::new(file);
	for line in reader.lines() {
		let line = match line {
			Ok(l) => l,
			Err(_) => return,
		};
		// format: <class> <name> <type> <data>, e.g. "button/lid LID 00000080 00000001"
		let mut fields = line.split_whitespace();
		let _class = fields.next();
		let name = match fields.next() {
			Some(n) => n,
			None => continue,
		};
		let udi = format!("{}/acpi_{}", UDI_PREFIX, name);
		let request = crate::ipc::BusRequest::Rescan { udi };
		if tx.send(crate::eventloop::LoopMsg::Bus(request)).is_err() {
			return;
		}
	}
}

/// Poll tick over every ACPI-backed device in the GDL.
pub fn poll(_config: &DaemonConfig, gdl: &mut DeviceStore) -> Vec<Condition> {
	let udis: Vec<String> = gdl
		.devices()
		.filter(|d| d.has_property("linux.acpi_path"))
		.map(|d| d.udi().to_string())
		.collect();
	let mut conditions = Vec::new();
	for udi in udis {
		refresh_device(gdl, &udi, &mut conditions);
	}
	conditions
}

#[cfg(test)]
mod tests {
	use super::*;

	fn fixture(tag: &str) -> PathBuf {
		let dir = std::env::temp_dir().join(format!("hald-acpi-test-{}-{}", tag, std::process::id()));
		let _ = fs::remove_dir_all(&dir);
		fs::create_dir_all(&dir).unwrap();
		dir
	}

	fn write_battery(root: &Path, name: &str) {
		let bat = root.join("acpi/battery").join(name);
		fs::create_dir_all(&bat).unwrap();
		fs::write(
			bat.join("info"),
			"present:                 yes\n\
			 design capacity:         4400 mAh\n\
			 last full capacity:      4300 mAh\n\
			 design voltage:          11100 mV\n\
			 model number:            XM2060\n\
			 OEM info:                SONY\n",
		)
		.unwrap();
		fs::write(
			bat.join("state"),
			"present:                 yes\n\
			 charging state:          discharging\n\
			 present rate:            1100 mA\n\
			 remaining capacity:      2150 mAh\n\
			 present voltage:         12000 mV\n",
		)
		.unwrap();
	}

	fn config_at(root: &Path) -> DaemonConfig {
		DaemonConfig::new().with_proc_root(root.to_path_buf())
	}

	#[test]
	fn coldplug_discovers_objects() {
		let root = fixture("coldplug");
		write_battery(&root, "BAT0");
		let lid = root.join("acpi/button/lid/LID0");
		fs::create_dir_all(&lid).unwrap();
		fs::write(lid.join("state"), "state:      open\n").unwrap();

		let config = config_at(&root);
		assert!(detect(&config));
		let events = coldplug_events(&config);
		assert_eq!(events.len(), 2);
		let objects: Vec<FirmwareObject> =
			events.iter().map(|e| e.firmware().unwrap().object).collect();
		assert!(objects.contains(&FirmwareObject::Battery));
		assert!(objects.contains(&FirmwareObject::Button(ButtonKind::Lid)));
	}

	#[test]
	fn battery_device_reads_info_and_derives() {
		let root = fixture("battery");
		write_battery(&root, "BAT0");
		let event = FirmwareEvent {
			backend: FirmwareKind::Acpi,
			object: FirmwareObject::Battery,
			path: root.join("acpi/battery/BAT0").to_string_lossy().into_owned(),
		};
		let mut d = add_device(&event).unwrap();
		assert_eq!(d.string_or_empty("info.vendor"), "SONY");
		assert_eq!(d.get_int("battery.reporting.design").unwrap(), 4400);
		assert_eq!(d.string_or_empty("battery.reporting.unit"), "mAh");
		assert_eq!(compute_udi(&d), "/org/freedesktop/Hal/devices/acpi_BAT0");

		d.set_udi("/org/freedesktop/Hal/devices/acpi_BAT0");
		let keys = vec!["linux.sysfs_path".to_string()];
		let mut gdl = DeviceStore::new("gdl", &keys);
		gdl.add(d).unwrap();
		let mut conditions = Vec::new();
		refresh_device(&mut gdl, "/org/freedesktop/Hal/devices/acpi_BAT0", &mut conditions);
		assert!(conditions.is_empty());
		let d = gdl.find("/org/freedesktop/Hal/devices/acpi_BAT0").unwrap();
		assert!(d.bool_or_false("battery.rechargeable.is_discharging"));
		// mAh readings converted at the 11.1 V design voltage
		assert_eq!(d.get_int("battery.charge_level.current").unwrap(), 2150 * 11100 / 1000);
		assert_eq!(d.string_or_empty("battery.charge_level.unit"), "mWh");
		assert!(d.get_int("battery.charge_level.percentage").unwrap() <= 100);
	}

	#[test]
	fn lid_close_raises_condition_once() {
		let root = fixture("lid");
		let lid = root.join("acpi/button/lid/LID0");
		fs::create_dir_all(&lid).unwrap();
		fs::write(lid.join("state"), "state:      open\n").unwrap();

		let event = FirmwareEvent {
			backend: FirmwareKind::Acpi,
			object: FirmwareObject::Button(ButtonKind::Lid),
			path: lid.to_string_lossy().into_owned(),
		};
		let mut d = add_device(&event).unwrap();
		assert!(d.bool_or_false("button.has_state"));
		d.set_udi("/org/freedesktop/Hal/devices/acpi_LID0");
		let keys = vec!["linux.sysfs_path".to_string()];
		let mut gdl = DeviceStore::new("gdl", &keys);
		gdl.add(d).unwrap();

		let config = config_at(&root);
		// first poll observes the opening state
		poll(&config, &mut gdl);

		fs::write(lid.join("state"), "state:      closed\n").unwrap();
		let conditions = poll(&config, &mut gdl);
		assert_eq!(conditions.len(), 1);
		assert_eq!(conditions[0].name, "ButtonPressed");
		assert_eq!(conditions[0].detail, "lid");
		assert!(gdl
			.find("/org/freedesktop/Hal/devices/acpi_LID0")
			.unwrap()
			.bool_or_false("button.state.value"));

		// unchanged state raises nothing
		assert!(poll(&config, &mut gdl).is_empty());
	}
}
