// SPDX-License-Identifier: GPL-2.0

//! Shared derived-property math for battery devices

use crate::store::DeviceStore;

/// Charge percentage, clamped into 0..=100.
pub fn compute_percentage(current: i64, last_full: i64) -> Option<i64> {
	if last_full <= 0 || current < 0 {
		return None;
	}
	Some(((current * 100) / last_full).clamp(0, 100))
}

/// Seconds of run time (discharging) or charge time (charging) left.
pub fn compute_remaining_time(
	current: i64,
	last_full: i64,
	rate: i64,
	is_charging: bool,
	is_discharging: bool,
) -> Option<i64> {
	if rate <= 0 {
		return None;
	}
	if is_discharging {
		Some((current * 3600) / rate)
	} else if is_charging {
		let missing = (last_full - current).max(0);
		Some((missing * 3600) / rate)
	} else {
		None
	}
}

/// Convert a mAh value to mWh at the design voltage (millivolts). Values
/// reported in mWh already are taken verbatim.
pub fn to_mwh(value: i64, unit: &str, design_voltage_mv: i64) -> i64 {
	if unit == "mAh" && design_voltage_mv > 0 {
		(value * design_voltage_mv) / 1000
	} else {
		value
	}
}

/// Recompute the derived charge_level keys of a battery device from its
/// battery.reporting.* sources. Removes the derived keys when the sources
/// are gone (battery removed from its bay).
pub fn refresh_derived(store: &mut DeviceStore, udi: &str) {
	let (present, unit, design_voltage, design, last_full, current, rate, charging, discharging) = {
		let d = match store.find(udi) {
			Some(d) => d,
			None => return,
		};
		(
			d.bool_or_false("battery.present"),
			d.string_or_empty("battery.reporting.unit").to_string(),
			d.get_int("battery.voltage.design").unwrap_or(0),
			d.get_int("battery.reporting.design").ok(),
			d.get_int("battery.reporting.last_full").ok(),
			d.get_int("battery.reporting.current").ok(),
			d.get_int("battery.reporting.rate").ok(),
			d.bool_or_false("battery.rechargeable.is_charging"),
			d.bool_or_false("battery.rechargeable.is_discharging"),
		)
	};

	if !present {
		for key in [
			"battery.charge_level.design",
			"battery.charge_level.last_full",
			"battery.charge_level.current",
			"battery.charge_level.rate",
			"battery.charge_level.percentage",
			"battery.remaining_time",
		] {
			let _ = store.remove_property(udi, key);
		}
		return;
	}

	let unit_is_mah = unit == "mAh";
	if let Some(v) = design {
		let _ = store.set_int(udi, "battery.charge_level.design", to_mwh(v, &unit, design_voltage));
	}
	if let Some(v) = last_full {
		let _ = store.set_int(udi, "battery.charge_level.last_full", to_mwh(v, &unit, design_voltage));
	}
	if let Some(v) = current {
		let _ = store.set_int(udi, "battery.charge_level.current", to_mwh(v, &unit, design_voltage));
	}
	if let Some(v) = rate {
		let _ = store.set_int(udi, "battery.charge_level.rate", to_mwh(v, &unit, design_voltage));
	}
	// converted values are mWh; otherwise record the unit as reported
	let stored_unit = if unit_is_mah && design_voltage > 0 {
		"mWh"
	} else if unit.is_empty() {
		"unknown"
	} else {
		unit.as_str()
	};
	let _ = store.set_string(udi, "battery.charge_level.unit", stored_unit);

	if let (Some(current), Some(last_full)) = (current, last_full) {
		match compute_percentage(current, last_full) {
			Some(pct) => {
				let _ = store.set_int(udi, "battery.charge_level.percentage", pct);
			}
			None => {
				let _ = store.remove_property(udi, "battery.charge_level.percentage");
			}
		}
		match compute_remaining_time(current, last_full, rate.unwrap_or(0), charging, discharging) {
			Some(secs) => {
				let _ = store.set_int(udi, "battery.remaining_time", secs);
			}
			None => {
				let _ = store.remove_property(udi, "battery.remaining_time");
			}
		}
	}
}
