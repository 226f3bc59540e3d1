// SPDX-License-Identifier: GPL-2.0

//! Stable device identity (UDI) computation

use crate::device::UDI_PREFIX;
use crate::store::DeviceStore;

/// Force a candidate identity into the allowed `[A-Za-z0-9_/]` set,
/// replacing everything else with `_`.
pub fn sanitize(candidate: &str) -> String {
	candidate
		.chars()
		.map(|c| {
			if c.is_ascii_alphanumeric() || c == '_' || c == '/' {
				c
			} else {
				'_'
			}
		})
		.collect()
}

/// Collapse runs of `/` and make sure nothing after the device prefix
/// introduces new path elements.
pub fn validate(candidate: &str) -> String {
	// collapse consecutive slashes first
	let mut collapsed = String::with_capacity(candidate.len());
	let mut last_slash = false;
	for c in candidate.chars() {
		if c == '/' {
			if last_slash {
				continue;
			}
			last_slash = true;
		} else {
			last_slash = false;
		}
		collapsed.push(c);
	}

	let prefix = format!("{}/", UDI_PREFIX);
	if let Some(rest) = collapsed.strip_prefix(&prefix) {
		if rest.contains('/') {
			let fixed: String = rest
				.chars()
				.map(|c| if c == '/' { '_' } else { c })
				.collect();
			return format!("{}{}", prefix, fixed);
		}
	}
	collapsed
}

/// Sanitized and validated candidate identity.
pub fn compute_candidate(raw: &str) -> String {
	validate(&sanitize(raw))
}

/// Append `_0`, `_1`, ... until the identity is free in both stores.
pub fn make_unique(gdl: &DeviceStore, tdl: &DeviceStore, candidate: &str) -> String {
	if !gdl.contains(candidate) && !tdl.contains(candidate) {
		return candidate.to_string();
	}
	let mut i = 0u32;
	loop {
		let udi = format!("{}_{}", candidate, i);
		if !gdl.contains(&udi) && !tdl.contains(&udi) {
			return udi;
		}
		i += 1;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::device::Device;

	#[test]
	fn sanitize_replaces_invalid_chars() {
		assert_eq!(
			sanitize("/org/freedesktop/Hal/devices/usb_device_46d_c012_AB C:1"),
			"/org/freedesktop/Hal/devices/usb_device_46d_c012_AB_C_1"
		);
	}

	#[test]
	fn validate_fixes_slash_in_last_element() {
		let udi = "/org/freedesktop/Hal/devices/volume_uuid_ab/cd";
		assert_eq!(
			validate(udi),
			"/org/freedesktop/Hal/devices/volume_uuid_ab_cd"
		);
	}

	#[test]
	fn validate_collapses_double_slash() {
		assert_eq!(
			validate("/org/freedesktop/Hal/devices//pci_1"),
			"/org/freedesktop/Hal/devices/pci_1"
		);
	}

	#[test]
	fn unique_appends_counter() {
		let keys = vec!["linux.sysfs_path".to_string()];
		let mut gdl = DeviceStore::new("gdl", &keys);
		let tdl = DeviceStore::new("tdl", &keys);

		let mut d = Device::new();
		d.set_udi("/org/freedesktop/Hal/devices/pci_8086_1234");
		gdl.add(d).unwrap();
		let mut d0 = Device::new();
		d0.set_udi("/org/freedesktop/Hal/devices/pci_8086_1234_0");
		gdl.add(d0).unwrap();

		assert_eq!(
			make_unique(&gdl, &tdl, "/org/freedesktop/Hal/devices/pci_8086_1234"),
			"/org/freedesktop/Hal/devices/pci_8086_1234_1"
		);
		assert_eq!(
			make_unique(&gdl, &tdl, "/org/freedesktop/Hal/devices/pci_8086_9999"),
			"/org/freedesktop/Hal/devices/pci_8086_9999"
		);
	}

	#[test]
	fn candidate_matches_published_charset() {
		let udi = compute_candidate("/org/freedesktop/Hal/devices/usb_device_46d_c012_Série");
		assert!(udi.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '/'));
		assert!(!udi.contains("//"));
	}
}
