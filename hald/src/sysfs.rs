// SPDX-License-Identifier: GPL-2.0

//! Sysfs and procfs attribute helpers

use std::fs;
use std::path::{Path, PathBuf};

use crate::device::Device;

/// Read a sysfs attribute file, trimmed. Returns None when absent or
/// unreadable.
pub fn read_attr(sysfs_path: &str, attr: &str) -> Option<String> {
	let path = Path::new(sysfs_path).join(attr);
	let raw = fs::read_to_string(path).ok()?;
	let trimmed = raw.trim();
	if trimmed.is_empty() {
		None
	} else {
		Some(trimmed.to_string())
	}
}

/// Read an attribute and parse it as a signed integer with the given radix.
pub fn get_int_from_file(sysfs_path: &str, attr: &str, radix: u32) -> Option<i64> {
	let raw = read_attr(sysfs_path, attr)?;
	let (negative, s) = match raw.strip_prefix('-') {
		Some(rest) => (true, rest),
		None => (false, raw.as_str()),
	};
	let s = s.trim_start_matches("0x").trim_start_matches("0X");
	// attribute files sometimes carry trailing descriptors, keep the leading token
	let token: String = s.chars().take_while(|c| c.is_digit(radix)).collect();
	let value = i64::from_str_radix(&token, radix).ok()?;
	Some(if negative { -value } else { value })
}

pub fn get_uint64_from_file(sysfs_path: &str, attr: &str, radix: u32) -> Option<u64> {
	let s = read_attr(sysfs_path, attr)?;
	let s = s.trim_start_matches("0x").trim_start_matches("0X");
	let token: String = s.chars().take_while(|c| c.is_digit(radix)).collect();
	u64::from_str_radix(&token, radix).ok()
}

/// Parse a dotted decimal like "2.10" (or a bare "480") into BCD2 form,
/// i.e. each decimal digit occupies a nibble: "2.10" becomes 0x210.
pub fn parse_bcd2(s: &str) -> Option<i64> {
	let mut value: i64 = 0;
	let mut seen = false;
	for c in s.chars() {
		if let Some(d) = c.to_digit(10) {
			value = (value << 4) | d as i64;
			seen = true;
		} else if c != '.' {
			break;
		}
	}
	if seen {
		Some(value)
	} else {
		None
	}
}

/// Set a string property from an attribute file. Returns true on success.
pub fn set_string_from_file(d: &mut Device, key: &str, sysfs_path: &str, attr: &str) -> bool {
	match read_attr(sysfs_path, attr) {
		Some(s) => {
			d.set_string(key, &s);
			true
		}
		None => false,
	}
}

/// Set an int property from an attribute file. Returns true on success.
pub fn set_int_from_file(d: &mut Device, key: &str, sysfs_path: &str, attr: &str, radix: u32) -> bool {
	match get_int_from_file(sysfs_path, attr, radix) {
		Some(v) => {
			d.set_int(key, v);
			true
		}
		None => false,
	}
}

pub fn set_uint64_from_file(d: &mut Device, key: &str, sysfs_path: &str, attr: &str, radix: u32) -> bool {
	match get_uint64_from_file(sysfs_path, attr, radix) {
		Some(v) => {
			d.set_uint64(key, v);
			true
		}
		None => false,
	}
}

pub fn set_bcd2_from_file(d: &mut Device, key: &str, sysfs_path: &str, attr: &str) -> bool {
	match read_attr(sysfs_path, attr).and_then(|s| parse_bcd2(&s)) {
		Some(v) => {
			d.set_int(key, v);
			true
		}
		None => false,
	}
}

/// Target of a symlink below a sysfs node, if it is one.
pub fn link_target(sysfs_path: &str, link: &str) -> Option<PathBuf> {
	fs::read_link(Path::new(sysfs_path).join(link)).ok()
}

/// Name of the bound kernel driver (basename of the `driver` link).
pub fn driver_name(sysfs_path: &str) -> Option<String> {
	let target = link_target(sysfs_path, "driver")?;
	target
		.file_name()
		.map(|n| n.to_string_lossy().into_owned())
}

/// Record the bound driver under the given key, when one exists.
pub fn set_driver(d: &mut Device, key: &str, sysfs_path: &str) -> bool {
	match driver_name(sysfs_path) {
		Some(name) => {
			d.set_string(key, &name);
			true
		}
		None => false,
	}
}

/// Final path element
pub fn last_element(path: &str) -> &str {
	path.rsplit('/').next().unwrap_or(path)
}

/// Strip the final path element; None at the top.
pub fn path_ascend(path: &str) -> Option<&str> {
	let idx = path.rfind('/')?;
	if idx == 0 {
		None
	} else {
		Some(&path[..idx])
	}
}

/// Read a "Key: value" line from a procfs info file, as the ACPI and PMU
/// pseudo files are laid out.
pub fn keyfile_value(path: &Path, wanted: &str) -> Option<String> {
	let content = fs::read_to_string(path).ok()?;
	for line in content.lines() {
		if let Some((key, value)) = line.split_once(':') {
			if key.trim() == wanted {
				let v = value.trim();
				if v.is_empty() {
					return None;
				}
				return Some(v.to_string());
			}
		}
	}
	None
}

/// Integer variant of keyfile_value; tolerates trailing units.
pub fn keyfile_int(path: &Path, wanted: &str) -> Option<i64> {
	let v = keyfile_value(path, wanted)?;
	let token: String = v.chars().take_while(|c| c.is_ascii_digit() || *c == '-').collect();
	token.parse().ok()
}
