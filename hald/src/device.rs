// SPDX-License-Identifier: GPL-2.0

//! Device object and typed property model

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

/// Property value sum type
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
	String(String),
	Int(i64),
	Uint64(u64),
	Double(f64),
	Bool(bool),
	Strlist(Vec<String>),
}

impl Property {
	pub fn kind(&self) -> &'static str {
		match self {
			Property::String(_) => "string",
			Property::Int(_) => "int",
			Property::Uint64(_) => "uint64",
			Property::Double(_) => "double",
			Property::Bool(_) => "bool",
			Property::Strlist(_) => "strlist",
		}
	}

	/// Render the value the way it is exported to helper environments
	pub fn to_env_string(&self) -> String {
		match self {
			Property::String(s) => s.clone(),
			Property::Int(i) => i.to_string(),
			Property::Uint64(u) => u.to_string(),
			Property::Double(d) => d.to_string(),
			Property::Bool(b) => if *b { "true".into() } else { "false".into() },
			Property::Strlist(l) => l.join("\t"),
		}
	}
}

/// A named lock on a device, holding the owners that claimed it
#[derive(Debug, Clone, Default)]
pub struct Lock {
	pub holders: Vec<String>,
}

static TEMP_UDI_SERIAL: AtomicU64 = AtomicU64::new(0);

/// Prefix under which all published device identifiers live
pub const UDI_PREFIX: &str = "/org/freedesktop/Hal/devices";

/// UDI assigned to devices hidden by preprobe rules
pub const UDI_IGNORED: &str = "/org/freedesktop/Hal/devices/ignored-device";

/// UDI of the synthetic root device
pub const UDI_COMPUTER: &str = "/org/freedesktop/Hal/devices/computer";

/// Device structure - a mutable aggregate of typed properties
#[derive(Debug, Clone)]
pub struct Device {
	udi: String,
	properties: BTreeMap<String, Property>,
	capabilities: Vec<String>,
	locks: BTreeMap<String, Lock>,
	/// Addon processes launched for this device
	pub num_addons: u32,
	/// Addon processes that declared ready (or died)
	pub num_addons_ready: u32,
}

impl Device {
	/// Create a new device with a temporary identity
	pub fn new() -> Self {
		let serial = TEMP_UDI_SERIAL.fetch_add(1, Ordering::Relaxed);
		Self {
			udi: format!("{}/temp/{}", UDI_PREFIX, serial),
			properties: BTreeMap::new(),
			capabilities: Vec::new(),
			locks: BTreeMap::new(),
			num_addons: 0,
			num_addons_ready: 0,
		}
	}

	pub fn udi(&self) -> &str {
		&self.udi
	}

	pub fn set_udi(&mut self, udi: &str) {
		self.udi = udi.to_string();
	}

	/// Check a UDI against the allowed character set
	pub fn udi_is_valid(udi: &str) -> bool {
		!udi.is_empty()
			&& udi.chars().all(|c| {
				c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '/' || c == '-'
			})
	}

	/// Set a property; returns true if the stored value changed.
	///
	/// Setting a property to its current value is a no-op.
	pub fn set_property(&mut self, key: &str, value: Property) -> bool {
		if let Some(existing) = self.properties.get(key) {
			if *existing == value {
				return false;
			}
		}
		self.properties.insert(key.to_string(), value);
		true
	}

	pub fn set_string(&mut self, key: &str, value: &str) -> bool {
		self.set_property(key, Property::String(value.to_string()))
	}

	pub fn set_int(&mut self, key: &str, value: i64) -> bool {
		self.set_property(key, Property::Int(value))
	}

	pub fn set_uint64(&mut self, key: &str, value: u64) -> bool {
		self.set_property(key, Property::Uint64(value))
	}

	pub fn set_double(&mut self, key: &str, value: f64) -> bool {
		self.set_property(key, Property::Double(value))
	}

	pub fn set_bool(&mut self, key: &str, value: bool) -> bool {
		self.set_property(key, Property::Bool(value))
	}

	pub fn has_property(&self, key: &str) -> bool {
		self.properties.contains_key(key)
	}

	pub fn get_property(&self, key: &str) -> Option<&Property> {
		self.properties.get(key)
	}

	pub fn get_string(&self, key: &str) -> Result<&str> {
		match self.properties.get(key) {
			Some(Property::String(s)) => Ok(s),
			Some(_) => Err(Error::WrongType),
			None => Err(Error::NotFound),
		}
	}

	pub fn get_int(&self, key: &str) -> Result<i64> {
		match self.properties.get(key) {
			Some(Property::Int(i)) => Ok(*i),
			Some(_) => Err(Error::WrongType),
			None => Err(Error::NotFound),
		}
	}

	pub fn get_uint64(&self, key: &str) -> Result<u64> {
		match self.properties.get(key) {
			Some(Property::Uint64(u)) => Ok(*u),
			Some(_) => Err(Error::WrongType),
			None => Err(Error::NotFound),
		}
	}

	pub fn get_double(&self, key: &str) -> Result<f64> {
		match self.properties.get(key) {
			Some(Property::Double(d)) => Ok(*d),
			Some(_) => Err(Error::WrongType),
			None => Err(Error::NotFound),
		}
	}

	pub fn get_bool(&self, key: &str) -> Result<bool> {
		match self.properties.get(key) {
			Some(Property::Bool(b)) => Ok(*b),
			Some(_) => Err(Error::WrongType),
			None => Err(Error::NotFound),
		}
	}

	pub fn get_strlist(&self, key: &str) -> Result<&[String]> {
		match self.properties.get(key) {
			Some(Property::Strlist(l)) => Ok(l),
			Some(_) => Err(Error::WrongType),
			None => Err(Error::NotFound),
		}
	}

	/// Convenience: string property or an empty default
	pub fn string_or_empty(&self, key: &str) -> &str {
		self.get_string(key).unwrap_or("")
	}

	/// Convenience: bool property, absent means false
	pub fn bool_or_false(&self, key: &str) -> bool {
		self.get_bool(key).unwrap_or(false)
	}

	/// Remove a property; returns true if it existed.
	pub fn remove_property(&mut self, key: &str) -> bool {
		self.properties.remove(key).is_some()
	}

	pub fn properties(&self) -> impl Iterator<Item = (&String, &Property)> {
		self.properties.iter()
	}

	pub fn num_properties(&self) -> usize {
		self.properties.len()
	}

	/// Append to a strlist property, creating it if absent.
	pub fn strlist_append(&mut self, key: &str, value: &str) -> Result<bool> {
		match self.properties.get_mut(key) {
			Some(Property::Strlist(l)) => {
				l.push(value.to_string());
				Ok(true)
			}
			Some(_) => Err(Error::WrongType),
			None => {
				self.properties
					.insert(key.to_string(), Property::Strlist(vec![value.to_string()]));
				Ok(true)
			}
		}
	}

	/// Prepend to a strlist property, creating it if absent.
	pub fn strlist_prepend(&mut self, key: &str, value: &str) -> Result<bool> {
		match self.properties.get_mut(key) {
			Some(Property::Strlist(l)) => {
				l.insert(0, value.to_string());
				Ok(true)
			}
			Some(_) => Err(Error::WrongType),
			None => {
				self.properties
					.insert(key.to_string(), Property::Strlist(vec![value.to_string()]));
				Ok(true)
			}
		}
	}

	/// Remove one element from a strlist property.
	pub fn strlist_remove(&mut self, key: &str, value: &str) -> Result<bool> {
		match self.properties.get_mut(key) {
			Some(Property::Strlist(l)) => {
				let before = l.len();
				l.retain(|v| v != value);
				Ok(l.len() != before)
			}
			Some(_) => Err(Error::WrongType),
			None => Ok(false),
		}
	}

	/// Position-cursor access into a strlist so callers can resume iteration.
	pub fn strlist_at(&self, key: &str, pos: usize) -> Result<Option<&str>> {
		let list = self.get_strlist(key)?;
		Ok(list.get(pos).map(|s| s.as_str()))
	}

	/// Add a capability tag; idempotent, returns true if newly added.
	///
	/// The tag is mirrored into the info.capabilities strlist.
	pub fn add_capability(&mut self, capability: &str) -> bool {
		if self.capabilities.iter().any(|c| c == capability) {
			return false;
		}
		self.capabilities.push(capability.to_string());
		let _ = self.strlist_append("info.capabilities", capability);
		true
	}

	pub fn has_capability(&self, capability: &str) -> bool {
		self.capabilities.iter().any(|c| c == capability)
	}

	pub fn remove_capability(&mut self, capability: &str) -> bool {
		let before = self.capabilities.len();
		self.capabilities.retain(|c| c != capability);
		let _ = self.strlist_remove("info.capabilities", capability);
		self.capabilities.len() != before
	}

	/// Drop every capability tag and the mirror property
	pub fn clear_capabilities(&mut self) {
		self.capabilities.clear();
		self.remove_property("info.capabilities");
	}

	pub fn capabilities(&self) -> &[String] {
		&self.capabilities
	}

	pub fn parent_udi(&self) -> Option<&str> {
		self.get_string("info.parent").ok()
	}

	pub fn set_parent_udi(&mut self, parent: &str) -> bool {
		self.set_string("info.parent", parent)
	}

	/// Acquire a named lock for an owner; returns false if already held by it.
	pub fn acquire_lock(&mut self, name: &str, owner: &str) -> bool {
		let lock = self.locks.entry(name.to_string()).or_default();
		if lock.holders.iter().any(|h| h == owner) {
			return false;
		}
		lock.holders.push(owner.to_string());
		true
	}

	/// Release a named lock for an owner; returns false if it did not hold it.
	pub fn release_lock(&mut self, name: &str, owner: &str) -> bool {
		let released = match self.locks.get_mut(name) {
			Some(lock) => {
				let before = lock.holders.len();
				lock.holders.retain(|h| h != owner);
				lock.holders.len() != before
			}
			None => false,
		};
		if released {
			if self.locks.get(name).map(|l| l.holders.is_empty()).unwrap_or(false) {
				self.locks.remove(name);
			}
		}
		released
	}

	pub fn is_locked(&self, name: &str) -> bool {
		self.locks.get(name).map(|l| !l.holders.is_empty()).unwrap_or(false)
	}

	pub fn lock_holders(&self, name: &str) -> Vec<String> {
		self.locks
			.get(name)
			.map(|l| l.holders.clone())
			.unwrap_or_default()
	}

	pub fn lock_names(&self) -> Vec<String> {
		self.locks.keys().cloned().collect()
	}

	/// Copy one property value from another device under a new key.
	pub fn copy_property_from(&mut self, source: &Device, source_key: &str, target_key: &str) -> Result<bool> {
		match source.get_property(source_key) {
			Some(value) => Ok(self.set_property(target_key, value.clone())),
			None => Err(Error::NotFound),
		}
	}

	/// Copy all properties matching a prefix from another device, rewriting
	/// the prefix. Used e.g. to project usb_device.* onto usb.* for
	/// interfaces.
	pub fn merge_with_rewrite(&mut self, source: &Device, target_prefix: &str, source_prefix: &str) {
		let matched: Vec<(String, Property)> = source
			.properties
			.iter()
			.filter(|(k, _)| k.starts_with(source_prefix))
			.map(|(k, v)| {
				(
					format!("{}{}", target_prefix, &k[source_prefix.len()..]),
					v.clone(),
				)
			})
			.collect();
		for (key, value) in matched {
			self.set_property(&key, value);
		}
	}
}

impl Default for Device {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn set_get_round_trip_preserves_type() {
		let mut d = Device::new();
		assert!(d.set_string("info.product", "Mouse"));
		assert!(d.set_int("usb.vendor_id", 0x46d));
		assert!(d.set_bool("button.has_state", true));
		assert_eq!(d.get_string("info.product").unwrap(), "Mouse");
		assert_eq!(d.get_int("usb.vendor_id").unwrap(), 0x46d);
		assert!(d.get_bool("button.has_state").unwrap());
	}

	#[test]
	fn get_with_wrong_type_fails() {
		let mut d = Device::new();
		d.set_string("block.device", "/dev/sda");
		assert_eq!(d.get_int("block.device"), Err(Error::WrongType));
		assert_eq!(d.get_int("block.major"), Err(Error::NotFound));
	}

	#[test]
	fn set_same_value_is_noop() {
		let mut d = Device::new();
		assert!(d.set_string("info.product", "Disk"));
		assert!(!d.set_string("info.product", "Disk"));
		assert!(d.set_string("info.product", "Disc"));
	}

	#[test]
	fn capability_add_is_idempotent() {
		let mut d = Device::new();
		assert!(d.add_capability("input"));
		assert!(!d.add_capability("input"));
		assert_eq!(d.get_strlist("info.capabilities").unwrap(), ["input"]);
	}

	#[test]
	fn locks_track_owners() {
		let mut d = Device::new();
		assert!(d.acquire_lock("org.freedesktop.Hal.Device.Storage", ":1.42"));
		assert!(!d.acquire_lock("org.freedesktop.Hal.Device.Storage", ":1.42"));
		assert!(d.is_locked("org.freedesktop.Hal.Device.Storage"));
		assert!(d.release_lock("org.freedesktop.Hal.Device.Storage", ":1.42"));
		assert!(!d.is_locked("org.freedesktop.Hal.Device.Storage"));
	}

	#[test]
	fn merge_with_rewrite_projects_prefix() {
		let mut parent = Device::new();
		parent.set_int("usb_device.vendor_id", 0x46d);
		parent.set_int("usb_device.product_id", 0xc012);
		parent.set_string("info.product", "Optical Mouse");

		let mut d = Device::new();
		d.merge_with_rewrite(&parent, "usb.", "usb_device.");
		assert_eq!(d.get_int("usb.vendor_id").unwrap(), 0x46d);
		assert_eq!(d.get_int("usb.product_id").unwrap(), 0xc012);
		assert!(!d.has_property("usb.info.product"));
	}

	#[test]
	fn strlist_cursor_survives_mutation_before_position() {
		let mut d = Device::new();
		d.strlist_append("info.callouts.add", "a").unwrap();
		d.strlist_append("info.callouts.add", "b").unwrap();
		d.strlist_append("info.callouts.add", "c").unwrap();
		assert_eq!(d.strlist_at("info.callouts.add", 1).unwrap(), Some("b"));
		d.strlist_append("info.callouts.add", "d").unwrap();
		assert_eq!(d.strlist_at("info.callouts.add", 3).unwrap(), Some("d"));
		assert_eq!(d.strlist_at("info.callouts.add", 9).unwrap(), None);
	}

	#[test]
	fn udi_charset_validation() {
		assert!(Device::udi_is_valid("/org/freedesktop/Hal/devices/pci_8086_1234"));
		assert!(!Device::udi_is_valid("/org/freedesktop/Hal/devices/bad space"));
		assert!(!Device::udi_is_valid(""));
	}
}
