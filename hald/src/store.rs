// SPDX-License-Identifier: GPL-2.0

//! Indexed device stores (TDL and GDL)

use std::collections::{HashMap, VecDeque};

use crate::device::{Device, Property};
use crate::error::{Error, Result};

/// Hook record emitted atomically with every store mutation
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
	DeviceAdded {
		udi: String,
	},
	DeviceRemoved {
		udi: String,
	},
	PropertyModified {
		udi: String,
		key: String,
		added: bool,
		removed: bool,
	},
	CapabilityAdded {
		udi: String,
		capability: String,
	},
	LockAcquired {
		udi: String,
		lock: String,
		owner: String,
	},
	LockReleased {
		udi: String,
		lock: String,
		owner: String,
	},
}

/// An ordered device collection indexed by UDI and configured property keys.
///
/// Two instances exist process-wide: the TDL holds devices still under
/// probing, the GDL holds published devices. All access happens on the
/// event-loop thread; no locking here.
#[derive(Debug)]
pub struct DeviceStore {
	name: &'static str,
	order: Vec<String>,
	devices: HashMap<String, Device>,
	indexed_keys: Vec<String>,
	index: HashMap<String, HashMap<String, Vec<String>>>,
	hooks: VecDeque<StoreEvent>,
}

impl DeviceStore {
	pub fn new(name: &'static str, indexed_keys: &[String]) -> Self {
		let mut index = HashMap::new();
		for key in indexed_keys {
			index.insert(key.clone(), HashMap::new());
		}
		Self {
			name,
			order: Vec::new(),
			devices: HashMap::new(),
			indexed_keys: indexed_keys.to_vec(),
			index,
			hooks: VecDeque::new(),
		}
	}

	pub fn name(&self) -> &'static str {
		self.name
	}

	pub fn len(&self) -> usize {
		self.order.len()
	}

	pub fn is_empty(&self) -> bool {
		self.order.is_empty()
	}

	fn index_insert(&mut self, udi: &str, key: &str, value: &Property) {
		if let Property::String(s) = value {
			if let Some(by_value) = self.index.get_mut(key) {
				let udis = by_value.entry(s.clone()).or_default();
				if !udis.iter().any(|u| u == udi) {
					udis.push(udi.to_string());
				}
			}
		}
	}

	fn index_remove(&mut self, udi: &str, key: &str, value: &Property) {
		if let Property::String(s) = value {
			if let Some(by_value) = self.index.get_mut(key) {
				if let Some(udis) = by_value.get_mut(s) {
					udis.retain(|u| u != udi);
					if udis.is_empty() {
						by_value.remove(s);
					}
				}
			}
		}
	}

	/// Insert a device. Fails if the UDI is already present.
	pub fn add(&mut self, device: Device) -> Result<()> {
		let udi = device.udi().to_string();
		if self.devices.contains_key(&udi) {
			return Err(Error::AlreadyExists);
		}
		let indexed: Vec<(String, Property)> = self
			.indexed_keys
			.iter()
			.filter_map(|k| device.get_property(k).map(|v| (k.clone(), v.clone())))
			.collect();
		self.order.push(udi.clone());
		self.devices.insert(udi.clone(), device);
		for (key, value) in &indexed {
			self.index_insert(&udi, key, value);
		}
		self.hooks.push_back(StoreEvent::DeviceAdded { udi });
		Ok(())
	}

	/// Remove and return a device.
	pub fn remove(&mut self, udi: &str) -> Result<Device> {
		let device = self.devices.remove(udi).ok_or(Error::NotFound)?;
		self.order.retain(|u| u != udi);
		let indexed: Vec<(String, Property)> = self
			.indexed_keys
			.iter()
			.filter_map(|k| device.get_property(k).map(|v| (k.clone(), v.clone())))
			.collect();
		for (key, value) in &indexed {
			self.index_remove(udi, key, value);
		}
		self.hooks.push_back(StoreEvent::DeviceRemoved {
			udi: udi.to_string(),
		});
		Ok(device)
	}

	pub fn contains(&self, udi: &str) -> bool {
		self.devices.contains_key(udi)
	}

	pub fn find(&self, udi: &str) -> Option<&Device> {
		self.devices.get(udi)
	}

	/// First device whose string property equals the given value.
	pub fn match_first(&self, key: &str, value: &str) -> Option<&Device> {
		if self.index.contains_key(key) {
			let udi = self
				.index
				.get(key)
				.and_then(|by_value| by_value.get(value))
				.and_then(|udis| udis.first())?;
			return self.devices.get(udi);
		}
		self.order.iter().find_map(|udi| {
			let d = self.devices.get(udi)?;
			match d.get_property(key) {
				Some(Property::String(s)) if s == value => Some(d),
				_ => None,
			}
		})
	}

	/// UDIs of every device whose string property equals the given value,
	/// in insertion order.
	pub fn match_many(&self, key: &str, value: &str) -> Vec<String> {
		if let Some(by_value) = self.index.get(key) {
			let mut udis: Vec<String> = by_value.get(value).cloned().unwrap_or_default();
			// keep insertion order stable
			udis.sort_by_key(|u| self.order.iter().position(|o| o == u));
			return udis;
		}
		self.order
			.iter()
			.filter(|udi| {
				matches!(
					self.devices.get(*udi).and_then(|d| d.get_property(key)),
					Some(Property::String(s)) if s == value
				)
			})
			.cloned()
			.collect()
	}

	/// First device whose int property equals the given value.
	pub fn match_first_int(&self, key: &str, value: i64) -> Option<&Device> {
		self.order.iter().find_map(|udi| {
			let d = self.devices.get(udi)?;
			match d.get_property(key) {
				Some(Property::Int(i)) if *i == value => Some(d),
				_ => None,
			}
		})
	}

	/// UDIs in insertion order
	pub fn udis(&self) -> Vec<String> {
		self.order.clone()
	}

	pub fn devices(&self) -> impl Iterator<Item = &Device> {
		self.order.iter().filter_map(move |u| self.devices.get(u))
	}

	/// Set a property on a stored device; maintains indexes and fires the
	/// property-changed hook. Returns true if the value changed.
	pub fn set_property(&mut self, udi: &str, key: &str, value: Property) -> Result<bool> {
		let is_indexed = self.indexed_keys.iter().any(|k| k == key);
		let device = self.devices.get_mut(udi).ok_or(Error::NotFound)?;
		let old = device.get_property(key).cloned();
		let added = old.is_none();
		if !device.set_property(key, value.clone()) {
			return Ok(false);
		}
		if is_indexed {
			if let Some(old_value) = old {
				self.index_remove(udi, key, &old_value);
			}
			self.index_insert(udi, key, &value);
		}
		self.hooks.push_back(StoreEvent::PropertyModified {
			udi: udi.to_string(),
			key: key.to_string(),
			added,
			removed: false,
		});
		Ok(true)
	}

	pub fn set_string(&mut self, udi: &str, key: &str, value: &str) -> Result<bool> {
		self.set_property(udi, key, Property::String(value.to_string()))
	}

	pub fn set_int(&mut self, udi: &str, key: &str, value: i64) -> Result<bool> {
		self.set_property(udi, key, Property::Int(value))
	}

	pub fn set_bool(&mut self, udi: &str, key: &str, value: bool) -> Result<bool> {
		self.set_property(udi, key, Property::Bool(value))
	}

	pub fn set_double(&mut self, udi: &str, key: &str, value: f64) -> Result<bool> {
		self.set_property(udi, key, Property::Double(value))
	}

	/// Remove a property from a stored device.
	pub fn remove_property(&mut self, udi: &str, key: &str) -> Result<bool> {
		let is_indexed = self.indexed_keys.iter().any(|k| k == key);
		let device = self.devices.get_mut(udi).ok_or(Error::NotFound)?;
		let old = device.get_property(key).cloned();
		if !device.remove_property(key) {
			return Ok(false);
		}
		if is_indexed {
			if let Some(old_value) = old {
				self.index_remove(udi, key, &old_value);
			}
		}
		self.hooks.push_back(StoreEvent::PropertyModified {
			udi: udi.to_string(),
			key: key.to_string(),
			added: false,
			removed: true,
		});
		Ok(true)
	}

	pub fn strlist_append(&mut self, udi: &str, key: &str, value: &str) -> Result<bool> {
		let device = self.devices.get_mut(udi).ok_or(Error::NotFound)?;
		let added = !device.has_property(key);
		device.strlist_append(key, value)?;
		self.hooks.push_back(StoreEvent::PropertyModified {
			udi: udi.to_string(),
			key: key.to_string(),
			added,
			removed: false,
		});
		Ok(true)
	}

	pub fn strlist_prepend(&mut self, udi: &str, key: &str, value: &str) -> Result<bool> {
		let device = self.devices.get_mut(udi).ok_or(Error::NotFound)?;
		let added = !device.has_property(key);
		device.strlist_prepend(key, value)?;
		self.hooks.push_back(StoreEvent::PropertyModified {
			udi: udi.to_string(),
			key: key.to_string(),
			added,
			removed: false,
		});
		Ok(true)
	}

	/// Add a capability to a stored device; fires the capability hook.
	pub fn add_capability(&mut self, udi: &str, capability: &str) -> Result<bool> {
		let device = self.devices.get_mut(udi).ok_or(Error::NotFound)?;
		if !device.add_capability(capability) {
			return Ok(false);
		}
		self.hooks.push_back(StoreEvent::PropertyModified {
			udi: udi.to_string(),
			key: "info.capabilities".to_string(),
			added: false,
			removed: false,
		});
		self.hooks.push_back(StoreEvent::CapabilityAdded {
			udi: udi.to_string(),
			capability: capability.to_string(),
		});
		Ok(true)
	}

	pub fn acquire_lock(&mut self, udi: &str, lock: &str, owner: &str) -> Result<bool> {
		let device = self.devices.get_mut(udi).ok_or(Error::NotFound)?;
		if !device.acquire_lock(lock, owner) {
			return Ok(false);
		}
		self.hooks.push_back(StoreEvent::LockAcquired {
			udi: udi.to_string(),
			lock: lock.to_string(),
			owner: owner.to_string(),
		});
		Ok(true)
	}

	pub fn release_lock(&mut self, udi: &str, lock: &str, owner: &str) -> Result<bool> {
		let device = self.devices.get_mut(udi).ok_or(Error::NotFound)?;
		if !device.release_lock(lock, owner) {
			return Ok(false);
		}
		self.hooks.push_back(StoreEvent::LockReleased {
			udi: udi.to_string(),
			lock: lock.to_string(),
			owner: owner.to_string(),
		});
		Ok(true)
	}

	/// Direct mutable access for pipeline stages that rebuild a draft in
	/// place (TDL only; bypasses hooks and indexes for non-indexed keys).
	pub fn find_mut_unhooked(&mut self, udi: &str) -> Option<&mut Device> {
		self.devices.get_mut(udi)
	}

	/// Re-register the indexed keys of a device after unhooked mutation.
	pub fn reindex(&mut self, udi: &str) {
		let indexed: Vec<(String, Property)> = match self.devices.get(udi) {
			Some(d) => self
				.indexed_keys
				.iter()
				.filter_map(|k| d.get_property(k).map(|v| (k.clone(), v.clone())))
				.collect(),
			None => return,
		};
		let keys = self.indexed_keys.clone();
		for key in &keys {
			if let Some(by_value) = self.index.get_mut(key) {
				for udis in by_value.values_mut() {
					udis.retain(|u| u != udi);
				}
				by_value.retain(|_, udis| !udis.is_empty());
			}
		}
		for (key, value) in &indexed {
			self.index_insert(udi, key, value);
		}
	}

	/// Drain the pending hook records.
	pub fn take_hooks(&mut self) -> Vec<StoreEvent> {
		self.hooks.drain(..).collect()
	}
}
