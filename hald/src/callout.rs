// SPDX-License-Identifier: GPL-2.0

//! Callout chains and long-lived addon processes

use std::collections::HashMap;

use crate::device::Device;

/// Lifecycle transition a callout chain belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalloutAction {
	Add,
	Remove,
	Preprobe,
}

impl CalloutAction {
	pub fn as_str(&self) -> &'static str {
		match self {
			CalloutAction::Add => "add",
			CalloutAction::Remove => "remove",
			CalloutAction::Preprobe => "preprobe",
		}
	}

	pub fn property(&self) -> &'static str {
		match self {
			CalloutAction::Add => "info.callouts.add",
			CalloutAction::Remove => "info.callouts.remove",
			CalloutAction::Preprobe => "info.callouts.preprobe",
		}
	}
}

/// The scripts a device declares for one transition, in declared order.
pub fn programs_for(d: &Device, action: CalloutAction) -> Vec<String> {
	d.get_strlist(action.property())
		.map(|l| l.to_vec())
		.unwrap_or_default()
}

/// Addon declarations of a device: (program line, singleton flag).
pub fn addons_for(d: &Device) -> Vec<(String, bool)> {
	let mut addons = Vec::new();
	if let Ok(list) = d.get_strlist("info.addons") {
		for program in list {
			addons.push((program.clone(), false));
		}
	}
	if let Ok(list) = d.get_strlist("info.addons.singleton") {
		for program in list {
			addons.push((program.clone(), true));
		}
	}
	addons
}

/// Split a declared command line into program and arguments.
pub fn split_command_line(line: &str) -> Option<(String, Vec<String>)> {
	let mut parts = line.split_whitespace();
	let program = parts.next()?.to_string();
	let args = parts.map(|a| a.to_string()).collect();
	Some((program, args))
}

/// State of one running singleton addon shared by several devices.
#[derive(Debug)]
struct Singleton {
	token: u64,
	refcount: u32,
	devices: Vec<String>,
}

/// Bookkeeping for addon processes: which runner token belongs to which
/// device, and reference counts for singletons.
#[derive(Debug, Default)]
pub struct AddonManager {
	/// token -> owning device UDI (per-device addons)
	tokens: HashMap<u64, String>,
	/// program line -> running singleton
	singletons: HashMap<String, Singleton>,
}

impl AddonManager {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, token: u64, udi: &str) {
		self.tokens.insert(token, udi.to_string());
	}

	/// Device UDI a dying addon belonged to, unregistering it.
	pub fn unregister(&mut self, token: u64) -> Option<String> {
		self.tokens.remove(&token)
	}

	pub fn owner_of(&self, token: u64) -> Option<&str> {
		self.tokens.get(&token).map(|s| s.as_str())
	}

	/// Take a reference on a singleton addon. Returns true when the caller
	/// must actually spawn it (first reference).
	pub fn singleton_ref(&mut self, program: &str, udi: &str) -> bool {
		match self.singletons.get_mut(program) {
			Some(s) => {
				s.refcount += 1;
				s.devices.push(udi.to_string());
				false
			}
			None => {
				self.singletons.insert(
					program.to_string(),
					Singleton {
						token: 0,
						refcount: 1,
						devices: vec![udi.to_string()],
					},
				);
				true
			}
		}
	}

	pub fn singleton_started(&mut self, program: &str, token: u64) {
		if let Some(s) = self.singletons.get_mut(program) {
			s.token = token;
		}
	}

	/// Drop a device's reference. Returns the runner token to cancel when
	/// the last reference went away.
	pub fn singleton_unref(&mut self, program: &str, udi: &str) -> Option<u64> {
		let gone = match self.singletons.get_mut(program) {
			Some(s) => {
				s.refcount = s.refcount.saturating_sub(1);
				s.devices.retain(|d| d != udi);
				s.refcount == 0
			}
			None => false,
		};
		if gone {
			self.singletons.remove(program).map(|s| s.token)
		} else {
			None
		}
	}

	/// Singleton programs a device holds references on.
	pub fn singletons_of(&self, udi: &str) -> Vec<String> {
		self.singletons
			.iter()
			.filter(|(_, s)| s.devices.iter().any(|d| d == udi))
			.map(|(p, _)| p.clone())
			.collect()
	}

	/// A dead singleton is forgotten entirely.
	pub fn singleton_died(&mut self, token: u64) -> Option<String> {
		let program = self
			.singletons
			.iter()
			.find(|(_, s)| s.token == token)
			.map(|(p, _)| p.clone())?;
		self.singletons.remove(&program);
		Some(program)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn programs_follow_declaration_order() {
		let mut d = Device::new();
		d.strlist_append("info.callouts.add", "hal-acl-tool --add").unwrap();
		d.strlist_append("info.callouts.add", "custom-hook").unwrap();
		assert_eq!(
			programs_for(&d, CalloutAction::Add),
			vec!["hal-acl-tool --add", "custom-hook"]
		);
		assert!(programs_for(&d, CalloutAction::Remove).is_empty());
	}

	#[test]
	fn command_line_splitting() {
		let (program, args) = split_command_line("hal-acl-tool --add --device /dev/sdc").unwrap();
		assert_eq!(program, "hal-acl-tool");
		assert_eq!(args, vec!["--add", "--device", "/dev/sdc"]);
		assert!(split_command_line("   ").is_none());
	}

	#[test]
	fn singleton_refcounting() {
		let mut mgr = AddonManager::new();
		assert!(mgr.singleton_ref("hald-addon-storage", "/a"));
		mgr.singleton_started("hald-addon-storage", 7);
		assert!(!mgr.singleton_ref("hald-addon-storage", "/b"));

		assert_eq!(mgr.singleton_unref("hald-addon-storage", "/a"), None);
		assert_eq!(mgr.singleton_unref("hald-addon-storage", "/b"), Some(7));
		// gone now; a new reference spawns again
		assert!(mgr.singleton_ref("hald-addon-storage", "/c"));
	}

	#[test]
	fn addon_token_ownership() {
		let mut mgr = AddonManager::new();
		mgr.register(3, "/a");
		assert_eq!(mgr.owner_of(3), Some("/a"));
		assert_eq!(mgr.unregister(3).as_deref(), Some("/a"));
		assert_eq!(mgr.unregister(3), None);
	}
}
