// SPDX-License-Identifier: GPL-2.0

//! Probe helper contract
//!
//! Probe helpers and callouts are short-lived subprocesses. The daemon
//! hands them their target device through the environment: `UDI`,
//! `HALD_ACTION` for callouts, and one `HAL_PROP_*` variable per device
//! property. Results travel back through the exit code.

use std::collections::HashMap;

pub use hald::runner::HELPER_EXIT_FS_ON_MAIN_DEVICE;

/// Exit code for a successful probe
pub const EXIT_SUCCESS: i32 = 0;
/// Generic failure; the daemon discards the device draft
pub const EXIT_FAILURE: i32 = 1;

/// Environment name a property key is exported under.
pub fn env_name_for(key: &str) -> String {
	format!(
		"HAL_PROP_{}",
		key.to_uppercase().replace('.', "_").replace('-', "_")
	)
}

/// The environment a helper was invoked with.
#[derive(Debug, Clone)]
pub struct HelperContext {
	pub udi: String,
	pub action: Option<String>,
	props: HashMap<String, String>,
}

impl HelperContext {
	/// Collect the contract variables from the process environment.
	/// Returns None when no UDI was passed; a helper run outside the
	/// daemon has nothing to probe.
	pub fn from_env() -> Option<Self> {
		let udi = std::env::var("UDI").ok()?;
		let action = std::env::var("HALD_ACTION").ok();
		let mut props = HashMap::new();
		for (key, value) in std::env::vars() {
			if let Some(rest) = key.strip_prefix("HAL_PROP_") {
				props.insert(rest.to_string(), value);
			}
		}
		Some(Self { udi, action, props })
	}

	/// Property value by its dotted key.
	pub fn prop(&self, key: &str) -> Option<&str> {
		let env_key = env_name_for(key);
		self.props
			.get(env_key.strip_prefix("HAL_PROP_").unwrap_or(&env_key))
			.map(|s| s.as_str())
	}

	pub fn sysfs_path(&self) -> Option<&str> {
		self.prop("linux.sysfs_path")
	}

	pub fn device_file(&self) -> Option<&str> {
		self.prop("linux.device_file")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn env_name_mangling() {
		assert_eq!(env_name_for("linux.sysfs_path"), "HAL_PROP_LINUX_SYSFS_PATH");
		assert_eq!(env_name_for("usb_device.vendor_id"), "HAL_PROP_USB_DEVICE_VENDOR_ID");
		assert_eq!(env_name_for("net.80203.mac-address"), "HAL_PROP_NET_80203_MAC_ADDRESS");
	}
}
