// SPDX-License-Identifier: GPL-2.0

//! Daemon configuration

use std::path::PathBuf;
use std::time::Duration;

use once_cell::sync::OnceCell;

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
	/// Root of the sysfs tree, normally `/sys`
	pub sysfs_root: PathBuf,
	/// Root of the proc tree, normally `/proc`
	pub proc_root: PathBuf,
	/// Root of the device node tree, normally `/dev`
	pub dev_root: PathBuf,
	/// Rule directories for the preprobe pass, in load order
	pub fdi_preprobe_dirs: Vec<PathBuf>,
	/// Rule directories for the information pass, in load order
	pub fdi_information_dirs: Vec<PathBuf>,
	/// Rule directories for the policy pass, in load order
	pub fdi_policy_dirs: Vec<PathBuf>,
	/// Directory searched for probe helpers and callouts
	pub helper_dir: PathBuf,
	/// Hard deadline for probe helpers
	pub helper_timeout: Duration,
	/// Deadline for helpers known to be slow
	pub slow_helper_timeout: Duration,
	/// ACPI poll cadence
	pub acpi_poll_interval: Duration,
	/// APM poll cadence
	pub apm_poll_interval: Duration,
	/// PMU poll cadence
	pub pmu_poll_interval: Duration,
	/// Filesystem types never stat'ed by the mount monitor
	pub mount_ignore_fstypes: Vec<String>,
	/// Record of mounts performed by the daemon itself
	pub hal_mtab_path: PathBuf,
	/// Abstract-namespace name of the uevent socket
	pub uevent_socket_name: String,
	/// Index these property keys in the device stores
	pub indexed_keys: Vec<String>,
}

impl DaemonConfig {
	pub fn new() -> Self {
		let fdi_base = PathBuf::from("/usr/share/hal/fdi");
		Self {
			sysfs_root: PathBuf::from("/sys"),
			proc_root: PathBuf::from("/proc"),
			dev_root: PathBuf::from("/dev"),
			fdi_preprobe_dirs: vec![fdi_base.join("preprobe")],
			fdi_information_dirs: vec![fdi_base.join("information")],
			fdi_policy_dirs: vec![fdi_base.join("policy")],
			helper_dir: PathBuf::from("/usr/libexec/hal"),
			helper_timeout: Duration::from_secs(10),
			slow_helper_timeout: Duration::from_secs(60),
			acpi_poll_interval: Duration::from_secs(30),
			apm_poll_interval: Duration::from_secs(2),
			pmu_poll_interval: Duration::from_secs(2),
			mount_ignore_fstypes: vec![
				"nfs".into(),
				"nfs4".into(),
				"cifs".into(),
				"smbfs".into(),
				"autofs".into(),
			],
			hal_mtab_path: PathBuf::from("/var/run/hald/hal-mtab"),
			uevent_socket_name: "/org/freedesktop/hal/udev_event".into(),
			indexed_keys: vec!["linux.sysfs_path".into(), "block.device".into()],
		}
	}

	pub fn with_sysfs_root(mut self, root: PathBuf) -> Self {
		self.sysfs_root = root;
		self
	}

	pub fn with_proc_root(mut self, root: PathBuf) -> Self {
		self.proc_root = root;
		self
	}

	pub fn with_fdi_dirs(mut self, preprobe: Vec<PathBuf>, information: Vec<PathBuf>, policy: Vec<PathBuf>) -> Self {
		self.fdi_preprobe_dirs = preprobe;
		self.fdi_information_dirs = information;
		self.fdi_policy_dirs = policy;
		self
	}

	pub fn with_helper_timeout(mut self, timeout: Duration) -> Self {
		self.helper_timeout = timeout;
		self
	}

	/// Apply `HALD_*` environment overrides
	pub fn from_env(mut self) -> Self {
		if let Ok(v) = std::env::var("HALD_SYSFS_ROOT") {
			self.sysfs_root = PathBuf::from(v);
		}
		if let Ok(v) = std::env::var("HALD_PROC_ROOT") {
			self.proc_root = PathBuf::from(v);
		}
		if let Ok(v) = std::env::var("HALD_HELPER_DIR") {
			self.helper_dir = PathBuf::from(v);
		}
		if let Ok(v) = std::env::var("HALD_HELPER_TIMEOUT_SECS") {
			if let Ok(secs) = v.parse::<u64>() {
				self.helper_timeout = Duration::from_secs(secs);
			}
		}
		if let Ok(v) = std::env::var("HALD_FDI_DIR") {
			let base = PathBuf::from(v);
			self.fdi_preprobe_dirs = vec![base.join("preprobe")];
			self.fdi_information_dirs = vec![base.join("information")];
			self.fdi_policy_dirs = vec![base.join("policy")];
		}
		if let Ok(v) = std::env::var("HALD_MTAB") {
			self.hal_mtab_path = PathBuf::from(v);
		}
		self
	}
}

impl Default for DaemonConfig {
	fn default() -> Self {
		Self::new()
	}
}

/// Process-wide configuration, set once at startup
static CONFIG: OnceCell<DaemonConfig> = OnceCell::new();

/// Install the process-wide configuration
pub fn set_config(config: DaemonConfig) -> bool {
	CONFIG.set(config).is_ok()
}

/// Get the process-wide configuration, or defaults if never installed
pub fn get_config() -> &'static DaemonConfig {
	CONFIG.get_or_init(DaemonConfig::new)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn builder_overrides_roots() {
		let c = DaemonConfig::new().with_sysfs_root(PathBuf::from("/tmp/sys"));
		assert_eq!(c.sysfs_root, PathBuf::from("/tmp/sys"));
		assert_eq!(c.proc_root, PathBuf::from("/proc"));
	}

	#[test]
	fn default_ignores_network_fstypes() {
		let c = DaemonConfig::new();
		assert!(c.mount_ignore_fstypes.iter().any(|t| t == "nfs"));
	}
}
