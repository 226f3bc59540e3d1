// SPDX-License-Identifier: GPL-2.0

//! End-to-end pipeline scenarios over fixture sysfs trees

use std::fs;
use std::os::unix::fs::symlink;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hald::config::DaemonConfig;
use hald::eventloop::{Daemon, LoopMsg};
use hald::fdi::{Action, MatchTest, RuleBook, RuleFile, RuleNode};
use hald::hotplug::{HotplugAction, HotplugEvent, SysfsClass, SysfsEvent, UeventHints};
use hald::ipc::{BusLink, BusSignal, RecordingBus};
use hald::sync::Receiver;

/// Bus stub shared between the daemon and the test body.
#[derive(Clone, Default)]
struct SharedBus(Arc<Mutex<RecordingBus>>);

impl SharedBus {
	fn signals(&self) -> Vec<BusSignal> {
		self.0.lock().unwrap().signals.clone()
	}

	fn added_udis(&self) -> Vec<String> {
		self.0.lock().unwrap().added_udis()
	}

	fn removed_udis(&self) -> Vec<String> {
		self.0.lock().unwrap().removed_udis()
	}
}

impl BusLink for SharedBus {
	fn device_added(&mut self, udi: &str) {
		self.0.lock().unwrap().device_added(udi);
	}
	fn device_removed(&mut self, udi: &str) {
		self.0.lock().unwrap().device_removed(udi);
	}
	fn property_modified(&mut self, udi: &str, key: &str, added: bool, removed: bool) {
		self.0.lock().unwrap().property_modified(udi, key, added, removed);
	}
	fn capability_added(&mut self, udi: &str, capability: &str) {
		self.0.lock().unwrap().capability_added(udi, capability);
	}
	fn device_lock_acquired(&mut self, udi: &str, lock: &str, owner: &str) {
		self.0.lock().unwrap().device_lock_acquired(udi, lock, owner);
	}
	fn device_lock_released(&mut self, udi: &str, lock: &str, owner: &str) {
		self.0.lock().unwrap().device_lock_released(udi, lock, owner);
	}
	fn manager_lock_acquired(&mut self, lock: &str, owner: &str) {
		self.0.lock().unwrap().manager_lock_acquired(lock, owner);
	}
	fn manager_lock_released(&mut self, lock: &str, owner: &str) {
		self.0.lock().unwrap().manager_lock_released(lock, owner);
	}
	fn condition(&mut self, udi: &str, name: &str, detail: &str) {
		self.0.lock().unwrap().condition(udi, name, detail);
	}
	fn probe_complete(&mut self) {
		self.0.lock().unwrap().probe_complete();
	}
}

struct Rig {
	daemon: Daemon,
	rx: Receiver<LoopMsg>,
	bus: SharedBus,
	root: PathBuf,
}

impl Rig {
	fn new(tag: &str) -> Self {
		Self::with_rules(tag, RuleBook::empty())
	}

	fn with_rules(tag: &str, rules: RuleBook) -> Self {
		let root = std::env::temp_dir().join(format!("hald-pipeline-{}-{}", tag, std::process::id()));
		let _ = fs::remove_dir_all(&root);
		fs::create_dir_all(&root).unwrap();
		// canonical root keeps symlink-target comparisons honest
		let root = root.canonicalize().unwrap();
		for sub in ["sys/devices", "sys/bus", "sys/class", "sys/block", "dev", "proc", "helpers"] {
			fs::create_dir_all(root.join(sub)).unwrap();
		}

		let config = DaemonConfig::new()
			.with_sysfs_root(root.join("sys"))
			.with_proc_root(root.join("proc"));
		let mut config = config;
		config.dev_root = root.join("dev");
		config.helper_dir = root.join("helpers");
		config.hal_mtab_path = root.join("hal-mtab");
		config.slow_helper_timeout = Duration::from_secs(10);

		let bus = SharedBus::default();
		let (mut daemon, rx) = Daemon::new(config, rules, Box::new(bus.clone()));
		daemon.startup();
		Self { daemon, rx, bus, root }
	}

	fn sys(&self, rel: &str) -> String {
		self.root.join("sys").join(rel).to_string_lossy().into_owned()
	}

	fn write_helper(&self, name: &str, script: &str) {
		let path = self.root.join("helpers").join(name);
		fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
		fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
	}

	fn add_event(&mut self, subsystem: &str, rel_path: &str, device_file: Option<&str>) {
		let mut ev = SysfsEvent::new(subsystem, &self.sys(rel_path));
		ev.device_file = device_file.map(|f| f.to_string());
		self.daemon
			.queue
			.enqueue(HotplugEvent::new_sysfs(HotplugAction::Add, ev));
	}

	fn block_event(&mut self, action: HotplugAction, rel_path: &str, device_file: Option<&str>, hints: UeventHints) {
		let mut ev = SysfsEvent::new("block", &self.sys(rel_path));
		ev.class = SysfsClass::Block;
		ev.device_file = device_file.map(|f| f.to_string());
		ev.hints = hints;
		ev.seqnum = 100;
		self.daemon.queue.enqueue(HotplugEvent::new_sysfs(action, ev));
	}

	fn settle(&mut self) {
		self.daemon.process_queue();
		self.daemon.settle(&self.rx);
	}

	fn gdl_udis(&self) -> Vec<String> {
		self.daemon.gdl.udis()
	}
}

fn write_attr(root: &Path, rel: &str, content: &str) {
	let path = root.join(rel);
	fs::create_dir_all(path.parent().unwrap()).unwrap();
	fs::write(path, content).unwrap();
}

/// Fixture for the USB mouse scenario: pci bridge, usb device, interface,
/// evdev node.
fn build_usb_mouse(rig: &Rig) {
	let sys = rig.root.join("sys");
	write_attr(&sys, "devices/pci0000:00/0000:00:1d.0/vendor", "0x8086\n");
	write_attr(&sys, "devices/pci0000:00/0000:00:1d.0/device", "0x24c2\n");
	write_attr(&sys, "devices/pci0000:00/0000:00:1d.0/class", "0x0c0300\n");

	let usb = "devices/pci0000:00/0000:00:1d.0/usb2/2-1";
	write_attr(&sys, &format!("{}/idVendor", usb), "046d\n");
	write_attr(&sys, &format!("{}/idProduct", usb), "c012\n");
	write_attr(&sys, &format!("{}/serial", usb), "ABC\n");

	let usbif = format!("{}/2-1:1.0", usb);
	write_attr(&sys, &format!("{}/bInterfaceNumber", usbif), "00\n");
	write_attr(&sys, &format!("{}/bInterfaceClass", usbif), "03\n");

	let input = format!("{}/input/input5", usbif);
	write_attr(&sys, &format!("{}/name", input), "USB Optical Mouse\n");
	write_attr(&sys, &format!("{}/capabilities/rel", input), "3\n");
	fs::create_dir_all(sys.join(format!("{}/event5", input))).unwrap();
}

const UDI_MOUSE_DEV: &str = "/org/freedesktop/Hal/devices/usb_device_46d_c012_ABC";

#[test]
fn usb_mouse_plug_builds_parent_chain() {
	let mut rig = Rig::new("usb-mouse");
	build_usb_mouse(&rig);

	rig.add_event("pci", "devices/pci0000:00/0000:00:1d.0", None);
	rig.add_event("usb", "devices/pci0000:00/0000:00:1d.0/usb2/2-1", None);
	rig.add_event("usb", "devices/pci0000:00/0000:00:1d.0/usb2/2-1/2-1:1.0", None);
	rig.add_event(
		"input",
		"devices/pci0000:00/0000:00:1d.0/usb2/2-1/2-1:1.0/input/input5/event5",
		Some("/dev/input/event5"),
	);
	rig.settle();

	let udis = rig.gdl_udis();
	assert!(udis.iter().any(|u| u == UDI_MOUSE_DEV));
	let if_udi = format!("{}_if0", UDI_MOUSE_DEV);
	assert!(udis.iter().any(|u| *u == if_udi));
	let input_udi = format!("{}_logicaldev_input", if_udi);
	assert!(udis.iter().any(|u| *u == input_udi));

	let input_dev = rig.daemon.gdl.find(&input_udi).unwrap();
	assert!(input_dev.has_capability("input"));
	assert!(input_dev.has_capability("input.mouse"));
	assert_eq!(input_dev.parent_udi(), Some(if_udi.as_str()));

	let if_dev = rig.daemon.gdl.find(&if_udi).unwrap();
	assert_eq!(if_dev.parent_udi(), Some(UDI_MOUSE_DEV));
	let usb_dev = rig.daemon.gdl.find(UDI_MOUSE_DEV).unwrap();
	assert_eq!(
		usb_dev.parent_udi(),
		Some("/org/freedesktop/Hal/devices/pci_8086_24c2")
	);

	// every published identity stays inside the allowed charset
	for udi in &udis {
		assert!(udi.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '/'));
		assert!(!udi.contains("//"));
	}

	assert_eq!(
		rig.bus.added_udis().iter().filter(|u| **u == input_udi).count(),
		1
	);
}

#[test]
fn sd_card_insert_into_known_reader() {
	let mut rig = Rig::new("sd-card");
	let sys = rig.root.join("sys");
	write_attr(&sys, "devices/platform/sdhci.0/mmc_host/mmc0/.keep", "");
	let card = "devices/platform/sdhci.0/mmc_host/mmc0/mmc0:0001";
	write_attr(&sys, &format!("{}/manfid", card), "0x000002\n");
	write_attr(&sys, &format!("{}/oemid", card), "0x544d\n");
	write_attr(&sys, &format!("{}/cid", card), "02544d5341303447\n");
	write_attr(&sys, &format!("{}/csd", card), "002e00325b5a83a9\n");
	write_attr(&sys, &format!("{}/scr", card), "0225000000000000\n");

	rig.add_event("platform", "devices/platform/sdhci.0", None);
	rig.add_event("mmc_host", "devices/platform/sdhci.0/mmc_host/mmc0", None);
	rig.add_event("mmc", card, None);
	rig.settle();

	let card_udi = rig
		.gdl_udis()
		.into_iter()
		.find(|u| u.ends_with("_mmc_card_rca1"))
		.expect("mmc card published");
	let d = rig.daemon.gdl.find(&card_udi).unwrap();
	assert!(d.has_property("mmc.scr"));
	assert_eq!(d.string_or_empty("info.vendor"), "Unknown (2)");
	assert_eq!(d.string_or_empty("info.product"), "SD Card");
}

/// Fixture for the block scenarios: a scsi disk at /sys/block/sdc whose
/// physical device lives on the platform bus.
fn build_scsi_disk(rig: &Rig) {
	let sys = rig.root.join("sys");
	fs::create_dir_all(sys.join("devices/platform/usb-storage/0:0:0:0")).unwrap();
	write_attr(&sys, "block/sdc/range", "16\n");
	write_attr(&sys, "block/sdc/dev", "8:32\n");
	write_attr(&sys, "block/sdc/size", "15679488\n");
	write_attr(&sys, "block/sdc/removable", "1\n");
	symlink(
		sys.join("devices/platform/usb-storage/0:0:0:0"),
		sys.join("block/sdc/device"),
	)
	.unwrap();
}

fn plug_scsi_disk(rig: &mut Rig, hints: UeventHints) {
	rig.add_event("platform", "devices/platform/usb-storage", None);
	rig.add_event("scsi", "devices/platform/usb-storage/0:0:0:0", None);
	rig.block_event(HotplugAction::Add, "block/sdc", Some("/dev/sdc"), hints);
	rig.settle();
}

#[test]
fn filesystem_on_main_device_spawns_fakevolume() {
	let mut rig = Rig::new("fakevolume");
	build_scsi_disk(&rig);
	rig.write_helper("hald-probe-storage", "exit 2");

	let mut hints = UeventHints::default();
	hints.fs_usage = Some("filesystem".into());
	hints.fs_type = Some("vfat".into());
	plug_scsi_disk(&mut rig, hints);

	let udis = rig.gdl_udis();
	let storage_udi = udis
		.iter()
		.find(|u| {
			rig.daemon
				.gdl
				.find(u)
				.map(|d| d.has_capability("storage"))
				.unwrap_or(false)
		})
		.cloned()
		.expect("storage device published");

	let fake = rig
		.daemon
		.gdl
		.match_first("linux.sysfs_path", &rig.sys("block/sdc/fakevolume"))
		.expect("fakevolume published");
	assert!(fake.bool_or_false("block.is_volume"));
	assert_eq!(fake.string_or_empty("volume.fstype"), "vfat");
	assert_eq!(fake.parent_udi(), Some(storage_udi.as_str()));
}

#[test]
fn probe_failure_destroys_draft() {
	let mut rig = Rig::new("probe-fail");
	build_scsi_disk(&rig);
	rig.write_helper("hald-probe-storage", "exit 1");

	plug_scsi_disk(&mut rig, UeventHints::default());

	assert!(rig
		.daemon
		.gdl
		.match_first("linux.sysfs_path", &rig.sys("block/sdc"))
		.is_none());
	assert!(rig.daemon.tdl.is_empty());
	assert!(rig.daemon.queue.is_idle());
}

#[test]
fn probe_timeout_destroys_draft_and_ends_event() {
	let mut rig = Rig::new("probe-timeout");
	build_scsi_disk(&rig);
	rig.daemon.config.slow_helper_timeout = Duration::from_millis(300);
	rig.write_helper("hald-probe-storage", "sleep 30");

	let started = std::time::Instant::now();
	plug_scsi_disk(&mut rig, UeventHints::default());

	assert!(started.elapsed() < Duration::from_secs(10));
	assert!(rig
		.daemon
		.gdl
		.match_first("linux.sysfs_path", &rig.sys("block/sdc"))
		.is_none());
	assert!(rig.daemon.queue.is_idle());
}

#[test]
fn eject_mounted_stick_removes_child_then_parent() {
	let mut rig = Rig::new("eject");
	build_scsi_disk(&rig);
	rig.write_helper("hald-probe-storage", "exit 2");
	rig.write_helper("umount-hal", "exit 0");

	let mut hints = UeventHints::default();
	hints.fs_type = Some("vfat".into());
	plug_scsi_disk(&mut rig, hints);

	let fake_udi = rig
		.daemon
		.gdl
		.match_first("linux.sysfs_path", &rig.sys("block/sdc/fakevolume"))
		.unwrap()
		.udi()
		.to_string();
	let storage_udi = rig
		.daemon
		.gdl
		.match_first("linux.sysfs_path", &rig.sys("block/sdc"))
		.unwrap()
		.udi()
		.to_string();

	// the volume is mounted when the stick is yanked
	rig.daemon.gdl.set_bool(&fake_udi, "volume.is_mounted", true).unwrap();
	rig.daemon
		.gdl
		.set_string(&fake_udi, "volume.mount_point", "/media/usb")
		.unwrap();

	rig.block_event(HotplugAction::Remove, "block/sdc", None, UeventHints::default());
	rig.settle();

	let removed = rig.bus.removed_udis();
	let fake_pos = removed.iter().position(|u| *u == fake_udi).expect("volume removed");
	let storage_pos = removed.iter().position(|u| *u == storage_udi).expect("storage removed");
	assert!(fake_pos < storage_pos);
	assert!(rig.daemon.gdl.find(&fake_udi).is_none());
	assert!(rig.daemon.gdl.find(&storage_udi).is_none());
}

#[test]
fn duplicate_replug_merges_into_live_device() {
	let mut rig = Rig::new("duplicate");
	build_usb_mouse(&rig);

	rig.add_event("pci", "devices/pci0000:00/0000:00:1d.0", None);
	rig.add_event("usb", "devices/pci0000:00/0000:00:1d.0/usb2/2-1", None);
	rig.settle();

	// same device announces itself again while the old object is live
	rig.add_event("usb", "devices/pci0000:00/0000:00:1d.0/usb2/2-1", None);
	rig.settle();

	let added = rig.bus.added_udis();
	assert_eq!(added.iter().filter(|u| **u == UDI_MOUSE_DEV).count(), 1);
	assert_eq!(
		rig.gdl_udis().iter().filter(|u| u.starts_with(UDI_MOUSE_DEV)).count(),
		1
	);
	assert!(rig.daemon.tdl.is_empty());
}

#[test]
fn add_then_remove_restores_gdl() {
	let mut rig = Rig::new("add-remove");
	build_usb_mouse(&rig);

	rig.add_event("pci", "devices/pci0000:00/0000:00:1d.0", None);
	rig.settle();
	let before = rig.gdl_udis();

	rig.add_event("usb", "devices/pci0000:00/0000:00:1d.0/usb2/2-1", None);
	rig.settle();
	assert_eq!(rig.gdl_udis().len(), before.len() + 1);

	let mut ev = SysfsEvent::new("usb", &rig.sys("devices/pci0000:00/0000:00:1d.0/usb2/2-1"));
	ev.seqnum = 50;
	rig.daemon
		.queue
		.enqueue(HotplugEvent::new_sysfs(HotplugAction::Remove, ev));
	rig.settle();

	assert_eq!(rig.gdl_udis(), before);
}

#[test]
fn missing_parent_drops_event_without_partial_device() {
	let mut rig = Rig::new("no-parent");
	let sys = rig.root.join("sys");
	write_attr(&sys, "devices/pci0000:00/0000:00:1d.0/usb2/2-9/idVendor", "1d6b\n");

	let before = rig.gdl_udis();
	rig.add_event("usb", "devices/pci0000:00/0000:00:1d.0/usb2/2-9", None);
	rig.settle();

	assert_eq!(rig.gdl_udis(), before);
	assert!(rig.daemon.tdl.is_empty());
	assert!(rig.bus.added_udis().is_empty());
}

#[test]
fn preprobe_ignore_hides_device_and_children() {
	let ignore_rule = RuleFile {
		name: "10-ignore.fdi".into(),
		nodes: vec![RuleNode::Match {
			key: "info.subsystem".into(),
			test: MatchTest::Equals("usb_device".into()),
			children: vec![RuleNode::Action(Action::Merge {
				key: "info.ignore".into(),
				value: hald::device::Property::Bool(true),
			})],
		}],
	};
	let mut rules = RuleBook::empty();
	rules.preprobe.push(ignore_rule);

	let mut rig = Rig::with_rules("ignore", rules);
	build_usb_mouse(&rig);

	rig.add_event("pci", "devices/pci0000:00/0000:00:1d.0", None);
	rig.add_event("usb", "devices/pci0000:00/0000:00:1d.0/usb2/2-1", None);
	rig.add_event("usb", "devices/pci0000:00/0000:00:1d.0/usb2/2-1/2-1:1.0", None);
	rig.settle();

	// the usb device is hidden under the sentinel identity
	let hidden = rig
		.daemon
		.gdl
		.match_first("linux.sysfs_path", &rig.sys("devices/pci0000:00/0000:00:1d.0/usb2/2-1"))
		.expect("hidden object kept in store");
	assert!(hidden.bool_or_false("info.ignore"));
	assert_eq!(
		hidden.string_or_empty("info.udi"),
		"/org/freedesktop/Hal/devices/ignored-device"
	);
	assert!(hidden.capabilities().is_empty());

	// the interface below it was dropped entirely
	assert!(rig
		.daemon
		.gdl
		.match_first(
			"linux.sysfs_path",
			&rig.sys("devices/pci0000:00/0000:00:1d.0/usb2/2-1/2-1:1.0")
		)
		.is_none());
}

#[test]
fn policy_pass_effects_visible_at_publication() {
	let policy_rule = RuleFile {
		name: "20-policy.fdi".into(),
		nodes: vec![RuleNode::Match {
			key: "info.subsystem".into(),
			test: MatchTest::Equals("pci".into()),
			children: vec![RuleNode::Action(Action::Merge {
				key: "policy.marker".into(),
				value: hald::device::Property::String("applied".into()),
			})],
		}],
	};
	let mut rules = RuleBook::empty();
	rules.policy.push(policy_rule);

	let mut rig = Rig::with_rules("policy", rules);
	build_usb_mouse(&rig);
	rig.add_event("pci", "devices/pci0000:00/0000:00:1d.0", None);
	rig.settle();

	let d = rig
		.daemon
		.gdl
		.find("/org/freedesktop/Hal/devices/pci_8086_24c2")
		.unwrap();
	assert_eq!(d.string_or_empty("policy.marker"), "applied");
}

#[test]
fn coldplug_fixture_publishes_tree_and_signals_probe_complete() {
	let mut rig = Rig::new("coldplug");
	build_usb_mouse(&rig);
	let sys = rig.root.join("sys");
	fs::create_dir_all(sys.join("bus/pci/devices")).unwrap();
	fs::create_dir_all(sys.join("bus/usb/devices")).unwrap();
	symlink(
		sys.join("devices/pci0000:00/0000:00:1d.0"),
		sys.join("bus/pci/devices/0000:00:1d.0"),
	)
	.unwrap();
	symlink(
		sys.join("devices/pci0000:00/0000:00:1d.0/usb2/2-1"),
		sys.join("bus/usb/devices/2-1"),
	)
	.unwrap();

	for event in hald::coldplug::synthesize_events(&rig.daemon.config) {
		rig.daemon.queue.enqueue(event);
	}
	rig.settle();

	assert!(rig.gdl_udis().iter().any(|u| u == UDI_MOUSE_DEV));
	assert!(rig
		.bus
		.signals()
		.iter()
		.any(|s| matches!(s, BusSignal::ProbeComplete)));
}
