// SPDX-License-Identifier: GPL-2.0

//! Mount table surveillance and daemon-performed mount bookkeeping

use std::fs;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::store::DeviceStore;
use crate::sync::Sender;

bitflags::bitflags! {
	/// Mount flags recovered from the options column
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct MountFlags: u32 {
		const RDONLY = 0x01;
		const NOSUID = 0x02;
		const NODEV = 0x04;
		const NOEXEC = 0x08;
	}
}

/// One row of /proc/mounts
#[derive(Debug, Clone, PartialEq)]
pub struct MountRow {
	pub device: String,
	pub mount_point: String,
	pub fstype: String,
	pub options: Vec<String>,
}

impl MountRow {
	pub fn flags(&self) -> MountFlags {
		let mut flags = MountFlags::empty();
		for option in &self.options {
			match option.as_str() {
				"ro" => flags |= MountFlags::RDONLY,
				"nosuid" => flags |= MountFlags::NOSUID,
				"nodev" => flags |= MountFlags::NODEV,
				"noexec" => flags |= MountFlags::NOEXEC,
				_ => {}
			}
		}
		flags
	}

	pub fn is_read_only(&self) -> bool {
		self.flags().contains(MountFlags::RDONLY)
	}
}

/// Undo the octal escapes mount tables use for whitespace in paths.
fn unescape_mount_field(s: &str) -> String {
	let bytes = s.as_bytes();
	let mut out = Vec::with_capacity(bytes.len());
	let mut i = 0;
	while i < bytes.len() {
		if bytes[i] == b'\\' && i + 3 < bytes.len() {
			let octal = &s[i + 1..i + 4];
			if let Ok(v) = u8::from_str_radix(octal, 8) {
				out.push(v);
				i += 4;
				continue;
			}
		}
		out.push(bytes[i]);
		i += 1;
	}
	String::from_utf8_lossy(&out).into_owned()
}

/// Parse the whole mount table text.
pub fn parse_mounts(content: &str) -> Vec<MountRow> {
	let mut rows = Vec::new();
	for line in content.lines() {
		let fields: Vec<&str> = line.split_whitespace().collect();
		if fields.len() < 4 {
			continue;
		}
		rows.push(MountRow {
			device: unescape_mount_field(fields[0]),
			mount_point: unescape_mount_field(fields[1]),
			fstype: fields[2].to_string(),
			options: fields[3].split(',').map(|o| o.to_string()).collect(),
		});
	}
	rows
}

fn dev_major(dev: u64) -> i64 {
	(((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfffu64)) as i64
}

fn dev_minor(dev: u64) -> i64 {
	((dev & 0xff) | ((dev >> 12) & !0xffu64)) as i64
}

/// Device numbers of a block special file, via stat.
pub fn device_numbers(path: &str) -> Option<(i64, i64)> {
	let meta = fs::metadata(path).ok()?;
	use std::os::unix::fs::MetadataExt;
	let rdev = meta.rdev();
	if rdev == 0 {
		return None;
	}
	Some((dev_major(rdev), dev_minor(rdev)))
}

/// Result of one mount-table synchronization pass
#[derive(Debug, Default, PartialEq)]
pub struct MountSync {
	/// Mount points recorded in the hal-mtab that just disappeared; the
	/// caller owes each one a cleanup helper run.
	pub hald_unmounted: Vec<String>,
}

fn find_volume_udi(gdl: &DeviceStore, row: &MountRow, numbers: Option<(i64, i64)>) -> Option<String> {
	if let Some((major, minor)) = numbers {
		for d in gdl.devices() {
			if d.bool_or_false("block.is_volume")
				&& d.get_int("block.major").ok() == Some(major)
				&& d.get_int("block.minor").ok() == Some(minor)
			{
				return Some(d.udi().to_string());
			}
		}
	}
	gdl.devices()
		.find(|d| d.bool_or_false("block.is_volume") && d.string_or_empty("block.device") == row.device)
		.map(|d| d.udi().to_string())
}

/// Re-synchronize every known volume with a freshly parsed mount table.
///
/// Rows whose filesystem type is in the ignore list are skipped before any
/// stat; a stale network mount must never block the loop.
pub fn sync_with_table(
	gdl: &mut DeviceStore,
	rows: &[MountRow],
	ignore_fstypes: &[String],
	hald_mounts: &[MtabRecord],
) -> MountSync {
	let mut seen: Vec<(String, MountRow)> = Vec::new();

	for row in rows {
		if ignore_fstypes.iter().any(|t| t == &row.fstype) {
			continue;
		}
		let numbers = device_numbers(&row.device);
		if let Some(udi) = find_volume_udi(gdl, row, numbers) {
			seen.push((udi, row.clone()));
		}
	}

	let volume_udis: Vec<String> = gdl
		.devices()
		.filter(|d| d.bool_or_false("block.is_volume"))
		.map(|d| d.udi().to_string())
		.collect();

	let mut outcome = MountSync::default();

	for udi in volume_udis {
		match seen.iter().find(|(u, _)| *u == udi) {
			Some((_, row)) => {
				let _ = gdl.set_bool(&udi, "volume.is_mounted", true);
				let _ = gdl.set_string(&udi, "volume.mount_point", &row.mount_point);
				let _ = gdl.set_string(&udi, "volume.fstype", &row.fstype);
				let _ = gdl.set_bool(&udi, "volume.is_mounted_read_only", row.is_read_only());
			}
			None => {
				let was_mounted = gdl
					.find(&udi)
					.map(|d| d.bool_or_false("volume.is_mounted"))
					.unwrap_or(false);
				if !was_mounted {
					continue;
				}
				let mount_point = gdl
					.find(&udi)
					.map(|d| d.string_or_empty("volume.mount_point").to_string())
					.unwrap_or_default();
				let _ = gdl.set_bool(&udi, "volume.is_mounted", false);
				let _ = gdl.set_bool(&udi, "volume.is_mounted_read_only", false);
				let _ = gdl.remove_property(&udi, "volume.mount_point");
				if hald_mounts.iter().any(|r| r.mount_point == mount_point) {
					outcome.hald_unmounted.push(mount_point);
				}
			}
		}
	}

	outcome
}

/// One record of the hal-mtab file: a mount performed by the daemon itself
#[derive(Debug, Clone, PartialEq)]
pub struct MtabRecord {
	pub device: String,
	pub uid: u32,
	pub session: String,
	pub fstype: String,
	pub options: String,
	pub mount_point: String,
}

/// Parse the hal-mtab format: six tab-separated fields, `#` comments.
pub fn parse_hal_mtab(content: &str) -> Vec<MtabRecord> {
	let mut records = Vec::new();
	for line in content.lines() {
		let line = line.trim();
		if line.is_empty() || line.starts_with('#') {
			continue;
		}
		let fields: Vec<&str> = line.split('\t').collect();
		if fields.len() != 6 {
			crate::warn!("malformed hal-mtab line: {}", line);
			continue;
		}
		let uid = match fields[1].parse() {
			Ok(uid) => uid,
			Err(_) => continue,
		};
		records.push(MtabRecord {
			device: fields[0].to_string(),
			uid,
			session: fields[2].to_string(),
			fstype: fields[3].to_string(),
			options: fields[4].to_string(),
			mount_point: fields[5].to_string(),
		});
	}
	records
}

pub fn load_hal_mtab(path: &Path) -> Vec<MtabRecord> {
	match fs::read_to_string(path) {
		Ok(content) => parse_hal_mtab(&content),
		Err(_) => Vec::new(),
	}
}

pub fn store_hal_mtab(path: &Path, records: &[MtabRecord]) -> std::io::Result<()> {
	let mut out = String::new();
	for r in records {
		out.push_str(&format!(
			"{}\t{}\t{}\t{}\t{}\t{}\n",
			r.device, r.uid, r.session, r.fstype, r.options, r.mount_point
		));
	}
	if let Some(parent) = path.parent() {
		let _ = fs::create_dir_all(parent);
	}
	fs::write(path, out)
}

/// Messages a watcher thread pushes into the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
	Mounts,
	Mdstat,
}

/// Watch a /proc table for exceptional readiness and translate each change
/// into a loop message. Runs until the channel closes. The change is acted
/// on from the loop thread, never from here.
pub fn watch_proc_file(path: PathBuf, kind: WatchKind, tx: Sender<crate::eventloop::LoopMsg>) {
	let file = match fs::File::open(&path) {
		Ok(f) => f,
		Err(e) => {
			crate::warn!("cannot watch {}: {}", path.display(), e);
			return;
		}
	};
	let fd = file.as_raw_fd();

	loop {
		let mut pfd = libc::pollfd {
			fd,
			events: libc::POLLPRI,
			revents: 0,
		};
		let rc = unsafe { libc::poll(&mut pfd, 1, -1) };
		if rc < 0 {
			let err = std::io::Error::last_os_error();
			if err.kind() == std::io::ErrorKind::Interrupted {
				continue;
			}
			crate::warn!("poll on {} failed: {}", path.display(), err);
			return;
		}
		if pfd.revents & (libc::POLLPRI | libc::POLLERR) != 0 {
			// consume the current table so the next change re-arms
			let _ = fs::read_to_string(&path);
			if tx.send(crate::eventloop::LoopMsg::ProcTableChanged(kind)).is_err() {
				return;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::device::Device;

	#[test]
	fn parses_mount_rows_with_escapes() {
		let rows = parse_mounts(
			"/dev/sda1 / ext3 rw,relatime 0 0\n\
			 /dev/sdc1 /media/usb\\040stick vfat ro,nosuid 0 0\n\
			 broken line\n",
		);
		assert_eq!(rows.len(), 2);
		assert_eq!(rows[1].mount_point, "/media/usb stick");
		assert!(rows[1].is_read_only());
		assert!(rows[1].flags().contains(MountFlags::NOSUID));
		assert!(!rows[0].is_read_only());
	}

	fn gdl_with_volume(udi: &str, device: &str) -> DeviceStore {
		let keys = vec!["linux.sysfs_path".to_string(), "block.device".to_string()];
		let mut gdl = DeviceStore::new("gdl", &keys);
		let mut d = Device::new();
		d.set_udi(udi);
		d.set_bool("block.is_volume", true);
		d.set_string("block.device", device);
		d.set_bool("volume.is_mounted", false);
		gdl.add(d).unwrap();
		gdl
	}

	#[test]
	fn volume_mount_state_follows_table() {
		let mut gdl = gdl_with_volume("/vol", "/dev/hald-test-sdc1");
		let rows = parse_mounts("/dev/hald-test-sdc1 /media/usb vfat rw 0 0\n");
		sync_with_table(&mut gdl, &rows, &[], &[]);
		let d = gdl.find("/vol").unwrap();
		assert!(d.bool_or_false("volume.is_mounted"));
		assert_eq!(d.string_or_empty("volume.mount_point"), "/media/usb");
		assert_eq!(d.string_or_empty("volume.fstype"), "vfat");

		// row disappears: unmounted
		let outcome = sync_with_table(&mut gdl, &[], &[], &[]);
		let d = gdl.find("/vol").unwrap();
		assert!(!d.bool_or_false("volume.is_mounted"));
		assert!(!d.has_property("volume.mount_point"));
		assert!(outcome.hald_unmounted.is_empty());
	}

	#[test]
	fn ignored_fstypes_are_skipped_before_stat() {
		let mut gdl = gdl_with_volume("/vol", "server:/export");
		let rows = parse_mounts("server:/export /mnt/nfs nfs rw 0 0\n");
		sync_with_table(&mut gdl, &rows, &["nfs".to_string()], &[]);
		assert!(!gdl.find("/vol").unwrap().bool_or_false("volume.is_mounted"));
	}

	#[test]
	fn hald_performed_mount_triggers_cleanup_on_unmount() {
		let mut gdl = gdl_with_volume("/vol", "/dev/hald-test-sdc1");
		let rows = parse_mounts("/dev/hald-test-sdc1 /media/usb vfat rw 0 0\n");
		let records = vec![MtabRecord {
			device: "/dev/hald-test-sdc1".into(),
			uid: 500,
			session: "s1".into(),
			fstype: "vfat".into(),
			options: "rw".into(),
			mount_point: "/media/usb".into(),
		}];
		sync_with_table(&mut gdl, &rows, &[], &records);
		let outcome = sync_with_table(&mut gdl, &[], &[], &records);
		assert_eq!(outcome.hald_unmounted, vec!["/media/usb".to_string()]);
	}

	#[test]
	fn hal_mtab_round_trip() {
		let content = "# mounts performed by hald\n\
			/dev/sdc1\t500\tsession1\tvfat\trw,nosuid\t/media/usb\n\
			bad line without tabs\n";
		let records = parse_hal_mtab(content);
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].uid, 500);
		assert_eq!(records[0].mount_point, "/media/usb");

		let path = std::env::temp_dir().join(format!("hald-mtab-test-{}", std::process::id()));
		store_hal_mtab(&path, &records).unwrap();
		let reloaded = load_hal_mtab(&path);
		assert_eq!(reloaded, records);
	}
}
