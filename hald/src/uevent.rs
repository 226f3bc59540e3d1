// SPDX-License-Identifier: GPL-2.0

//! Kernel uevent source: datagram socket frames from the udev relay

use std::mem;
use std::os::unix::io::RawFd;

use crate::config::DaemonConfig;
use crate::error::{Error, Result};
use crate::hotplug::{HotplugAction, SysfsEvent};
use crate::sync::Sender;

fn decode_escape_bytes(s: &str) -> Vec<u8> {
	let bytes = s.as_bytes();
	let mut out = Vec::with_capacity(bytes.len());
	let mut i = 0;
	while i < bytes.len() {
		if bytes[i] == b'\\' && i + 3 < bytes.len() && bytes[i + 1] == b'x' {
			if let Ok(v) = u8::from_str_radix(&s[i + 2..i + 4], 16) {
				out.push(v);
				i += 4;
				continue;
			}
		}
		out.push(bytes[i]);
		i += 1;
	}
	out
}

/// Decode the `\xNN` escapes the relay applies to property values.
pub fn decode_escapes(s: &str) -> String {
	String::from_utf8_lossy(&decode_escape_bytes(s)).into_owned()
}

/// A decoded value: unescaped, then UTF-8 validated. Invalid values are
/// dropped to empty rather than poisoning the device graph.
fn clean_value(raw: &str) -> String {
	let decoded = decode_escape_bytes(raw);
	match String::from_utf8(decoded) {
		Ok(s) if s.bytes().all(|b| b != 0) => s,
		_ => String::new(),
	}
}

/// Parse one newline-separated KEY=VALUE frame into a hotplug event.
pub fn parse_frame(data: &[u8], config: &DaemonConfig) -> Result<(HotplugAction, SysfsEvent)> {
	let text = std::str::from_utf8(data).map_err(|_| Error::ParseError)?;

	let mut action = None;
	let mut devpath = None;
	let mut subsystem = None;
	let mut seqnum = None;
	let mut devname = None;
	let mut devpath_old = None;
	let mut ifindex = None;
	let mut hints = crate::hotplug::UeventHints::default();

	for line in text.split('\n') {
		let line = line.trim_end_matches('\0');
		if line.is_empty() {
			continue;
		}
		let (key, raw) = match line.split_once('=') {
			Some(kv) => kv,
			None => continue,
		};
		let value = clean_value(raw);
		match key {
			"ACTION" => action = HotplugAction::parse(&value),
			"DEVPATH" => devpath = Some(value),
			"SUBSYSTEM" => subsystem = Some(value),
			"SEQNUM" => seqnum = value.parse::<u64>().ok(),
			"DEVNAME" => devname = Some(value),
			"DEVPATH_OLD" => devpath_old = Some(value),
			"IFINDEX" => ifindex = value.parse::<u32>().ok(),
			"ID_VENDOR" => hints.vendor = Some(value),
			"ID_MODEL" => hints.model = Some(value),
			"ID_REVISION" => hints.revision = Some(value),
			"ID_SERIAL" => hints.serial = Some(value),
			"ID_FS_USAGE" => hints.fs_usage = Some(value),
			"ID_FS_TYPE" => hints.fs_type = Some(value),
			"ID_FS_VERSION" => hints.fs_version = Some(value),
			"ID_FS_UUID" => hints.fs_uuid = Some(value),
			"ID_FS_LABEL_ENC" => hints.fs_label = Some(value),
			_ => {}
		}
	}

	let action = action.ok_or(Error::ParseError)?;
	let devpath = devpath.filter(|p| !p.is_empty()).ok_or(Error::ParseError)?;
	let subsystem = subsystem.filter(|s| !s.is_empty()).ok_or(Error::ParseError)?;
	let seqnum = seqnum.ok_or(Error::ParseError)?;

	let sysfs_path = format!("{}{}", config.sysfs_root.display(), devpath);
	let mut event = SysfsEvent::new(&subsystem, &sysfs_path);
	event.seqnum = seqnum;
	event.net_ifindex = ifindex;
	event.hints = hints;
	event.device_file = devname.filter(|n| !n.is_empty()).map(|n| {
		if n.starts_with('/') {
			n
		} else {
			format!("{}/{}", config.dev_root.display(), n)
		}
	});
	event.sysfs_path_old = devpath_old
		.filter(|p| !p.is_empty())
		.map(|p| format!("{}{}", config.sysfs_root.display(), p));

	Ok((action, event))
}

fn make_abstract_socket(name: &str) -> Result<RawFd> {
	unsafe {
		let fd = libc::socket(libc::AF_UNIX, libc::SOCK_DGRAM, 0);
		if fd < 0 {
			return Err(Error::Io);
		}

		let mut addr: libc::sockaddr_un = mem::zeroed();
		addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
		// abstract namespace: leading NUL, then the name
		let name_bytes = name.as_bytes();
		let max = addr.sun_path.len() - 1;
		let len = name_bytes.len().min(max);
		for (i, b) in name_bytes[..len].iter().enumerate() {
			addr.sun_path[i + 1] = *b as libc::c_char;
		}
		let addr_len = (mem::size_of::<libc::sa_family_t>() + 1 + len) as libc::socklen_t;

		if libc::bind(fd, &addr as *const _ as *const libc::sockaddr, addr_len) < 0 {
			libc::close(fd);
			return Err(Error::Io);
		}

		let one: libc::c_int = 1;
		if libc::setsockopt(
			fd,
			libc::SOL_SOCKET,
			libc::SO_PASSCRED,
			&one as *const _ as *const libc::c_void,
			mem::size_of::<libc::c_int>() as libc::socklen_t,
		) < 0
		{
			libc::close(fd);
			return Err(Error::Io);
		}

		Ok(fd)
	}
}

/// Receive one datagram with its sender credentials.
fn recv_with_creds(fd: RawFd, buf: &mut [u8]) -> Result<(usize, Option<libc::ucred>)> {
	unsafe {
		let mut iov = libc::iovec {
			iov_base: buf.as_mut_ptr() as *mut libc::c_void,
			iov_len: buf.len(),
		};
		let mut cmsg_space = [0u8; 64];
		let mut msg: libc::msghdr = mem::zeroed();
		msg.msg_iov = &mut iov;
		msg.msg_iovlen = 1;
		msg.msg_control = cmsg_space.as_mut_ptr() as *mut libc::c_void;
		msg.msg_controllen = cmsg_space.len();

		let n = libc::recvmsg(fd, &mut msg, 0);
		if n < 0 {
			return Err(Error::Io);
		}

		let mut creds = None;
		let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
		while !cmsg.is_null() {
			if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_CREDENTIALS {
				let data = libc::CMSG_DATA(cmsg) as *const libc::ucred;
				creds = Some(*data);
			}
			cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
		}

		Ok((n as usize, creds))
	}
}

/// Listen for uevent frames and push each accepted one into the loop.
/// Frames from senders other than uid 0 are dropped on the floor; so are
/// frames that fail to parse.
pub fn listen(config: DaemonConfig, tx: Sender<crate::eventloop::LoopMsg>) {
	let fd = match make_abstract_socket(&config.uevent_socket_name) {
		Ok(fd) => fd,
		Err(e) => {
			crate::error!("cannot bind uevent socket {}: {}", config.uevent_socket_name, e);
			return;
		}
	};
	crate::info!("listening for uevents on @{}", config.uevent_socket_name);

	let mut buf = vec![0u8; 64 * 1024];
	loop {
		let (n, creds) = match recv_with_creds(fd, &mut buf) {
			Ok(r) => r,
			Err(_) => {
				let err = std::io::Error::last_os_error();
				if err.kind() == std::io::ErrorKind::Interrupted {
					continue;
				}
				crate::error!("uevent socket read failed: {}", err);
				unsafe { libc::close(fd) };
				return;
			}
		};

		match creds {
			Some(c) if c.uid == 0 => {}
			Some(c) => {
				crate::warn!("dropping uevent from uid {}", c.uid);
				continue;
			}
			None => {
				crate::warn!("dropping uevent without credentials");
				continue;
			}
		}

		match parse_frame(&buf[..n], &config) {
			Ok((action, event)) => {
				if tx.send(crate::eventloop::LoopMsg::Uevent(action, event)).is_err() {
					unsafe { libc::close(fd) };
					return;
				}
			}
			Err(_) => {
				crate::warn!("dropping malformed uevent frame");
			}
		}
	}
}
