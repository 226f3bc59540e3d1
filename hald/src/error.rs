// SPDX-License-Identifier: GPL-2.0

//! Error handling types and utilities

use core::fmt;
use std::io;

/// How a helper process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
	/// Exited on its own with a status code
	Normal,
	/// Killed after exceeding its deadline
	Timeout,
	/// Killed because the target device went away
	Killed,
	/// Terminated by an unexpected signal, or never ran
	Crashed,
}

impl fmt::Display for ExitKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ExitKind::Normal => write!(f, "normal"),
			ExitKind::Timeout => write!(f, "timeout"),
			ExitKind::Killed => write!(f, "killed"),
			ExitKind::Crashed => write!(f, "crashed"),
		}
	}
}

/// Daemon error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
	/// Unknown UDI or sysfs path
	NotFound,
	/// No ancestor device present in the store
	NoParent,
	/// Property type mismatch on get
	WrongType,
	/// A probe helper failed
	HelperFailed(ExitKind),
	/// The handler declined to probe this device
	ProbeSkipped,
	/// Preprobe rules merged info.ignore=true
	Ignored,
	/// Computed UDI already refers to an equivalent live device
	Duplicate,
	/// Malformed uevent frame or rule file
	ParseError,
	/// Underlying I/O error
	Io,
	/// Invalid argument
	InvalidArgument,
	/// Resource already exists
	AlreadyExists,
	/// Resource busy
	Busy,
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::NotFound => write!(f, "Resource not found"),
			Error::NoParent => write!(f, "No parent device present"),
			Error::WrongType => write!(f, "Property type mismatch"),
			Error::HelperFailed(kind) => write!(f, "Helper failed ({})", kind),
			Error::ProbeSkipped => write!(f, "Probe skipped"),
			Error::Ignored => write!(f, "Device ignored by preprobe rules"),
			Error::Duplicate => write!(f, "Duplicate device identity"),
			Error::ParseError => write!(f, "Parse error"),
			Error::Io => write!(f, "I/O error"),
			Error::InvalidArgument => write!(f, "Invalid argument"),
			Error::AlreadyExists => write!(f, "Resource already exists"),
			Error::Busy => write!(f, "Resource busy"),
		}
	}
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Self {
		match e.kind() {
			io::ErrorKind::NotFound => Error::NotFound,
			_ => Error::Io,
		}
	}
}

/// Daemon result type
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn io_not_found_maps_to_not_found() {
		let e = io::Error::new(io::ErrorKind::NotFound, "gone");
		assert_eq!(Error::from(e), Error::NotFound);
	}

	#[test]
	fn helper_failed_formats_exit_kind() {
		let s = format!("{}", Error::HelperFailed(ExitKind::Timeout));
		assert!(s.contains("timeout"));
	}
}
