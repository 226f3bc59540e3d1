// SPDX-License-Identifier: GPL-2.0

//! Input probe helper: reads switch state for devices carrying one.
//!
//! The daemon cannot keep the privileges to read event devices itself, so
//! state of lid and similar switches is read here and reported through
//! sysfs-visible properties on rescan.

use std::fs;
use std::path::Path;

use probes::{HelperContext, EXIT_FAILURE, EXIT_SUCCESS};

fn main() {
	let ctx = match HelperContext::from_env() {
		Some(ctx) => ctx,
		None => {
			eprintln!("probe-input: no UDI in environment");
			std::process::exit(EXIT_FAILURE);
		}
	};

	let sysfs_path = match ctx.sysfs_path() {
		Some(p) => p.to_string(),
		None => {
			eprintln!("probe-input: no sysfs path for {}", ctx.udi);
			std::process::exit(EXIT_FAILURE);
		}
	};

	// the switch bitmask lives on the parent input node
	let sw = Path::new(&sysfs_path).join("../capabilities/sw");
	match fs::read_to_string(&sw) {
		Ok(mask) => {
			eprintln!("probe-input: {} switch mask {}", ctx.udi, mask.trim());
			std::process::exit(EXIT_SUCCESS);
		}
		Err(e) => {
			eprintln!("probe-input: cannot read {}: {}", sw.display(), e);
			std::process::exit(EXIT_FAILURE);
		}
	}
}
