// SPDX-License-Identifier: GPL-2.0

//! Reference probe helper: reports its context and succeeds.
//!
//! Useful for exercising the runner contract end to end.

use probes::{HelperContext, EXIT_FAILURE, EXIT_SUCCESS};

fn main() {
	let ctx = match HelperContext::from_env() {
		Some(ctx) => ctx,
		None => {
			eprintln!("probe-dummy: no UDI in environment");
			std::process::exit(EXIT_FAILURE);
		}
	};

	eprintln!("probe-dummy: probing {}", ctx.udi);
	if let Some(path) = ctx.sysfs_path() {
		eprintln!("probe-dummy: sysfs path {}", path);
	}
	std::process::exit(EXIT_SUCCESS);
}
