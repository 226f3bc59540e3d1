// SPDX-License-Identifier: GPL-2.0

//! Daemon entry point

use hald::config::{self, DaemonConfig};
use hald::eventloop::Daemon;
use hald::fdi::RuleBook;
use hald::ipc::LoggingBus;
use hald::logging::{self, LogLevel, LoggerConfig};

fn main() {
	let mut verbose = false;
	for arg in std::env::args().skip(1) {
		match arg.as_str() {
			"--verbose" => verbose = true,
			"--version" => {
				println!("{} {}", hald::NAME, hald::VERSION);
				return;
			}
			"--help" => {
				println!("usage: hald [--verbose] [--version]");
				println!();
				println!("Hardware abstraction daemon. Configuration is taken from");
				println!("HALD_* environment variables; see config.rs for the set.");
				return;
			}
			other => {
				eprintln!("unknown option: {}", other);
				std::process::exit(1);
			}
		}
	}

	let level = if verbose { LogLevel::Debug } else { LogLevel::Info };
	logging::init_logging(LoggerConfig::new().with_level(level));

	let daemon_config = DaemonConfig::new().from_env();
	config::set_config(daemon_config.clone());
	hald::info!("{} {} starting", hald::NAME, hald::VERSION);

	// rule files are parsed by the external fdi parser; none wired in
	// means the daemon runs with an empty rule book
	let rules = RuleBook::empty();

	let (mut daemon, rx) = Daemon::new(daemon_config, rules, Box::new(LoggingBus));
	daemon.spawn_sources();
	daemon.startup();
	daemon.run(rx);
}
