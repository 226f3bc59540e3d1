// SPDX-License-Identifier: GPL-2.0

//! Daemon logging and debugging system

use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::sync::Mutex;

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
	Error = 0,
	Warning = 1,
	Notice = 2,
	Info = 3,
	Debug = 4,
}

impl LogLevel {
	pub fn as_str(&self) -> &'static str {
		match self {
			LogLevel::Error => "ERROR",
			LogLevel::Warning => "WARN",
			LogLevel::Notice => "NOTICE",
			LogLevel::Info => "INFO",
			LogLevel::Debug => "DEBUG",
		}
	}
}

/// Log entry structure
#[derive(Debug, Clone)]
pub struct LogEntry {
	pub level: LogLevel,
	pub timestamp: u64,
	pub module: String,
	pub message: String,
}

impl LogEntry {
	pub fn format(&self) -> String {
		format!(
			"[{:>6}] [{:>10}] {}: {}",
			self.level.as_str(),
			self.timestamp,
			self.module,
			self.message
		)
	}
}

/// Logger configuration
#[derive(Debug)]
pub struct LoggerConfig {
	pub min_level: LogLevel,
	pub max_entries: usize,
	pub stderr_output: bool,
}

impl LoggerConfig {
	pub fn new() -> Self {
		Self {
			min_level: LogLevel::Info,
			max_entries: 1000,
			stderr_output: true,
		}
	}

	pub fn with_level(mut self, level: LogLevel) -> Self {
		self.min_level = level;
		self
	}

	pub fn with_max_entries(mut self, max: usize) -> Self {
		self.max_entries = max;
		self
	}

	pub fn with_stderr(mut self, enabled: bool) -> Self {
		self.stderr_output = enabled;
		self
	}
}

impl Default for LoggerConfig {
	fn default() -> Self {
		Self::new()
	}
}

/// Daemon logger
pub struct Logger {
	config: LoggerConfig,
	entries: Vec<LogEntry>,
	total_entries: u64,
	dropped_entries: u64,
}

impl Logger {
	pub const fn new() -> Self {
		Self {
			config: LoggerConfig {
				min_level: LogLevel::Info,
				max_entries: 1000,
				stderr_output: true,
			},
			entries: Vec::new(),
			total_entries: 0,
			dropped_entries: 0,
		}
	}

	pub fn init(&mut self, config: LoggerConfig) {
		self.config = config;
	}

	pub fn log(&mut self, level: LogLevel, module: &str, message: &str) {
		if level > self.config.min_level {
			return;
		}

		let timestamp = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_secs())
			.unwrap_or(0);

		let entry = LogEntry {
			level,
			timestamp,
			module: module.into(),
			message: message.into(),
		};

		self.total_entries += 1;

		if self.config.stderr_output {
			let _ = writeln!(std::io::stderr(), "{}", entry.format());
		}

		if self.entries.len() >= self.config.max_entries {
			self.entries.remove(0);
			self.dropped_entries += 1;
		}
		self.entries.push(entry);
	}

	pub fn entries(&self) -> &[LogEntry] {
		&self.entries
	}

	pub fn set_level(&mut self, level: LogLevel) {
		self.config.min_level = level;
	}

	pub fn dump_buffer(&self) -> String {
		let mut output = String::new();
		for entry in &self.entries {
			output.push_str(&entry.format());
			output.push('\n');
		}
		output
	}
}

/// Global daemon logger
static LOGGER: Mutex<Option<Logger>> = Mutex::new(None);

/// Initialize the logging system
pub fn init_logging(config: LoggerConfig) {
	let mut logger = LOGGER.lock();
	let mut l = Logger::new();
	l.init(config);
	*logger = Some(l);
}

/// Main logging function
pub fn log(level: LogLevel, module: &str, message: &str) {
	let mut logger = LOGGER.lock();
	if let Some(ref mut l) = *logger {
		l.log(level, module, message);
	}
}

pub fn log_error(module: &str, message: &str) {
	log(LogLevel::Error, module, message);
}

pub fn log_warning(module: &str, message: &str) {
	log(LogLevel::Warning, module, message);
}

pub fn log_notice(module: &str, message: &str) {
	log(LogLevel::Notice, module, message);
}

pub fn log_info(module: &str, message: &str) {
	log(LogLevel::Info, module, message);
}

pub fn log_debug(module: &str, message: &str) {
	log(LogLevel::Debug, module, message);
}

/// Set log level at runtime
pub fn set_log_level(level: LogLevel) {
	let mut logger = LOGGER.lock();
	if let Some(ref mut l) = *logger {
		l.set_level(level);
	}
}

/// Dump the in-memory buffer of recent entries
pub fn dump_log_buffer() -> String {
	let logger = LOGGER.lock();
	if let Some(ref l) = *logger {
		l.dump_buffer()
	} else {
		"Logging system not initialized".into()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ring_buffer_drops_oldest() {
		let mut l = Logger::new();
		l.init(LoggerConfig::new()
			.with_level(LogLevel::Debug)
			.with_max_entries(2)
			.with_stderr(false));
		l.log(LogLevel::Info, "t", "one");
		l.log(LogLevel::Info, "t", "two");
		l.log(LogLevel::Info, "t", "three");
		assert_eq!(l.entries().len(), 2);
		assert_eq!(l.entries()[0].message, "two");
		assert_eq!(l.dropped_entries, 1);
	}

	#[test]
	fn level_filter_suppresses_debug() {
		let mut l = Logger::new();
		l.init(LoggerConfig::new()
			.with_level(LogLevel::Info)
			.with_stderr(false));
		l.log(LogLevel::Debug, "t", "hidden");
		assert!(l.entries().is_empty());
	}
}
