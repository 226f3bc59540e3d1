// SPDX-License-Identifier: GPL-2.0

//! Firmware backends: ACPI, APM, and PMU power/thermal/button state

pub mod acpi;
pub mod apm;
pub mod battery;
pub mod pmu;

use std::time::{Duration, Instant};

use crate::config::DaemonConfig;
use crate::hotplug::{FirmwareKind, HotplugEvent};
use crate::store::DeviceStore;

/// A condition signal raised by a backend refresh, forwarded over the bus
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
	pub udi: String,
	pub name: String,
	pub detail: String,
}

/// One registered firmware backend with its poll schedule.
#[derive(Debug)]
pub struct Backend {
	pub kind: FirmwareKind,
	pub poll_interval: Duration,
	pub next_poll: Instant,
}

impl Backend {
	fn new(kind: FirmwareKind, poll_interval: Duration) -> Self {
		Self {
			kind,
			poll_interval,
			next_poll: Instant::now() + poll_interval,
		}
	}

	pub fn reschedule(&mut self) {
		self.next_poll = Instant::now() + self.poll_interval;
	}
}

/// Probe which firmware namespaces exist and register a backend for each.
pub fn register_backends(config: &DaemonConfig) -> Vec<Backend> {
	let mut backends = Vec::new();
	if acpi::detect(config) {
		crate::info!("ACPI namespace found");
		backends.push(Backend::new(FirmwareKind::Acpi, config.acpi_poll_interval));
	}
	if apm::detect(config) {
		crate::info!("APM namespace found");
		backends.push(Backend::new(FirmwareKind::Apm, config.apm_poll_interval));
	}
	if pmu::detect(config) {
		crate::info!("PMU namespace found");
		backends.push(Backend::new(FirmwareKind::Pmu, config.pmu_poll_interval));
	}
	backends
}

/// Initial add events for every object a backend discovered.
pub fn coldplug_events(kind: FirmwareKind, config: &DaemonConfig) -> Vec<HotplugEvent> {
	match kind {
		FirmwareKind::Acpi => acpi::coldplug_events(config),
		FirmwareKind::Apm => apm::coldplug_events(config),
		FirmwareKind::Pmu => pmu::coldplug_events(config),
	}
}

/// One poll tick: re-read per-object state files and mutate properties in
/// place. Returns the conditions to emit. A poller error is logged and
/// retried on the next tick.
pub fn poll(kind: FirmwareKind, config: &DaemonConfig, gdl: &mut DeviceStore) -> Vec<Condition> {
	match kind {
		FirmwareKind::Acpi => acpi::poll(config, gdl),
		FirmwareKind::Apm => apm::poll(config, gdl),
		FirmwareKind::Pmu => pmu::poll(config, gdl),
	}
}
